//! Subcommand definitions, mirroring the teacher's one-`Opts`-struct-per-
//! verb pattern (`lib/src/cli.rs`) rather than a single flat flag bag.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use fn_error_context::context;

use ostree_deploy_core::bootloader;
use ostree_deploy_core::cleanup;
use ostree_deploy_core::kargs::KernelArgs;
use ostree_deploy_core::relabel::NullRelabelOracle;
use ostree_deploy_core::sysroot::{self, SysrootState};
use ostree_deploy_core::writer::{assign_bootserials, Writer};

use crate::objectstore::DirObjectStore;

/// A thin front end over the deployment engine: enough to check out a
/// commit, install it, and inspect/prune the result. No dependency
/// resolution, signature policy, or remote transport -- those are out of
/// scope for this binary (see `SPEC_FULL.md`).
#[derive(Debug, Parser)]
#[command(name = "ostree-deploy", version, about)]
pub struct Opt {
    /// Path to the physical sysroot root (defaults to `/`).
    #[arg(long, global = true, default_value = "/")]
    pub sysroot: Utf8PathBuf,

    /// Subcommand to run.
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the loaded sysroot state: bootversion, deployments, booted index.
    Status(StatusOpts),
    /// Check out a commit from a directory-backed object store and install
    /// it as the new default deployment.
    Deploy(DeployOpts),
    /// Run cleanup against the currently loaded state.
    Cleanup(CleanupOpts),
    /// Edit a deployment's kernel arguments in place.
    Kargs(KargsOpts),
}

/// No options: status always reflects the currently loaded state.
#[derive(Debug, Parser)]
pub struct StatusOpts {}

/// Options for the `deploy` subcommand.
#[derive(Debug, Parser)]
pub struct DeployOpts {
    /// Directory-backed object store root (see [`DirObjectStore`]).
    #[arg(long)]
    pub repo: Utf8PathBuf,
    /// osname to deploy under.
    pub osname: String,
    /// Commit (directory name under `--repo`) to check out.
    pub commit: String,
}

/// Options for the `cleanup` subcommand.
#[derive(Debug, Parser)]
pub struct CleanupOpts {
    /// Directory-backed object store root, for the prune call.
    #[arg(long)]
    pub repo: Utf8PathBuf,
}

/// Options for the `kargs` subcommand.
#[derive(Debug, Parser)]
pub struct KargsOpts {
    /// osname of the deployment to edit.
    pub osname: String,
    /// Commit checksum of the deployment to edit.
    pub csum: String,
    /// Deployserial of the deployment to edit.
    pub deployserial: u32,
    /// Append `key` or `key=value` (repeatable).
    #[arg(long = "append")]
    pub append: Vec<String>,
    /// Delete every occurrence of `key` (repeatable).
    #[arg(long = "delete")]
    pub delete: Vec<String>,
}

/// Parse `argv` and dispatch to the matching subcommand.
pub fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    let physical_root = sysroot::open_physical_root(&opt.sysroot)
        .with_context(|| format!("opening sysroot at {}", opt.sysroot))?;
    let running_root = sysroot::running_root_dev_ino().context("statting /")?;

    match opt.cmd {
        Command::Status(_) => {
            let state = SysrootState::load(&physical_root, running_root).context("loading sysroot state")?;
            print_status(&state);
            Ok(())
        }
        Command::Deploy(deploy_opts) => run_deploy(&opt.sysroot, &deploy_opts, running_root),
        Command::Cleanup(cleanup_opts) => run_cleanup(&opt.sysroot, &cleanup_opts, running_root),
        Command::Kargs(kargs_opts) => run_kargs(&opt.sysroot, &kargs_opts),
    }
}

/// Cap on the number of deployments printed directly; sysroots with more
/// than this (stale cleanup backlog, pathological test fixtures) get a
/// truncated listing instead of scrolling the terminal off a cliff.
const STATUS_DISPLAY_LIMIT: usize = 50;

fn print_status(state: &SysrootState) {
    println!(
        "bootversion: {} (subbootversion {})",
        state.bootversion, state.subbootversion
    );
    let entries = state.deployments.iter().enumerate();
    let Some((shown, remainder)) =
        ostree_deploy_utils::iterators::iterator_split_nonempty_rest_count(entries, STATUS_DISPLAY_LIMIT)
    else {
        return;
    };
    for (i, d) in shown {
        let marker = if state.booted == Some(i) { "*" } else { " " };
        println!(
            "{marker} {} {}.{} (bootcsum {})",
            d.osname, d.csum, d.deployserial, d.bootcsum
        );
    }
    if remainder > 0 {
        println!("... and {remainder} more");
    }
}

#[context("Deploying commit")]
fn run_deploy(sysroot_path: &Utf8Path, deploy_opts: &DeployOpts, running_root: Option<(u64, u64)>) -> Result<()> {
    let physical_root = sysroot::open_physical_root(sysroot_path)?;
    let _lock = ostree_deploy_core::sysroot::SysrootLock::acquire(&physical_root).context("acquiring sysroot lock")?;

    let state = SysrootState::load(&physical_root, running_root)?;
    let store = DirObjectStore::open(&deploy_opts.repo)?;

    let deployserial = next_deployserial(&state, &deploy_opts.osname, &deploy_opts.commit);
    let checkout_path = format!(
        "ostree/deploy/{}/deploy/{}.{deployserial}",
        deploy_opts.osname, deploy_opts.commit
    );
    physical_root.create_dir_all(&checkout_path)?;
    let target_dir = physical_root.open_dir(checkout_path.as_str())?;
    store.checkout(&deploy_opts.commit, &target_dir)?;

    let files = ostree_deploy_core::kernel::find_kernel(&target_dir)?;
    let bootcsum = ostree_deploy_core::kernel::compute_bootcsum(&target_dir, &files)?;

    let mut bootconfig = ostree_deploy_core::bootconfig::BootConfig::new();
    bootconfig.parse("")?;
    bootconfig.set("options", "quiet");

    let new_deployment = ostree_deploy_core::deployment::Deployment {
        osname: deploy_opts.osname.clone(),
        csum: deploy_opts.commit.clone(),
        deployserial,
        bootcsum,
        bootserial: 0,
        bootconfig,
        origin: ostree_deploy_core::deployment::Origin {
            refspec: format!("deploy:{}", deploy_opts.commit),
            ..Default::default()
        },
        unlocked: ostree_deploy_core::deployment::UnlockedState::None,
    };

    let mut new_deployments = vec![new_deployment];
    new_deployments.extend(state.deployments.iter().cloned());
    assign_bootserials(&mut new_deployments);

    let bootloader = bootloader::probe(&physical_root)?;
    let relabel = NullRelabelOracle;
    let writer = Writer {
        physical_root: &physical_root,
        objectstore: &store,
        relabel: &relabel,
        bootloader,
        debug: ostree_deploy_core::config::SysrootDebugFlags::from_env(),
        cancel: Default::default(),
    };
    let outcome = writer.write(&state, new_deployments)?;
    println!(
        "deployed {}/{}: bootconfig-swap={} deployments-delta={:+}",
        deploy_opts.osname, deploy_opts.commit, outcome.bootconfig_swap, outcome.deployment_delta
    );
    Ok(())
}

fn next_deployserial(state: &SysrootState, osname: &str, csum: &str) -> u32 {
    state
        .deployments
        .iter()
        .filter(|d| d.osname == osname && d.csum == csum)
        .map(|d| d.deployserial + 1)
        .max()
        .unwrap_or(0)
}

#[context("Cleaning up sysroot")]
fn run_cleanup(sysroot_path: &Utf8Path, cleanup_opts: &CleanupOpts, running_root: Option<(u64, u64)>) -> Result<()> {
    let physical_root = sysroot::open_physical_root(sysroot_path)?;
    let _lock = ostree_deploy_core::sysroot::SysrootLock::acquire(&physical_root)?;
    let state = SysrootState::load(&physical_root, running_root)?;
    let store = DirObjectStore::open(&cleanup_opts.repo)?;

    let report = cleanup::cleanup(
        &physical_root,
        &store,
        &state.deployments,
        state.bootversion,
        state.bootversion,
        running_root,
        &ostree_deploy_core::cancel::CancellationToken::new(),
    )?;
    for (path, reason) in &report.actions {
        println!("{path}: {reason:?}");
    }
    println!(
        "object store prune: {} objects, {} bytes freed",
        report.store_stats.objects_pruned, report.store_stats.size_freed
    );
    Ok(())
}

#[context("Editing kernel arguments")]
fn run_kargs(sysroot_path: &Utf8Path, kargs_opts: &KargsOpts) -> Result<()> {
    let physical_root = sysroot::open_physical_root(sysroot_path)?;
    let _lock = ostree_deploy_core::sysroot::SysrootLock::acquire(&physical_root)?;
    let state = SysrootState::load(&physical_root, None)?;

    let index = state
        .deployments
        .iter()
        .position(|d| d.osname == kargs_opts.osname && d.csum == kargs_opts.csum && d.deployserial == kargs_opts.deployserial)
        .ok_or_else(|| anyhow::anyhow!("no such deployment"))?;
    let d = &state.deployments[index];

    let mut args = KernelArgs::parse(d.bootconfig.get("options").unwrap_or_default());
    for spec in &kargs_opts.append {
        match spec.split_once('=') {
            Some((k, v)) => args.append(k, Some(v.to_string())),
            None => args.append(spec.as_str(), None),
        }
    }
    for key in &kargs_opts.delete {
        args.delete_all(key);
    }

    let entry_path = format!("boot/loader.{}/entries/ostree-{}-{index}.conf", state.bootversion, d.osname);
    let mut bootconfig = d.bootconfig.clone();
    bootconfig.set("options", args.serialize());
    let entries_dir = physical_root.open_dir(
        format!("boot/loader.{}/entries", state.bootversion).as_str(),
    )?;
    bootconfig.write_at(&entries_dir, Utf8Path::new(&format!("ostree-{}-{index}.conf", d.osname)))?;
    println!("updated {entry_path}");
    Ok(())
}
