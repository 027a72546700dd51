//! Writer: the central transaction (§4.10, §4.11).
//!
//! Consumes a loaded [`SysrootState`] and a new deployment vector, and
//! produces an on-disk state observationally equivalent (via the loader)
//! to that vector, with exactly one atomic cutover.
#![allow(unsafe_code)] // borrowing raw fds for set_immutable, and the global sync() at cutover

use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, BorrowedFd};

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::bootlink;
use crate::bootloader::BootloaderKind;
use crate::cancel::CancellationToken;
use crate::config::SysrootDebugFlags;
use crate::configmerge;
use crate::deployment::Deployment;
use crate::error::{Error, Result};
use crate::kargs::KernelArgs;
use crate::kernel;
use crate::logging;
use crate::objectstore::ObjectStore;
use crate::path::{set_immutable, syncfs};
use crate::relabel::{self, RelabelOracle};
use crate::sysroot::SysrootState;

/// Summary of what a [`Writer::write`] call did, feeding the
/// `ostree.deployment-complete` log line (§7, §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Whether the bootloader's own config (and `boot/loader` bootversion)
    /// was rewritten, as opposed to only the bootlink farm.
    pub bootconfig_swap: bool,
    /// `new_deployments.len() as i64 - old_deployments.len() as i64`.
    pub deployment_delta: i64,
}

/// Find the configuration-merge source for `osname` (`ostree_sysroot_
/// get_merge_deployment`): the booted deployment if its osname matches,
/// otherwise the first deployment in menu order belonging to `osname`
/// (the "pending" deployment), so an unbooted install (e.g. from an
/// installer) still merges against the most recent existing `/etc` for
/// that osname instead of skipping the merge entirely (see DESIGN.md).
fn find_merge_deployment<'a>(state: &'a SysrootState, osname: &str) -> Option<&'a Deployment> {
    if let Some(booted) = state.booted_deployment() {
        if booted.osname == osname {
            return Some(booted);
        }
    }
    state.deployments.iter().find(|d| d.osname == osname)
}

/// Assign each deployment's `bootserial` (§4.10): group by `bootcsum` in
/// the vector's iteration order, assigning serials starting at 0 within
/// each group in order of appearance.
pub fn assign_bootserials(deployments: &mut [Deployment]) {
    let mut next: BTreeMap<String, u32> = BTreeMap::new();
    for d in deployments.iter_mut() {
        let serial = next.entry(d.bootcsum.clone()).or_insert(0);
        d.bootserial = *serial;
        *serial += 1;
    }
}

/// Whether the bootloader configuration needs to change at all (§4.11
/// fast path): the new deployment count must match the old one exactly,
/// and each new deployment must be `deployment_bootconfigs_equal` to the
/// old deployment at the same index. A mismatch in either length or any
/// pairwise comparison forces a bootversion rotation.
fn needs_bootversion_rotation(state: &SysrootState, new_deployments: &[Deployment]) -> bool {
    if new_deployments.len() != state.deployments.len() {
        return true;
    }
    new_deployments
        .iter()
        .zip(state.deployments.iter())
        .any(|(new, old)| !deployment_bootconfigs_equal(new, old))
}

/// `ostree_sysroot`'s `deployment_bootconfigs_equal`: same bootcsum, and
/// the same kernel arguments once any `ostree=` token (which always
/// differs across bootversions) is stripped from both sides.
fn deployment_bootconfigs_equal(a: &Deployment, b: &Deployment) -> bool {
    if a.bootcsum != b.bootcsum {
        return false;
    }
    strip_ostree_karg(a.bootconfig.get("options").unwrap_or_default())
        == strip_ostree_karg(b.bootconfig.get("options").unwrap_or_default())
}

fn strip_ostree_karg(options: &str) -> String {
    let mut kargs = KernelArgs::parse(options);
    kargs.delete_all("ostree");
    kargs.serialize()
}

/// The writer's collaborators, borrowed for the duration of one
/// [`Writer::write`] call (§9: no persistent back-reference to the object
/// store is kept).
pub struct Writer<'a> {
    /// The opened physical sysroot directory.
    pub physical_root: &'a Dir,
    /// The content-addressed object store.
    pub objectstore: &'a dyn ObjectStore,
    /// The SELinux labeling oracle.
    pub relabel: &'a dyn RelabelOracle,
    /// The probed (or explicitly chosen) bootloader backend.
    pub bootloader: BootloaderKind,
    /// Parsed `OSTREE_SYSROOT_DEBUG` flags.
    pub debug: SysrootDebugFlags,
    /// Checked between filesystem operations (§5); a fresh, never-cancelled
    /// token if the caller doesn't care to cancel.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for Writer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("bootloader", &self.bootloader)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl<'a> Writer<'a> {
    /// Run the central transaction described in §4.11.
    pub fn write(&self, state: &SysrootState, mut new_deployments: Vec<Deployment>) -> Result<WriteOutcome> {
        self.cancel.check()?;
        self.check_preconditions(state, &new_deployments)?;
        assign_bootserials(&mut new_deployments);

        let rotate = needs_bootversion_rotation(state, &new_deployments);
        // On the very first write there is no live bootversion to protect by
        // toggling away from it, so the initial install lands directly on
        // `state.bootversion` (0) instead of its complement (§9, resolving
        // an ambiguity in the literal B' = 1 - B formula -- see DESIGN.md).
        let target_bootversion = if rotate && !state.deployments.is_empty() {
            1 - state.bootversion
        } else {
            state.bootversion
        };

        let _mount_guard = if rotate {
            Some(BootMountGuard::acquire()?)
        } else {
            None
        };

        self.cancel.check()?;
        self.install_new_deployments(state, &new_deployments)?;
        self.cancel.check()?;

        // Fast path: the bootloader config (entries + driver-specific
        // config) is left exactly as it is. Only the subbootversion farm
        // under the current bootversion is rebuilt and swapped (§4.11,
        // §9 Open Question).
        if rotate {
            self.render_entries(target_bootversion, &new_deployments)?;
        }

        let new_subbootversion = if rotate { 0 } else { 1 - state.subbootversion };
        bootlink::rebuild_farm(
            self.physical_root,
            target_bootversion,
            new_subbootversion,
            &new_deployments,
        )?;
        bootlink::swap_active(self.physical_root, target_bootversion, new_subbootversion)?;

        if rotate {
            self.bootloader
                .write_config(self.physical_root, target_bootversion, &new_deployments)?;
            // Past this point the new bootversion is fully built; cancelling
            // here would only leave it unreferenced and harmless for the
            // next write to rebuild, never corrupt. Once `cutover` renames
            // `boot/loader` (§4.11 step 10), cancellation is a no-op: the
            // visible state has already moved (§5).
            self.cancel.check()?;
            self.cutover(target_bootversion)?;
        } else {
            syncfs(self.physical_root)?;
        }

        if let Err(e) = self.bootloader.post_bls_sync(self.physical_root) {
            tracing::warn!("post-cutover bootloader sync failed (will retry next write): {e}");
        }

        let outcome = WriteOutcome {
            bootconfig_swap: rotate,
            deployment_delta: new_deployments.len() as i64 - state.deployments.len() as i64,
        };
        logging::log_deployment_complete(outcome.bootconfig_swap, outcome.deployment_delta);
        Ok(outcome)
    }

    fn check_preconditions(&self, state: &SysrootState, new_deployments: &[Deployment]) -> Result<()> {
        if let Some(booted) = state.booted_deployment() {
            if !new_deployments.iter().any(|d| d.identity_eq(booted)) {
                return Err(Error::NotBooted);
            }
        }
        for d in new_deployments {
            let path = d.checkout_path();
            let exists = self
                .physical_root
                .try_exists(path.as_std_path())
                .map_err(|e| Error::path_io(&path, e))?;
            if !exists {
                return Err(Error::MissingCheckout {
                    osname: d.osname.clone(),
                    csum: d.csum.clone(),
                    deployserial: d.deployserial,
                });
            }
        }
        Ok(())
    }

    /// For every deployment not already present (by identity) in the
    /// previously loaded state, run the one-time install steps: `/etc`
    /// config merge against that osname's merge deployment, the one-shot
    /// `/var` relabel, the deployment root's immutable flag, and the origin
    /// file.
    fn install_new_deployments(&self, state: &SysrootState, new_deployments: &[Deployment]) -> Result<()> {
        for d in new_deployments {
            self.cancel.check()?;
            if state.deployments.iter().any(|existing| existing.identity_eq(d)) {
                continue;
            }
            let checkout_path = d.checkout_path();
            let new_root = self
                .physical_root
                .open_dir(checkout_path.as_std_path())
                .map_err(|e| Error::path_io(&checkout_path, e))?;

            let merge_source = find_merge_deployment(state, &d.osname);
            let prev_root = merge_source
                .map(|p| {
                    self.physical_root
                        .open_dir(p.checkout_path().as_std_path())
                        .map_err(|e| Error::path_io(&p.checkout_path(), e))
                })
                .transpose()?;
            configmerge::merge(&new_root, d, prev_root.as_ref(), self.relabel, self.debug)?;

            let var_path = Utf8Path::new("ostree/deploy").join(&d.osname).join("var");
            self.physical_root
                .create_dir_all(var_path.as_std_path())
                .map_err(|e| Error::path_io(&var_path, e))?;
            let var_dir = self
                .physical_root
                .open_dir(var_path.as_std_path())
                .map_err(|e| Error::path_io(&var_path, e))?;
            relabel::relabel_var_once(&var_dir, &d.osname, &d.csum, self.relabel)?;

            let should_be_immutable = !d.unlocked.is_mutable() && !self.debug.mutable_deployments;
            let borrowed: BorrowedFd<'_> = unsafe { BorrowedFd::borrow_raw(new_root.as_raw_fd()) };
            set_immutable(&borrowed, should_be_immutable)?;

            let origin_path = Utf8Path::new("ostree/deploy")
                .join(&d.osname)
                .join("deploy")
                .join(d.origin_filename());
            self.physical_root
                .atomic_write(origin_path.as_std_path(), d.origin.to_string_serialized().as_bytes())
                .map_err(|e| Error::path_io(&origin_path, e))?;
        }
        Ok(())
    }

    /// Stage each deployment's kernel and (re-)write its bootloader entry
    /// under `boot/loader.<target_bootversion>/entries/` (§4.11 steps 3-4).
    /// Only called on the slow (rotating) path: `target_bootversion` is
    /// then the not-yet-live bootversion, so rebuilding its `entries`
    /// directory in place is safe -- the fast path never reaches here
    /// (§4.11 fast path leaves existing entry files untouched).
    fn render_entries(&self, target_bootversion: u8, new_deployments: &[Deployment]) -> Result<()> {
        let entries_path = format!("boot/loader.{target_bootversion}/entries");

        self.physical_root
            .remove_all_optional(&entries_path)
            .map_err(|e| Error::path_io(Utf8Path::new(&entries_path), e))?;
        self.physical_root
            .create_dir_all(&entries_path)
            .map_err(|e| Error::path_io(Utf8Path::new(&entries_path), e))?;
        let entries_dir = self
            .physical_root
            .open_dir(&entries_path)
            .map_err(|e| Error::path_io(Utf8Path::new(&entries_path), e))?;

        let n = new_deployments.len();
        for (index, d) in new_deployments.iter().enumerate() {
            self.cancel.check()?;
            self.render_one_entry(target_bootversion, index, n, d, &entries_dir)?;
        }
        Ok(())
    }

    fn render_one_entry(
        &self,
        target_bootversion: u8,
        index: usize,
        n_deployments: usize,
        d: &Deployment,
        entries_dir: &Dir,
    ) -> Result<()> {
        let checkout_path = d.checkout_path();
        let deployment_root = self
            .physical_root
            .open_dir(checkout_path.as_std_path())
            .map_err(|e| Error::path_io(&checkout_path, e))?;

        let files = kernel::find_kernel(&deployment_root)?;
        kernel::stage(self.physical_root, &deployment_root, &d.osname, &d.bootcsum, &files)?;

        let stage_dir = kernel::staging_dir(&d.osname, &d.bootcsum);
        let linux = stage_dir.join("vmlinuz");
        let initrd = files.initramfs.as_ref().map(|_| stage_dir.join("initramfs"));
        let devicetree = files.devicetree.as_ref().map(|_| stage_dir.join("devicetree"));

        let commit_meta = self.objectstore.load_commit_metadata(&d.csum)?;
        let title = synthesize_title(&deployment_root, &d.osname, index, commit_meta.version.as_deref());

        let mut kargs = KernelArgs::parse(d.bootconfig.get("options").unwrap_or_default());
        let ostree_arg = format!("/ostree/boot.{target_bootversion}/{}/{}/{}", d.osname, d.bootcsum, d.bootserial);
        if kargs.last_value("ostree").is_some() {
            kargs.replace("ostree", Some(ostree_arg));
        } else {
            kargs.append("ostree", Some(ostree_arg));
        }

        let mut bootconfig = d.bootconfig.clone();
        bootconfig.set("title", title);
        bootconfig.set("version", (n_deployments - index).to_string());
        bootconfig.set("linux", format!("/{linux}"));
        if let Some(initrd) = &initrd {
            bootconfig.set("initrd", format!("/{initrd}"));
        }
        if let Some(devicetree) = &devicetree {
            bootconfig.set("devicetree", format!("/{devicetree}"));
        }
        bootconfig.set("options", kargs.serialize());

        let entry_name = format!("ostree-{}-{}.conf", d.osname, index);
        bootconfig.write_at(entries_dir, Utf8Path::new(&entry_name))?;
        Ok(())
    }

    /// §4.11 steps 8-11: the atomic visible cutover.
    fn cutover(&self, target_bootversion: u8) -> Result<()> {
        crate::path::symlink_replace(
            self.physical_root,
            Utf8Path::new(&format!("loader.{target_bootversion}")),
            Utf8Path::new("boot/loader.tmp"),
        )?;
        syncfs(self.physical_root)?;
        if let Some(boot) = self
            .physical_root
            .open_dir_optional("boot")
            .map_err(|e| Error::path_io(Utf8Path::new("boot"), e))?
        {
            syncfs(&boot)?;
        }
        // Global sync() bounds the pre-power-loss window beyond the two
        // syncfs calls above; a design choice, not an artifact (§9).
        unsafe { libc::sync() };

        self.physical_root
            .rename("boot/loader.tmp", self.physical_root, "boot/loader")
            .map_err(|e| Error::path_io(Utf8Path::new("boot/loader"), e))?;

        if let Some(boot) = self
            .physical_root
            .open_dir_optional("boot")
            .map_err(|e| Error::path_io(Utf8Path::new("boot"), e))?
        {
            let borrowed: BorrowedFd<'_> = unsafe { BorrowedFd::borrow_raw(boot.as_raw_fd()) };
            rustix::fs::fsync(borrowed).map_err(|e| Error::path_io(Utf8Path::new("boot"), e.into()))?;
        }
        Ok(())
    }
}

/// Scoped guard for the `/boot` remount-rw-on-entry step of §4.11 step 1,
/// restoring read-only on drop. A no-op when `/boot` isn't its own mount
/// (or doesn't exist, as in tests running against a plain tempdir).
struct BootMountGuard {
    _inner: Option<crate::path::WritableMountGuard>,
}

impl BootMountGuard {
    fn acquire() -> Result<Self> {
        let boot = Utf8Path::new("/boot");
        if !boot.exists() {
            return Ok(Self { _inner: None });
        }
        Ok(Self {
            _inner: Some(crate::path::WritableMountGuard::acquire(boot)?),
        })
    }
}

/// Derive a bootloader-entry `title` by combining the deployment's
/// `os-release` `PRETTY_NAME` (falling back to `ID`), the commit's
/// optional `version`, and an `(ostree:<osname>:<index>)` marker so the
/// config emitter can recognize ostree-owned entries (§4.11 step b).
fn synthesize_title(deployment_root: &Dir, osname: &str, index: usize, commit_version: Option<&str>) -> String {
    let release = read_os_release_name(deployment_root).unwrap_or_else(|| "Unknown".to_string());
    let mut title = release;
    if let Some(v) = commit_version {
        title.push(' ');
        title.push_str(v);
    }
    title.push_str(&format!(" (ostree:{osname}:{index})"));
    title
}

fn read_os_release_name(deployment_root: &Dir) -> Option<String> {
    for path in ["usr/lib/os-release", "etc/os-release"] {
        if let Ok(contents) = deployment_root.read_to_string(path) {
            let fields: BTreeMap<&str, &str> = contents
                .lines()
                .filter_map(|l| l.split_once('='))
                .map(|(k, v)| (k, v.trim_matches('"')))
                .collect();
            if let Some(v) = fields.get("PRETTY_NAME") {
                return Some(v.to_string());
            }
            if let Some(v) = fields.get("ID") {
                return Some(v.to_string());
            }
        }
    }
    None
}
