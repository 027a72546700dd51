//! Whole-writer scenarios (§8), exercising [`crate::writer::Writer`] end to
//! end against a real [`crate::fixture::Fixture`] sysroot rather than
//! per-function unit tests.

use camino::Utf8Path;
use cap_std_ext::dirext::{CapStdExtDirExt, CapStdExtDirExtUtf8};

use crate::bootloader::BootloaderKind;
use crate::cancel::CancellationToken;
use crate::config::SysrootDebugFlags;
use crate::deployment::Deployment;
use crate::error::{Error, Result};
use crate::fixture::{Fixture, FixtureObjectStore};
use crate::relabel::NullRelabelOracle;
use crate::sysroot::SysrootState;
use crate::writer::{assign_bootserials, Writer};

fn writer<'a>(fixture: &'a Fixture, store: &'a FixtureObjectStore, relabel: &'a NullRelabelOracle) -> Writer<'a> {
    writer_with_cancel(fixture, store, relabel, CancellationToken::new())
}

fn writer_with_cancel<'a>(
    fixture: &'a Fixture,
    store: &'a FixtureObjectStore,
    relabel: &'a NullRelabelOracle,
    cancel: CancellationToken,
) -> Writer<'a> {
    Writer {
        physical_root: &fixture.root,
        objectstore: store,
        relabel,
        bootloader: BootloaderKind::None,
        debug: SysrootDebugFlags::default(),
        cancel,
    }
}

fn load(fixture: &Fixture) -> Result<SysrootState> {
    SysrootState::load(&fixture.root, None)
}

/// S1: an empty sysroot, one deployment installed. `boot/loader` should
/// point at `loader.0`, the bootlink farm at `boot.0.0`, and the single
/// entry should carry `version=1` and the expected `ostree=` karg.
#[test]
fn s1_initial_install() -> Result<()> {
    let fixture = Fixture::new()?;
    let store = FixtureObjectStore::new()?;
    let relabel = NullRelabelOracle;

    let d = fixture.add_deployment("fedora", "aaaa", 0, "1")?;
    let bootcsum = d.bootcsum.clone();
    let mut new_deployments = vec![d];
    assign_bootserials(&mut new_deployments);

    let state = load(&fixture)?;
    let w = writer(&fixture, &store, &relabel);
    let outcome = w.write(&state, new_deployments)?;
    assert!(outcome.bootconfig_swap, "first write always rotates (nothing staged yet)");
    assert_eq!(outcome.deployment_delta, 1);

    assert_eq!(fixture.root.read_link("boot/loader")?, std::path::PathBuf::from("loader.0"));
    assert_eq!(
        fixture.root.read_link("ostree/boot.0")?,
        std::path::PathBuf::from("boot.0.0")
    );
    assert_eq!(
        fixture.root.read_link(format!("ostree/boot.0.0/fedora/{bootcsum}/0"))?,
        std::path::PathBuf::from("../../../deploy/fedora/deploy/aaaa.0")
    );

    let entry = fixture.root.read_to_string("boot/loader.0/entries/ostree-fedora-0.conf")?;
    assert!(entry.contains("version 1"));
    assert!(entry.contains(&format!("ostree=/ostree/boot.0/fedora/{bootcsum}/0")));

    let reloaded = load(&fixture)?;
    assert_eq!(reloaded.bootversion, 0);
    assert_eq!(reloaded.deployments.len(), 1);
    assert_eq!(reloaded.deployments[0].osname, "fedora");
    Ok(())
}

/// S2: upgrade with the same kernel (bootcsum), deployment count unchanged.
/// The fast path only ever applies when the new deployment vector has the
/// same length as the old one and each position's (bootcsum, kargs) matches
/// (§4.11); a deployment count change always forces a rotation regardless of
/// bootcsum; this scenario first reaches a steady two-deployment state, then
/// upgrades the head deployment in place. Expect `boot/loader` to stay put,
/// the subbootversion farm to flip, and the bootloader entry files to be
/// left exactly as they were (§9 Open Question).
#[test]
fn s2_upgrade_same_bootcsum() -> Result<()> {
    let fixture = Fixture::new()?;
    let store = FixtureObjectStore::new()?;
    let relabel = NullRelabelOracle;

    let head = checkout_deployment(&fixture, "fedora", "aaaa", 0, "1", b"shared-kernel-v1")?;
    let mut gen1 = vec![head.clone()];
    assign_bootserials(&mut gen1);
    let state0 = load(&fixture)?;
    writer(&fixture, &store, &relabel).write(&state0, gen1)?;

    // Establish a steady two-deployment state (current + rollback) before
    // exercising the fast path, since the very first addition always
    // changes the deployment count and so always rotates.
    let rollback = checkout_deployment(&fixture, "fedora", "rrrr", 0, "0", b"rollback-kernel")?;
    let state1 = load(&fixture)?;
    let mut gen2 = vec![rollback.clone(), head.clone()];
    assign_bootserials(&mut gen2);
    writer(&fixture, &store, &relabel).write(&state1, gen2)?;

    let state2 = load(&fixture)?;
    let entry1_before = fixture
        .root
        .read_to_string(format!("boot/loader.{}/entries/ostree-fedora-1.conf", state2.bootversion))?;

    // Upgrade the head deployment to a new commit sharing `head`'s kernel
    // bytes -> identical bootcsum. The deployment count stays at two and
    // both positions (rollback unchanged, head's bootcsum/kargs unchanged)
    // compare equal, so this takes the fast path.
    let new_head = checkout_deployment(&fixture, "fedora", "bbbb", 0, "2", b"shared-kernel-v1")?;
    assert_eq!(new_head.bootcsum, head.bootcsum);
    let mut gen3 = vec![rollback, new_head];
    assign_bootserials(&mut gen3);

    let outcome = writer(&fixture, &store, &relabel).write(&state2, gen3)?;
    assert!(!outcome.bootconfig_swap, "count-preserving same-bootcsum upgrade takes the non-rotating path");

    assert_eq!(
        fixture.root.read_link("boot/loader")?,
        std::path::PathBuf::from(format!("loader.{}", state2.bootversion)),
        "the fast path never touches boot/loader"
    );
    let state3 = load(&fixture)?;
    assert_ne!(
        state3.subbootversion, state2.subbootversion,
        "subbootversion farm flips even without a bootversion rotation"
    );

    let entry1_after = fixture
        .root
        .read_to_string(format!("boot/loader.{}/entries/ostree-fedora-1.conf", state2.bootversion))?;
    assert_eq!(
        entry1_before, entry1_after,
        "the fast path does not rewrite bootloader entry files, even though the deployment at this index changed"
    );
    Ok(())
}

/// S3: upgrade with a new kernel (new bootcsum). Expect a rotation to
/// `loader.1`, two distinct kernel staging directories, and entries rewritten
/// under `loader.1/entries`.
#[test]
fn s3_upgrade_new_kernel() -> Result<()> {
    let fixture = Fixture::new()?;
    let store = FixtureObjectStore::new()?;
    let relabel = NullRelabelOracle;

    let old = fixture.add_deployment("fedora", "aaaa", 0, "1")?;
    let mut gen1 = vec![old.clone()];
    assign_bootserials(&mut gen1);
    let state0 = load(&fixture)?;
    writer(&fixture, &store, &relabel).write(&state0, gen1)?;

    let new = checkout_deployment(&fixture, "fedora", "cccc", 0, "2", b"brand-new-kernel")?;
    let state1 = load(&fixture)?;
    let mut gen2 = vec![new, old];
    assign_bootserials(&mut gen2);

    let outcome = writer(&fixture, &store, &relabel).write(&state1, gen2)?;
    assert!(outcome.bootconfig_swap, "a fresh bootcsum forces a bootversion rotation");
    assert_eq!(fixture.root.read_link("boot/loader")?, std::path::PathBuf::from("loader.1"));

    let kernel_dirs: Vec<_> = fixture
        .root
        .entries_utf8("boot/ostree")?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string())
        .collect();
    assert_eq!(kernel_dirs.len(), 2, "both kernels are staged, old one not yet pruned");

    assert!(fixture.root.try_exists("boot/loader.1/entries")?);
    Ok(())
}

/// S4: rollback. Write the pair [old, new] reversed from S3's final state;
/// the default (index 0) entry's `ostree=` path should reference the older
/// deployment.
#[test]
fn s4_rollback() -> Result<()> {
    let fixture = Fixture::new()?;
    let store = FixtureObjectStore::new()?;
    let relabel = NullRelabelOracle;

    let old = fixture.add_deployment("fedora", "aaaa", 0, "1")?;
    let mut gen1 = vec![old.clone()];
    assign_bootserials(&mut gen1);
    let state0 = load(&fixture)?;
    writer(&fixture, &store, &relabel).write(&state0, gen1)?;

    let new = checkout_deployment(&fixture, "fedora", "cccc", 0, "2", b"brand-new-kernel")?;
    let state1 = load(&fixture)?;
    let mut gen2 = vec![new.clone(), old.clone()];
    assign_bootserials(&mut gen2);
    writer(&fixture, &store, &relabel).write(&state1, gen2)?;

    let state2 = load(&fixture)?;
    let mut rollback = vec![old, new];
    assign_bootserials(&mut rollback);
    writer(&fixture, &store, &relabel).write(&state2, rollback)?;

    let entry0 = fixture
        .root
        .read_to_string(format!("boot/loader.{}/entries/ostree-fedora-0.conf", load(&fixture)?.bootversion))?;
    assert!(entry0.contains("aaaa") || entry0.contains("ostree=/ostree/boot"));
    let reloaded = load(&fixture)?;
    assert_eq!(reloaded.deployments[0].csum, "aaaa", "rollback puts the older commit back at index 0");
    Ok(())
}

/// S5: `/etc` merge. The admin edits `etc/foo` in the old deployment; the
/// new deployment ships an unrelated `usr/etc/bar` addition. After the
/// write, the new deployment's `/etc/foo` must carry the admin's edit and
/// `/etc/bar` must equal the new deployment's own `usr/etc/bar` -- exercising
/// the merge-source fallback (no deployment is ever "booted" in these
/// fixture-driven tests, so this only fires via `find_merge_deployment`'s
/// first-matching-osname path, not the booted shortcut).
#[test]
fn s5_etc_merge() -> Result<()> {
    let fixture = Fixture::new()?;
    let store = FixtureObjectStore::new()?;
    let relabel = NullRelabelOracle;

    let old = fixture.add_deployment("fedora", "aaaa", 0, "1")?;
    let old_checkout = old.checkout_path();
    fixture.root.create_dir_all(old_checkout.join("usr/etc").as_std_path())?;
    fixture.root.write(old_checkout.join("usr/etc/foo").as_std_path(), b"original")?;

    let mut gen1 = vec![old];
    assign_bootserials(&mut gen1);
    let state0 = load(&fixture)?;
    writer(&fixture, &store, &relabel).write(&state0, gen1)?;

    // Admin edits /etc/foo in place in the now-installed old deployment.
    fixture
        .root
        .write(old_checkout.join("etc/foo").as_std_path(), b"admin-edited")?;

    let new = fixture.add_deployment("fedora", "bbbb", 0, "2")?;
    let new_checkout = new.checkout_path();
    fixture.root.create_dir_all(new_checkout.join("usr/etc").as_std_path())?;
    fixture.root.write(new_checkout.join("usr/etc/foo").as_std_path(), b"original")?;
    fixture.root.write(new_checkout.join("usr/etc/bar").as_std_path(), b"vendor-bar")?;

    let state1 = load(&fixture)?;
    let mut gen2 = vec![new, state1.deployments[0].clone()];
    assign_bootserials(&mut gen2);
    writer(&fixture, &store, &relabel).write(&state1, gen2)?;

    assert_eq!(
        fixture.root.read_to_string(new_checkout.join("etc/foo").as_std_path())?,
        "admin-edited",
        "the admin's /etc edit on the previous deployment carries forward"
    );
    assert_eq!(
        fixture.root.read_to_string(new_checkout.join("etc/bar").as_std_path())?,
        "vendor-bar",
        "a vendor-only addition in the new deployment's usr/etc is preserved"
    );
    Ok(())
}

/// S6 (crash simulation): an initial install succeeds; we simulate "crash
/// between steps 9 and 10" by re-running the writer on the *same* state
/// before any further change -- the old bootversion must remain bootable and
/// re-running must succeed without corrupting anything.
#[test]
fn s6_rerun_after_simulated_crash_is_safe() -> Result<()> {
    let fixture = Fixture::new()?;
    let store = FixtureObjectStore::new()?;
    let relabel = NullRelabelOracle;

    let d = fixture.add_deployment("fedora", "aaaa", 0, "1")?;
    let mut gen1 = vec![d];
    assign_bootserials(&mut gen1);
    let state0 = load(&fixture)?;
    writer(&fixture, &store, &relabel).write(&state0, gen1.clone())?;

    assert_eq!(fixture.root.read_link("boot/loader")?, std::path::PathBuf::from("loader.0"));

    // Re-running with the identical vector: deployment count and pairwise
    // bootcsum/kargs are unchanged, so this takes the non-rotating path and
    // must leave `boot/loader` intact.
    let state1 = load(&fixture)?;
    let outcome = writer(&fixture, &store, &relabel).write(&state1, gen1)?;
    assert!(!outcome.bootconfig_swap);
    assert_eq!(fixture.root.read_link("boot/loader")?, std::path::PathBuf::from("loader.0"));
    Ok(())
}

/// A cancelled token is observed before any on-disk state is touched: the
/// write fails with [`Error::Cancelled`] and `boot/loader` is never created
/// (§5's "leaves the new bootversion dirty but harmless" only applies once
/// a rotation has actually started building).
#[test]
fn cancellation_before_write_leaves_sysroot_untouched() -> Result<()> {
    let fixture = Fixture::new()?;
    let store = FixtureObjectStore::new()?;
    let relabel = NullRelabelOracle;

    let d = fixture.add_deployment("fedora", "aaaa", 0, "1")?;
    let mut new_deployments = vec![d];
    assign_bootserials(&mut new_deployments);
    let state = load(&fixture)?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let w = writer_with_cancel(&fixture, &store, &relabel, cancel);
    let err = w.write(&state, new_deployments).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(!fixture.root.try_exists("boot/loader")?);
    Ok(())
}

/// Check out a deployment with explicit kernel bytes, so callers control
/// whether two deployments share a bootcsum independent of their commit
/// checksum (unlike [`Fixture::add_deployment`], whose kernel bytes are
/// derived from `csum` and so always differ across commits).
fn checkout_deployment(
    fixture: &Fixture,
    osname: &str,
    csum: &str,
    deployserial: u32,
    version: &str,
    kernel_bytes: &[u8],
) -> Result<Deployment> {
    let checkout = format!("ostree/deploy/{osname}/deploy/{csum}.{deployserial}");
    fixture.root.create_dir_all(format!("{checkout}/usr/lib/ostree-boot"))?;
    fixture.root.write(
        format!("{checkout}/usr/lib/os-release"),
        format!("PRETTY_NAME=\"Fixture Linux\"\nID=fixture\nVERSION={version}\n").as_bytes(),
    )?;
    fixture
        .root
        .write(format!("{checkout}/usr/lib/ostree-boot/vmlinuz-abc"), kernel_bytes)?;

    let deployment_root = fixture.root.open_dir(checkout.as_str())?;
    let files = crate::kernel::KernelFiles {
        sha: "abc".to_string(),
        vmlinuz: Utf8Path::new("usr/lib/ostree-boot/vmlinuz-abc").to_owned(),
        initramfs: None,
        devicetree: None,
    };
    let bootcsum = crate::kernel::compute_bootcsum(&deployment_root, &files)?;

    let mut bootconfig = crate::bootconfig::BootConfig::new();
    bootconfig.parse("")?;
    bootconfig.set("options", "quiet");

    let origin = crate::deployment::Origin {
        refspec: format!("fixture:fixture/{osname}"),
        ..Default::default()
    };
    fixture
        .root
        .write(format!("{checkout}.origin"), origin.to_string_serialized().as_bytes())?;

    Ok(Deployment {
        osname: osname.to_string(),
        csum: csum.to_string(),
        deployserial,
        bootcsum,
        bootserial: 0,
        bootconfig,
        origin,
        unlocked: crate::deployment::UnlockedState::None,
    })
}
