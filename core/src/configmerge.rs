//! Three-way merge of `/etc` relative to `/usr/etc` across upgrades (§4.5).

use std::collections::BTreeSet;

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::{Dir, FileType};
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::config::SysrootDebugFlags;
use crate::deployment::Deployment;
use crate::error::{Error, Result};
use crate::logging;
use crate::relabel::RelabelOracle;

/// Counts reported in the `ostree.config-merge` structured log line
/// (§4.5 step 4, §7).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConfigMergeStats {
    /// Paths copied from the previous `/etc` over the new target.
    pub modified: usize,
    /// Paths deleted from the new target because the admin deleted them.
    pub removed: usize,
    /// Paths copied from the previous `/etc` that `/usr/etc` never had.
    pub added: usize,
}

/// Run the full config-merge procedure against an opened directory
/// descriptor to the new deployment's root, given the previous deployment
/// `prev` (if any).
pub fn merge(
    new_root: &Dir,
    new_deployment: &Deployment,
    prev_root: Option<&Dir>,
    relabel: &dyn RelabelOracle,
    flags: SysrootDebugFlags,
) -> Result<ConfigMergeStats> {
    hoist_legacy_etc(new_root)?;

    if new_root
        .try_exists("usr/etc")
        .map_err(|e| Error::path_io(Utf8Path::new("usr/etc"), e))?
    {
        checkout_usretc_to_etc(new_root, relabel, flags)?;
    }

    let stats = if let Some(prev_root) = prev_root {
        three_way_merge(prev_root, new_root, flags)?
    } else {
        ConfigMergeStats::default()
    };

    logging::log_config_merge(&new_deployment.osname, stats.modified, stats.removed, stats.added);
    Ok(stats)
}

fn hoist_legacy_etc(new_root: &Dir) -> Result<()> {
    let has_etc = new_root
        .try_exists("etc")
        .map_err(|e| Error::path_io(Utf8Path::new("etc"), e))?;
    let has_usretc = new_root
        .try_exists("usr/etc")
        .map_err(|e| Error::path_io(Utf8Path::new("usr/etc"), e))?;
    if has_etc && has_usretc {
        return Err(Error::ConfigMergeConflict);
    }
    if has_etc {
        new_root
            .rename("etc", new_root, "usr/etc")
            .map_err(|e| Error::path_io(Utf8Path::new("etc"), e))?;
    }
    Ok(())
}

/// Check out `/usr/etc` into `/etc`, force-copy (never hardlink, since the
/// two trees diverge immediately) with a relabel pass using an `/etc`
/// prefix so labels match their eventual runtime path (§4.5 step 2).
fn checkout_usretc_to_etc(new_root: &Dir, relabel: &dyn RelabelOracle, flags: SysrootDebugFlags) -> Result<()> {
    new_root
        .remove_all_optional("etc")
        .map_err(|e| Error::path_io(Utf8Path::new("etc"), e))?;
    copy_tree(new_root, Utf8Path::new("usr/etc"), new_root, Utf8Path::new("etc"), flags)?;
    relabel_tree(new_root, Utf8Path::new("etc"), relabel)?;
    Ok(())
}

/// Copy operation preserving ownership, mode, and xattrs for symlinks and
/// regular files, recursing into directories (§4.5 "the copy operation").
fn copy_tree(
    srcdir: &Dir,
    src: &Utf8Path,
    dstdir: &Dir,
    dst: &Utf8Path,
    flags: SysrootDebugFlags,
) -> Result<()> {
    use cap_std_ext::cap_std::fs::MetadataExt;
    let meta = srcdir
        .symlink_metadata(src.as_std_path())
        .map_err(|e| Error::path_io(src, e))?;
    if meta.is_dir() {
        dstdir
            .ensure_dir_with(dst.as_std_path(), meta.mode() & 0o7777)
            .map_err(|e| Error::path_io(dst, e))?;
        let sub = srcdir
            .open_dir(src.as_std_path())
            .map_err(|e| Error::path_io(src, e))?;
        for entry in sub.entries().map_err(|e| Error::path_io(src, e))? {
            let entry = entry.map_err(|e| Error::path_io(src, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            copy_tree(
                &sub,
                Utf8Path::new(&name),
                dstdir,
                &dst.join(&name),
                flags,
            )?;
        }
    } else if meta.file_type() == FileType::symlink() {
        let target = srcdir
            .read_link(src.as_std_path())
            .map_err(|e| Error::path_io(src, e))?;
        dstdir
            .remove_file_optional(dst.as_std_path())
            .map_err(|e| Error::path_io(dst, e))?;
        dstdir
            .symlink(target, dst.as_std_path())
            .map_err(|e| Error::path_io(dst, e))?;
    } else {
        dstdir
            .remove_file_optional(dst.as_std_path())
            .map_err(|e| Error::path_io(dst, e))?;
        srcdir
            .copy_file_at(src.as_std_path(), dstdir, dst.as_std_path())
            .map_err(|e| Error::path_io(dst, e))?;
    }
    if !flags.no_xattrs {
        copy_xattrs(srcdir, src, dstdir, dst)?;
    }
    Ok(())
}

/// Copy POSIX extended attributes from `src` to `dst`, operating on the
/// link itself rather than its target (mirrors `relabel.rs`'s
/// `lgetxattr`/`lsetxattr` use). Best-effort: filesystems without xattr
/// support (vfat, some overlay configurations) are silently skipped.
fn copy_xattrs(srcdir: &Dir, src: &Utf8Path, dstdir: &Dir, dst: &Utf8Path) -> Result<()> {
    use std::os::fd::AsFd;
    use std::os::fd::AsRawFd;

    let src_fdpath = format!("/proc/self/fd/{}/{src}", srcdir.as_fd().as_raw_fd());
    let dst_fdpath = format!("/proc/self/fd/{}/{dst}", dstdir.as_fd().as_raw_fd());

    let mut namebuf = [0u8; 4096];
    let names_len = match rustix::fs::llistxattr(&src_fdpath, &mut namebuf) {
        Ok(n) => n,
        Err(rustix::io::Errno::OPNOTSUPP) | Err(rustix::io::Errno::NOSYS) => return Ok(()),
        Err(e) => return Err(Error::path_io(src, e.into())),
    };

    let mut valuebuf = [0u8; 65536];
    for name in namebuf[..names_len].split(|&b| b == 0).filter(|n| !n.is_empty()) {
        let Ok(name) = std::str::from_utf8(name) else {
            continue;
        };
        let value_len = match rustix::fs::lgetxattr(&src_fdpath, name, &mut valuebuf) {
            Ok(n) => n,
            Err(rustix::io::Errno::NODATA) => continue,
            Err(e) => return Err(Error::path_io(src, e.into())),
        };
        rustix::fs::lsetxattr(
            &dst_fdpath,
            name,
            &valuebuf[..value_len],
            rustix::fs::XattrFlags::empty(),
        )
        .map_err(|e| Error::path_io(dst, e.into()))?;
    }
    Ok(())
}

fn relabel_tree(root: &Dir, prefix: &Utf8Path, relabel: &dyn RelabelOracle) -> Result<()> {
    relabel.restorecon(root, prefix, crate::relabel::RestoreconFlags::default())
}

/// Compute and apply the three-way `/etc` diff (§4.5 step 3).
///
/// base = `prev`'s `/usr/etc`, working = `prev`'s `/etc`, target = new
/// root's `/etc`. Xattrs are ignored in the diff itself (SELinux contexts
/// otherwise falsely show as changes), though the copy operation still
/// carries them over.
fn three_way_merge(prev_root: &Dir, new_root: &Dir, flags: SysrootDebugFlags) -> Result<ConfigMergeStats> {
    let base = prev_root
        .open_dir_optional("usr/etc")
        .map_err(|e| Error::path_io(Utf8Path::new("usr/etc"), e))?;
    let working = prev_root
        .open_dir_optional("etc")
        .map_err(|e| Error::path_io(Utf8Path::new("etc"), e))?;
    let (Some(base), Some(working)) = (base, working) else {
        return Ok(ConfigMergeStats::default());
    };
    new_root
        .create_dir_all("etc")
        .map_err(|e| Error::path_io(Utf8Path::new("etc"), e))?;
    let target = new_root
        .open_dir("etc")
        .map_err(|e| Error::path_io(Utf8Path::new("etc"), e))?;

    let mut stats = ConfigMergeStats::default();
    let base_paths = list_tree(&base)?;
    let working_paths = list_tree(&working)?;
    let mut all: BTreeSet<String> = base_paths.union(&working_paths).cloned().collect();
    all.extend(list_tree(&target)?);

    for relpath in &all {
        let rel = Utf8Path::new(relpath);
        let in_base = base_paths.contains(relpath);
        let in_working = working_paths.contains(relpath);

        match (in_base, in_working) {
            (true, true) => {
                if entries_differ(&base, &working, rel)? {
                    apply_merge_copy(&working, rel, &target, rel)?;
                    stats.modified += 1;
                }
            }
            (true, false) => {
                if target
                    .try_exists(rel.as_std_path())
                    .map_err(|e| Error::path_io(rel, e))?
                {
                    target
                        .remove_all_optional(rel.as_std_path())
                        .map_err(|e| Error::path_io(rel, e))?;
                    stats.removed += 1;
                }
            }
            (false, true) => {
                apply_merge_copy(&working, rel, &target, rel)?;
                stats.added += 1;
            }
            (false, false) => {}
        }
    }
    let _ = flags;
    Ok(stats)
}

fn apply_merge_copy(srcdir: &Dir, src: &Utf8Path, dstdir: &Dir, dst: &Utf8Path) -> Result<()> {
    let meta = srcdir
        .symlink_metadata(src.as_std_path())
        .map_err(|e| Error::path_io(src, e))?;
    // Directory-in-target-and-source conflicts recurse; anything else
    // (file replacing a directory or vice versa) is a full replace (§4.5
    // step 3's "file-type conflicts" rule).
    if meta.is_dir() {
        let target_is_dir = dstdir
            .symlink_metadata(dst.as_std_path())
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !target_is_dir {
            dstdir
                .remove_all_optional(dst.as_std_path())
                .map_err(|e| Error::path_io(dst, e))?;
        }
        copy_tree(srcdir, src, dstdir, dst, SysrootDebugFlags::default())
    } else {
        dstdir
            .remove_all_optional(dst.as_std_path())
            .map_err(|e| Error::path_io(dst, e))?;
        copy_tree(srcdir, src, dstdir, dst, SysrootDebugFlags::default())
    }
}

fn entries_differ(a: &Dir, b: &Dir, rel: &Utf8Path) -> Result<bool> {
    let am = a
        .symlink_metadata(rel.as_std_path())
        .map_err(|e| Error::path_io(rel, e))?;
    let bm = b
        .symlink_metadata(rel.as_std_path())
        .map_err(|e| Error::path_io(rel, e))?;
    if am.is_dir() != bm.is_dir() {
        return Ok(true);
    }
    if am.is_dir() {
        // Directories "differ" only via their children, handled separately
        // by the per-path walk; treat the directory node itself as equal.
        return Ok(false);
    }
    if am.file_type() == FileType::symlink() {
        let at = a.read_link(rel.as_std_path()).map_err(|e| Error::path_io(rel, e))?;
        let bt = b.read_link(rel.as_std_path()).map_err(|e| Error::path_io(rel, e))?;
        return Ok(at != bt);
    }
    if am.len() != bm.len() {
        return Ok(true);
    }
    let ac = a.read_to_string(rel.as_std_path());
    let bc = b.read_to_string(rel.as_std_path());
    match (ac, bc) {
        (Ok(ac), Ok(bc)) => Ok(ac != bc),
        _ => {
            let ab = a.read(rel.as_std_path()).map_err(|e| Error::path_io(rel, e))?;
            let bb = b.read(rel.as_std_path()).map_err(|e| Error::path_io(rel, e))?;
            Ok(ab != bb)
        }
    }
}

/// List every path (file, symlink, or directory) under `dir`, relative and
/// without a leading slash, recursively.
fn list_tree(dir: &Dir) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    list_tree_into(dir, Utf8Path::new(""), &mut out)?;
    Ok(out)
}

fn list_tree_into(dir: &Dir, prefix: &Utf8Path, out: &mut BTreeSet<String>) -> Result<()> {
    for entry in dir.entries().map_err(|e| Error::path_io(prefix, e))? {
        let entry = entry.map_err(|e| Error::path_io(prefix, e))?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let relpath = if prefix.as_str().is_empty() {
            camino::Utf8PathBuf::from(&name)
        } else {
            prefix.join(&name)
        };
        let ft = entry.file_type().map_err(|e| Error::path_io(&relpath, e))?;
        out.insert(relpath.to_string());
        if ft.is_dir() {
            let sub = dir
                .open_dir(name.as_str())
                .map_err(|e| Error::path_io(&relpath, e))?;
            list_tree_into(&sub, &relpath, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relabel::NullRelabelOracle;
    use cap_std_ext::cap_std;

    fn tmpdir() -> cap_std_ext::cap_tempfile::TempDir {
        cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority()).unwrap()
    }

    #[test]
    fn test_hoist_legacy_etc() -> Result<()> {
        let root = tmpdir();
        root.create_dir("etc")?;
        root.write("etc/foo", b"bar")?;
        hoist_legacy_etc(&root)?;
        assert!(!root.try_exists("etc")?);
        assert_eq!(root.read_to_string("usr/etc/foo")?, "bar");
        Ok(())
    }

    #[test]
    fn test_hoist_legacy_etc_conflict() -> Result<()> {
        let root = tmpdir();
        root.create_dir("etc")?;
        root.create_dir_all("usr/etc")?;
        assert!(matches!(
            hoist_legacy_etc(&root),
            Err(Error::ConfigMergeConflict)
        ));
        Ok(())
    }

    #[test]
    fn test_three_way_merge_admin_edit_wins() -> Result<()> {
        let prev = tmpdir();
        prev.create_dir_all("usr/etc")?;
        prev.write("usr/etc/foo", b"original")?;
        prev.create_dir("etc")?;
        prev.write("etc/foo", b"admin-edited")?;

        let new_root = tmpdir();
        new_root.create_dir("etc")?;
        new_root.write("etc/foo", b"original")?;

        let stats = three_way_merge(&prev, &new_root, SysrootDebugFlags::default())?;
        assert_eq!(stats.modified, 1);
        assert_eq!(new_root.read_to_string("etc/foo")?, "admin-edited");
        Ok(())
    }

    #[test]
    fn test_three_way_merge_admin_delete_wins() -> Result<()> {
        let prev = tmpdir();
        prev.create_dir_all("usr/etc")?;
        prev.write("usr/etc/foo", b"x")?;
        prev.create_dir("etc")?;

        let new_root = tmpdir();
        new_root.create_dir("etc")?;
        new_root.write("etc/foo", b"x")?;

        let stats = three_way_merge(&prev, &new_root, SysrootDebugFlags::default())?;
        assert_eq!(stats.removed, 1);
        assert!(!new_root.try_exists("etc/foo")?);
        Ok(())
    }

    #[test]
    fn test_three_way_merge_admin_addition_kept() -> Result<()> {
        let prev = tmpdir();
        prev.create_dir_all("usr/etc")?;
        prev.create_dir("etc")?;
        prev.write("etc/newfile", b"admin-added")?;

        let new_root = tmpdir();
        new_root.create_dir("etc")?;

        let stats = three_way_merge(&prev, &new_root, SysrootDebugFlags::default())?;
        assert_eq!(stats.added, 1);
        assert_eq!(new_root.read_to_string("etc/newfile")?, "admin-added");
        Ok(())
    }

    #[test]
    fn test_checkout_usretc_to_etc() -> Result<()> {
        let root = tmpdir();
        root.create_dir_all("usr/etc")?;
        root.write("usr/etc/hostname", b"localhost")?;
        let relabel = NullRelabelOracle;
        checkout_usretc_to_etc(&root, &relabel, SysrootDebugFlags::default())?;
        assert_eq!(root.read_to_string("etc/hostname")?, "localhost");
        Ok(())
    }

    #[test]
    fn test_copy_tree_carries_xattrs() -> Result<()> {
        use std::os::fd::{AsFd, AsRawFd};

        let root = tmpdir();
        root.write("src", b"content")?;
        let src_fdpath = format!("/proc/self/fd/{}/src", root.as_fd().as_raw_fd());
        match rustix::fs::lsetxattr(
            &src_fdpath,
            "user.test",
            b"value",
            rustix::fs::XattrFlags::empty(),
        ) {
            Ok(()) => {}
            // Some test environments' tmpfs doesn't allow user.* xattrs; skip rather than fail.
            Err(rustix::io::Errno::OPNOTSUPP | rustix::io::Errno::PERM) => return Ok(()),
            Err(e) => return Err(Error::path_io(Utf8Path::new("src"), e.into())),
        }

        copy_tree(&root, Utf8Path::new("src"), &root, Utf8Path::new("dst"), SysrootDebugFlags::default())?;

        let dst_fdpath = format!("/proc/self/fd/{}/dst", root.as_fd().as_raw_fd());
        let mut buf = [0u8; 64];
        let n = rustix::fs::lgetxattr(&dst_fdpath, "user.test", &mut buf)
            .map_err(|e| Error::path_io(Utf8Path::new("dst"), e.into()))?;
        assert_eq!(&buf[..n], b"value");
        Ok(())
    }

    #[test]
    fn test_copy_tree_skips_xattrs_when_disabled() -> Result<()> {
        use std::os::fd::{AsFd, AsRawFd};

        let root = tmpdir();
        root.write("src", b"content")?;
        let src_fdpath = format!("/proc/self/fd/{}/src", root.as_fd().as_raw_fd());
        match rustix::fs::lsetxattr(
            &src_fdpath,
            "user.test",
            b"value",
            rustix::fs::XattrFlags::empty(),
        ) {
            Ok(()) => {}
            Err(rustix::io::Errno::OPNOTSUPP | rustix::io::Errno::PERM) => return Ok(()),
            Err(e) => return Err(Error::path_io(Utf8Path::new("src"), e.into())),
        }

        let flags = SysrootDebugFlags {
            no_xattrs: true,
            ..Default::default()
        };
        copy_tree(&root, Utf8Path::new("src"), &root, Utf8Path::new("dst"), flags)?;

        let dst_fdpath = format!("/proc/self/fd/{}/dst", root.as_fd().as_raw_fd());
        let mut buf = [0u8; 64];
        let err = rustix::fs::lgetxattr(&dst_fdpath, "user.test", &mut buf).unwrap_err();
        assert_eq!(err, rustix::io::Errno::NODATA);
        Ok(())
    }
}
