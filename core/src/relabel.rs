//! SELinux relabeling oracle and one-shot `/var` relabel stamp (§4.6).
//!
//! The core has no SELinux policy engine of its own; it calls out through
//! [`RelabelOracle`] for "what label does this path get" and applies the
//! answer via `security.selinux` xattr syscalls, mirroring
//! `lib/src/lsm.rs`'s `set_security_selinux`/`has_security_selinux` split
//! between policy lookup and xattr application.

use std::os::fd::AsFd;

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::{CapStdExtDirExt, CapStdExtDirExtUtf8};

use crate::error::{Error, Result};
use crate::logging;

const SELINUX_XATTR: &str = "security.selinux";

/// Stamp file recording that `/var` has already been relabeled once for a
/// given osname, so repeated deployments of the same `/var` don't redo the
/// (potentially large) recursive relabel (§4.6).
pub const VAR_RELABEL_STAMP: &str = "var/.ostree-selabeled";

/// Whether a path already carries a label, and if not, what policy would
/// assign it (§4.6, §6.1's sibling "external interfaces" shape).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelState {
    /// No `security.selinux` xattr is present yet.
    Unlabeled,
    /// The filesystem doesn't support xattrs at all (e.g. vfat ESP).
    Unsupported,
    /// Already labeled; left untouched.
    Labeled,
}

/// Options controlling a `restorecon`-style recursive relabel pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreconFlags {
    /// Skip paths already carrying a label instead of reapplying policy.
    pub skip_labeled: bool,
}

/// A pluggable source of SELinux labels, decoupling the core from any
/// specific policy-loading library.
pub trait RelabelOracle {
    /// The label policy would assign to `path` (relative to some tree
    /// root) with the given POSIX mode bits, or `None` if policy has no
    /// opinion (matches `ostree::SePolicy::label` returning an `Option`).
    fn label_for(&self, path: &Utf8Path, mode: u32) -> Result<Option<Vec<u8>>>;

    /// Recursively relabel every entry under `prefix` inside `root`.
    fn restorecon(&self, root: &Dir, prefix: &Utf8Path, flags: RestoreconFlags) -> Result<()> {
        restorecon_recurse(self, root, &mut prefix.to_owned(), flags)
    }
}

/// An oracle with no policy: every path is `Unsupported`. Used in tests and
/// on platforms without SELinux.
#[derive(Debug, Default)]
pub struct NullRelabelOracle;

impl RelabelOracle for NullRelabelOracle {
    fn label_for(&self, _path: &Utf8Path, _mode: u32) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

fn restorecon_recurse(
    oracle: &(impl RelabelOracle + ?Sized),
    root: &Dir,
    path: &mut camino::Utf8PathBuf,
    flags: RestoreconFlags,
) -> Result<()> {
    let read_path = if path.as_str().is_empty() {
        Utf8Path::new(".")
    } else {
        path.as_path()
    };
    let meta = root
        .symlink_metadata(read_path.as_std_path())
        .map_err(|e| Error::path_io(read_path, e))?;
    relabel_one(oracle, root, path, &meta, flags)?;

    if meta.is_dir() {
        let subdir = root
            .open_dir(read_path.as_std_path())
            .map_err(|e| Error::path_io(read_path, e))?;
        for entry in subdir.entries_utf8().map_err(|e| Error::path_io(read_path, e))? {
            let entry = entry.map_err(|e| Error::path_io(read_path, e))?;
            let name = entry.file_name().map_err(|e| Error::path_io(read_path, e))?;
            path.push(&name);
            restorecon_recurse(oracle, root, path, flags)?;
            path.pop();
        }
    }
    Ok(())
}

fn relabel_one(
    oracle: &(impl RelabelOracle + ?Sized),
    root: &Dir,
    path: &Utf8Path,
    meta: &cap_std_ext::cap_std::fs::Metadata,
    flags: RestoreconFlags,
) -> Result<()> {
    use cap_std_ext::cap_std::fs::MetadataExt;
    if flags.skip_labeled && matches!(label_state(root, path)?, LabelState::Labeled) {
        return Ok(());
    }
    let abspath = Utf8Path::new("/").join(path);
    let Some(label) = oracle.label_for(&abspath, meta.mode())? else {
        return Ok(());
    };
    set_label(root, path, &label)
}

/// Query whether `path` (relative to `root`) already carries a
/// `security.selinux` xattr.
pub fn label_state(root: &Dir, path: &Utf8Path) -> Result<LabelState> {
    use std::os::fd::AsRawFd;
    let mut buf = [0u8; 2048];
    let fdpath = format!("/proc/self/fd/{}/{path}", root.as_fd().as_raw_fd());
    match rustix::fs::lgetxattr(&fdpath, SELINUX_XATTR, &mut buf) {
        Ok(_) => Ok(LabelState::Labeled),
        Err(rustix::io::Errno::OPNOTSUPP) => Ok(LabelState::Unsupported),
        Err(rustix::io::Errno::NODATA) => Ok(LabelState::Unlabeled),
        Err(e) => Err(Error::path_io(path, e.into())),
    }
}

/// Apply `label` as the `security.selinux` xattr of `path` (relative to
/// `root`), following a symlink's own inode rather than its target.
pub fn set_label(root: &Dir, path: &Utf8Path, label: &[u8]) -> Result<()> {
    use std::os::fd::AsRawFd;
    let fdpath = format!("/proc/self/fd/{}/{path}", root.as_fd().as_raw_fd());
    rustix::fs::lsetxattr(&fdpath, SELINUX_XATTR, label, rustix::fs::XattrFlags::empty())
        .map_err(|e| Error::path_io(path, e.into()))
}

/// Whether `/var` under `osname` has already had its one-shot relabel pass
/// (§4.6): presence of [`VAR_RELABEL_STAMP`] under the os-specific var dir.
pub fn var_already_relabeled(os_var_dir: &Dir) -> Result<bool> {
    os_var_dir
        .try_exists(".ostree-selabeled")
        .map_err(|e| Error::path_io(Utf8Path::new(".ostree-selabeled"), e))
}

/// Run the one-shot `/var` relabel for `osname`'s shared var directory and
/// drop the stamp file marking it done, logging via
/// [`logging::log_var_relabel`].
pub fn relabel_var_once(
    os_var_dir: &Dir,
    osname: &str,
    csum: &str,
    oracle: &dyn RelabelOracle,
) -> Result<()> {
    if var_already_relabeled(os_var_dir)? {
        return Ok(());
    }
    oracle.restorecon(os_var_dir, Utf8Path::new(""), RestoreconFlags::default())?;
    os_var_dir
        .write(".ostree-selabeled", b"")
        .map_err(|e| Error::path_io(Utf8Path::new(".ostree-selabeled"), e))?;
    logging::log_var_relabel(osname, csum);
    Ok(())
}
