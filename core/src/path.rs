//! Path and atomic-filesystem primitives (§4.1): replace-by-rename symlinks,
//! hardlink-with-copy-fallback, best-effort recursive removal, and the
//! ext2/xfs "immutable" inode flag used to protect deployment roots.
#![allow(unsafe_code)] // raw ioctls for the immutable flag and syncfs's fd juggling

use std::os::unix::io::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use rustix::fs::{Mode, OFlags};

use crate::error::{Error, Result};

/// Prefix applied to in-progress temporary files/directories so a crash
/// leaves identifiable debris that `rm_rf`/cleanup can recognize and remove.
pub const TMP_PREFIX: &str = ".ostree-deploy-tmp.";

// FS_IOC_GETFLAGS / FS_IOC_SETFLAGS, magic 'f' (0x66), as defined by
// linux/fs.h. Not bound by `rustix`, so we generate the ioctl ourselves.
nix::ioctl_read!(fs_ioc_getflags, 0x66, 1, i64);
nix::ioctl_write_ptr!(fs_ioc_setflags, 0x66, 2, i64);

/// The ext2/xfs/btrfs immutable inode flag (`FS_IMMUTABLE_FL`).
const FS_IMMUTABLE_FL: i64 = 0x0000_0010;

/// Latched once the process has observed `EPERM` toggling the immutable
/// flag (e.g. missing `CAP_LINUX_IMMUTABLE`), to avoid repeating a doomed
/// syscall on every deployment directory.
static IMMUTABLE_DISABLED: AtomicBool = AtomicBool::new(false);

/// Create a symlink named `<newpath>.tmp` pointing at `target`, then rename
/// it over `newpath`. Renames are atomic on POSIX filesystems; callers that
/// need durability must `syncfs` the containing filesystem afterward.
pub fn symlink_replace(dir: &Dir, target: &Utf8Path, newpath: &Utf8Path) -> Result<()> {
    let tmp_name = format!("{newpath}.tmp");
    let tmp = Utf8Path::new(&tmp_name);
    dir.remove_file_optional(tmp.as_std_path())
        .map_err(|e| Error::path_io(tmp, e))?;
    dir.symlink_contents(target, tmp)
        .map_err(|e| Error::path_io(tmp, e))?;
    dir.local_rename(tmp.as_std_path(), newpath.as_std_path())
        .map_err(|e| Error::path_io(newpath, e))?;
    Ok(())
}

/// Attempt a hardlink from `src` to `dst`; on `EMLINK` or `EXDEV`, fall back
/// to a full copy preserving mode and xattrs. Any other errno is fatal.
pub fn hardlink_or_copy(srcdir: &Dir, src: &Utf8Path, dstdir: &Dir, dst: &Utf8Path) -> Result<()> {
    match srcdir.hard_link(src.as_std_path(), dstdir, dst.as_std_path()) {
        Ok(()) => Ok(()),
        Err(e)
            if matches!(
                e.raw_os_error(),
                Some(libc::EMLINK) | Some(libc::EXDEV)
            ) =>
        {
            srcdir
                .copy_file_at(src.as_std_path(), dstdir, dst.as_std_path())
                .map_err(|e| Error::path_io(dst, e))?;
            Ok(())
        }
        Err(e) => Err(Error::path_io(dst, e)),
    }
}

/// Best-effort recursive removal of `path` under `dir`. The caller decides
/// how to treat the error; for deployment directories the immutable flag
/// must be cleared first (see [`set_immutable`]).
pub fn rm_rf(dir: &Dir, path: &Utf8Path) -> Result<()> {
    dir.remove_all_optional(path.as_std_path())
        .map_err(|e| Error::path_io(path, e))?;
    Ok(())
}

/// Toggle the filesystem immutable attribute on the directory/file
/// referenced by `target`. `EOPNOTSUPP`/`ENOTTY` (filesystem doesn't support
/// the flag) are silently ignored. `EPERM` latches [`IMMUTABLE_DISABLED`] so
/// subsequent calls in this process become no-ops.
pub fn set_immutable(target: &impl AsFd, state: bool) -> Result<()> {
    if IMMUTABLE_DISABLED.load(Ordering::Relaxed) {
        return Ok(());
    }
    let fd = target.as_fd();
    let mut flags: i64 = 0;
    let r = unsafe { fs_ioc_getflags(fd.as_raw_fd_for_ioctl(), &mut flags) };
    if let Err(e) = ioctl_result(r) {
        return handle_immutable_errno(e);
    }
    if state {
        flags |= FS_IMMUTABLE_FL;
    } else {
        flags &= !FS_IMMUTABLE_FL;
    }
    let r = unsafe { fs_ioc_setflags(fd.as_raw_fd_for_ioctl(), &flags) };
    if let Err(e) = ioctl_result(r) {
        return handle_immutable_errno(e);
    }
    Ok(())
}

fn ioctl_result(r: nix::Result<i32>) -> std::result::Result<(), nix::errno::Errno> {
    r.map(|_| ()).map_err(|e| e)
}

fn handle_immutable_errno(e: nix::errno::Errno) -> Result<()> {
    match e {
        nix::errno::Errno::EOPNOTSUPP | nix::errno::Errno::ENOTTY => Ok(()),
        nix::errno::Errno::EPERM => {
            IMMUTABLE_DISABLED.store(true, Ordering::Relaxed);
            Ok(())
        }
        other => Err(Error::path_io(
            Utf8Path::new("<immutable-flag>"),
            std::io::Error::from_raw_os_error(other as i32),
        )),
    }
}

/// Extension to get a raw fd for the hand-rolled ioctls above without
/// pulling in a second fd-ownership story; `nix`'s ioctl macros want a
/// bare `RawFd`.
trait AsRawFdForIoctl {
    fn as_raw_fd_for_ioctl(&self) -> std::os::unix::io::RawFd;
}

impl AsRawFdForIoctl for std::os::unix::io::BorrowedFd<'_> {
    fn as_raw_fd_for_ioctl(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.as_raw_fd()
    }
}

/// `syncfs(2)` the filesystem backing `dir`, via a freshly opened fd so we
/// don't need `dir` to already be read-only-open-compatible.
pub fn syncfs(dir: &Dir) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = unsafe { std::os::unix::io::BorrowedFd::borrow_raw(dir.as_raw_fd()) };
    let oflags = OFlags::RDONLY | OFlags::CLOEXEC | OFlags::DIRECTORY;
    let reopened = rustix::fs::openat(fd, ".", oflags, Mode::empty())
        .map_err(|e| Error::path_io(Utf8Path::new("."), e.into()))?;
    rustix::fs::syncfs(reopened).map_err(|e| Error::path_io(Utf8Path::new("."), e.into()))
}

/// If `p` is read-only mounted, remount it read-write. Returns whether a
/// remount was performed, so the caller can restore read-only state later.
pub fn ensure_writable_mount(p: &Utf8Path) -> Result<bool> {
    let stat = rustix::fs::statvfs(p.as_std_path()).map_err(|e| Error::path_io(p, e.into()))?;
    if !stat.f_flag.contains(rustix::fs::StatVfsMountFlags::RDONLY) {
        return Ok(false);
    }
    let status = std::process::Command::new("mount")
        .args(["-o", "remount,rw"])
        .arg(p.as_std_path())
        .status()
        .map_err(|e| Error::path_io(p, e))?;
    if !status.success() {
        return Err(Error::CorruptedLayout(format!(
            "failed to remount {p} read-write"
        )));
    }
    Ok(true)
}

/// Remount `p` back to read-only. Used as the exit half of the
/// remount-rw-on-entry scoped guard in the writer (§4.11 step 1, §9).
pub fn restore_readonly_mount(p: &Utf8Path) -> Result<()> {
    let status = std::process::Command::new("mount")
        .args(["-o", "remount,ro"])
        .arg(p.as_std_path())
        .status()
        .map_err(|e| Error::path_io(p, e))?;
    if !status.success() {
        return Err(Error::CorruptedLayout(format!(
            "failed to remount {p} read-only"
        )));
    }
    Ok(())
}

/// Scoped guard pairing [`ensure_writable_mount`] with
/// [`restore_readonly_mount`] on drop, modeling the "goto out" cleanup from
/// the original writer as an early-return-friendly RAII guard instead.
#[derive(Debug)]
pub struct WritableMountGuard {
    path: camino::Utf8PathBuf,
    remounted: bool,
}

impl WritableMountGuard {
    /// Ensure `path` is writable, remembering whether we changed it.
    pub fn acquire(path: &Utf8Path) -> Result<Self> {
        let remounted = ensure_writable_mount(path)?;
        Ok(Self {
            path: path.to_owned(),
            remounted,
        })
    }
}

impl Drop for WritableMountGuard {
    fn drop(&mut self) {
        if self.remounted {
            if let Err(e) = restore_readonly_mount(&self.path) {
                tracing::warn!("failed to restore read-only mount on {}: {e}", self.path);
            }
        }
    }
}
