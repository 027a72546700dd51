//! Sysroot state loader: turns an on-disk layout into
//! `(bootversion, subbootversion, deployments[], booted)` (§4.3).

use std::os::unix::io::AsFd;

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use rustix::fs::FlockOperation;

use crate::bootconfig::BootConfig;
use crate::deployment::{Deployment, Origin};
use crate::error::{Error, Result};
use crate::kargs::KernelArgs;

/// Advisory exclusive lock held at `ostree/lock` for the duration of any
/// write (§5). Readers that only call [`SysrootState::load`] need no lock.
#[derive(Debug)]
pub struct SysrootLock {
    file: std::fs::File,
}

impl SysrootLock {
    /// Acquire the lock, blocking until available.
    pub fn acquire(physical_root: &Dir) -> Result<Self> {
        let file = Self::open_lockfile(physical_root)?;
        rustix::fs::flock(file.as_fd(), FlockOperation::LockExclusive)
            .map_err(|e| Error::path_io(Utf8Path::new("ostree/lock"), e.into()))?;
        Ok(Self { file })
    }

    /// Try to acquire the lock without blocking; returns
    /// [`Error::LockContended`] if another process holds it.
    pub fn try_acquire(physical_root: &Dir) -> Result<Self> {
        let file = Self::open_lockfile(physical_root)?;
        rustix::fs::flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive).map_err(|e| {
            if matches!(e, rustix::io::Errno::WOULDBLOCK) {
                Error::LockContended
            } else {
                Error::path_io(Utf8Path::new("ostree/lock"), e.into())
            }
        })?;
        Ok(Self { file })
    }

    fn open_lockfile(physical_root: &Dir) -> Result<std::fs::File> {
        physical_root
            .create_dir_all("ostree")
            .map_err(|e| Error::path_io(Utf8Path::new("ostree"), e))?;
        let ostree_dir = physical_root
            .open_dir("ostree")
            .map_err(|e| Error::path_io(Utf8Path::new("ostree"), e))?;
        ostree_dir
            .open_with(
                "lock",
                cap_std_ext::cap_std::fs::OpenOptions::new()
                    .create(true)
                    .write(true),
            )
            .map(std::fs::File::from)
            .map_err(|e| Error::path_io(Utf8Path::new("ostree/lock"), e))
    }
}

impl Drop for SysrootLock {
    fn drop(&mut self) {
        let _ = rustix::fs::flock(self.file.as_fd(), FlockOperation::Unlock);
    }
}

/// The loaded state of a sysroot (§3.1).
#[derive(Debug)]
pub struct SysrootState {
    /// Active bootversion, as pointed to by `boot/loader`.
    pub bootversion: u8,
    /// Active subbootversion under `ostree/boot.<bootversion>`.
    pub subbootversion: u8,
    /// Deployments in bootloader menu order (index 0 is default).
    pub deployments: Vec<Deployment>,
    /// Index into `deployments` of the currently booted one, if any.
    pub booted: Option<usize>,
}

impl SysrootState {
    /// Load the sysroot rooted at `physical_root`.
    ///
    /// `running_root_dev_ino` identifies the live `/` (device, inode) so the
    /// booted deployment can be located by comparing stat results; pass
    /// `None` to skip booted-deployment detection (installer mode).
    pub fn load(physical_root: &Dir, running_root_dev_ino: Option<(u64, u64)>) -> Result<Self> {
        let bootversion = read_bootversion(physical_root)?;
        let subbootversion = read_subbootversion(physical_root, bootversion)?;
        let mut deployments = read_entries(physical_root, bootversion, subbootversion)?;
        sort_by_version_desc(&mut deployments);

        let booted = running_root_dev_ino.and_then(|dev_ino| {
            deployments.iter().position(|d| {
                checkout_dev_ino(physical_root, d)
                    .ok()
                    .flatten()
                    .is_some_and(|d_ino| d_ino == dev_ino)
            })
        });

        Ok(Self {
            bootversion,
            subbootversion,
            deployments,
            booted,
        })
    }

    /// The currently booted deployment, if any.
    pub fn booted_deployment(&self) -> Option<&Deployment> {
        self.booted.map(|i| &self.deployments[i])
    }
}

fn read_bootversion(physical_root: &Dir) -> Result<u8> {
    match physical_root.read_link("boot/loader") {
        Ok(target) => parse_versioned_symlink(&target, "loader."),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::path_io(Utf8Path::new("boot/loader"), e)),
    }
}

fn read_subbootversion(physical_root: &Dir, bootversion: u8) -> Result<u8> {
    let link = format!("ostree/boot.{bootversion}");
    match physical_root.read_link(&link) {
        Ok(target) => {
            let prefix = format!("boot.{bootversion}.");
            parse_versioned_symlink(&target, &prefix)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::path_io(Utf8Path::new(&link), e)),
    }
}

fn parse_versioned_symlink(target: &std::path::Path, prefix: &str) -> Result<u8> {
    let target_str = target.to_string_lossy();
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::CorruptedLayout(format!("empty symlink target {target_str}")))?;
    let suffix = name.strip_prefix(prefix).ok_or_else(|| {
        Error::CorruptedLayout(format!("symlink target {target_str} missing prefix {prefix}"))
    })?;
    match suffix {
        "0" => Ok(0),
        "1" => Ok(1),
        other => Err(Error::CorruptedLayout(format!(
            "bootversion/subbootversion out of range: {other}"
        ))),
    }
}

fn read_entries(physical_root: &Dir, bootversion: u8, subbootversion: u8) -> Result<Vec<Deployment>> {
    let entries_path = format!("boot/loader.{bootversion}/entries");
    let Some(entries_dir) = physical_root
        .open_dir_optional(&entries_path)
        .map_err(|e| Error::path_io(Utf8Path::new(&entries_path), e))?
    else {
        return Ok(Vec::new());
    };

    let mut result = Vec::new();
    for entry in entries_dir
        .entries()
        .map_err(|e| Error::path_io(Utf8Path::new(&entries_path), e))?
    {
        let entry = entry.map_err(|e| Error::path_io(Utf8Path::new(&entries_path), e))?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !name.ends_with(".conf") {
            continue;
        }
        let mut bootconfig = BootConfig::new();
        bootconfig.parse_at(&entries_dir, Utf8Path::new(&name))?;
        let Some(deployment) =
            deployment_from_entry(physical_root, &bootconfig, bootversion, subbootversion)?
        else {
            continue;
        };
        result.push(deployment);
    }
    Ok(result)
}

fn deployment_from_entry(
    physical_root: &Dir,
    bootconfig: &BootConfig,
    bootversion: u8,
    subbootversion: u8,
) -> Result<Option<Deployment>> {
    let options = bootconfig.get("options").unwrap_or_default();
    let kargs = KernelArgs::parse(options);
    let Some(ostree_arg) = kargs.last_value("ostree") else {
        return Ok(None);
    };
    let (osname, bootcsum, bootserial) = parse_ostree_bootlink(ostree_arg, bootversion)?;

    let bootlink_path =
        format!("ostree/boot.{bootversion}.{subbootversion}/{osname}/{bootcsum}/{bootserial}");
    let target = physical_root
        .read_link(&bootlink_path)
        .map_err(|e| Error::path_io(Utf8Path::new(&bootlink_path), e))?;
    let target_str = target.to_string_lossy();
    let checkout_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::CorruptedLayout(format!("invalid bootlink target {target_str}")))?;
    let (csum, deployserial) = checkout_name.rsplit_once('.').ok_or_else(|| {
        Error::CorruptedLayout(format!("invalid checkout dirname {checkout_name}"))
    })?;
    let deployserial: u32 = deployserial
        .parse()
        .map_err(|_| Error::CorruptedLayout(format!("invalid deployserial {deployserial}")))?;

    let origin_path = format!("ostree/deploy/{osname}/deploy/{csum}.{deployserial}.origin");
    let origin = if physical_root
        .try_exists(&origin_path)
        .map_err(|e| Error::path_io(Utf8Path::new(&origin_path), e))?
    {
        Origin::parse_at(physical_root, Utf8Path::new(&origin_path))?
    } else {
        Origin::default()
    };
    let unlocked = origin.unlocked_state();

    Ok(Some(Deployment {
        osname,
        csum: csum.to_string(),
        deployserial,
        bootcsum,
        bootserial,
        bootconfig: bootconfig.clone(),
        origin,
        unlocked,
    }))
}

/// Parse `/ostree/boot.<B'>/<osname>/<bootcsum>/<bootserial>`, requiring
/// `B' == bootversion` (§4.3 step 4).
fn parse_ostree_bootlink(arg: &str, bootversion: u8) -> Result<(String, String, u32)> {
    let path = arg
        .strip_prefix("/ostree/boot.")
        .ok_or_else(|| Error::InvalidBootlink(arg.to_string()))?;
    let mut parts = path.splitn(2, '/');
    let b = parts
        .next()
        .ok_or_else(|| Error::InvalidBootlink(arg.to_string()))?;
    let rest = parts
        .next()
        .ok_or_else(|| Error::InvalidBootlink(arg.to_string()))?;
    let parsed_b: u8 = b
        .parse()
        .map_err(|_| Error::InvalidBootlink(arg.to_string()))?;
    if parsed_b != bootversion {
        return Err(Error::InvalidBootlink(arg.to_string()));
    }
    let mut rest_parts = rest.splitn(3, '/');
    let osname = rest_parts
        .next()
        .ok_or_else(|| Error::InvalidBootlink(arg.to_string()))?
        .to_string();
    let bootcsum = rest_parts
        .next()
        .ok_or_else(|| Error::InvalidBootlink(arg.to_string()))?
        .to_string();
    let bootserial: u32 = rest_parts
        .next()
        .ok_or_else(|| Error::InvalidBootlink(arg.to_string()))?
        .parse()
        .map_err(|_| Error::InvalidBootlink(arg.to_string()))?;
    Ok((osname, bootcsum, bootserial))
}

/// Sort deployments by their `version` bootconfig key, descending, using
/// [`natural_version_cmp`]; entries without `version` sort last. The tie
/// breaker among equal `version` values is file-name (thus directory
/// enumeration) order, as upstream leaves unspecified and we preserve (§9).
fn sort_by_version_desc(deployments: &mut [Deployment]) {
    deployments.sort_by(|a, b| {
        let av = a.bootconfig.get("version");
        let bv = b.bootconfig.get("version");
        match (av, bv) {
            (Some(a), Some(b)) => natural_version_cmp(b, a),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
    });
}

/// Numeric-aware version compare (`"9" < "10"`), mirroring
/// `ostree_compare_vversion`'s segment-wise comparison rather than a
/// lexical `str::cmp`, which would misorder multi-digit versions (§9).
pub fn natural_version_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();
    loop {
        let (Some(&ac), Some(&bc)) = (ai.peek(), bi.peek()) else {
            return ai.count().cmp(&bi.count());
        };
        if ac.is_ascii_digit() && bc.is_ascii_digit() {
            let an = take_number(&mut ai);
            let bn = take_number(&mut bi);
            match an.cmp(&bn) {
                std::cmp::Ordering::Equal => continue,
                other => return other,
            }
        } else {
            match ac.cmp(&bc) {
                std::cmp::Ordering::Equal => {
                    ai.next();
                    bi.next();
                    continue;
                }
                other => return other,
            }
        }
    }
}

fn take_number(it: &mut std::iter::Peekable<std::str::Chars>) -> u64 {
    let mut n: u64 = 0;
    while let Some(&c) = it.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        n = n * 10 + c.to_digit(10).unwrap() as u64;
        it.next();
    }
    n
}

/// Compute (device, inode) for a deployment's checkout directory, or `None`
/// if it doesn't exist (e.g. referenced by an entry but not yet checked
/// out -- the writer's precondition check catches that case separately).
fn checkout_dev_ino(physical_root: &Dir, d: &Deployment) -> Result<Option<(u64, u64)>> {
    use std::os::unix::fs::MetadataExt;
    match physical_root.metadata(d.checkout_path().as_std_path()) {
        Ok(meta) => Ok(Some((meta.dev(), meta.ino()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::path_io(d.checkout_path(), e)),
    }
}

/// Stat `/` to obtain the (device, inode) pair used to detect the booted
/// deployment.
pub fn running_root_dev_ino() -> Result<Option<(u64, u64)>> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata("/").map_err(|e| Error::path_io(Utf8Path::new("/"), e))?;
    Ok(Some((meta.dev(), meta.ino())))
}

/// Open the physical root directory at `path`, returning a directory handle
/// suitable for all other sysroot operations.
pub fn open_physical_root(path: &Utf8Path) -> Result<Dir> {
    Dir::open_ambient_dir(path.as_std_path(), cap_std_ext::cap_std::ambient_authority())
        .map_err(|e| Error::path_io(path, e))
}
