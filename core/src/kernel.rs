//! Kernel staging (§4.7): locating a deployment's kernel/initramfs/
//! devicetree under its checkout and copying them into the per-bootcsum
//! directory shared by every deployment with the same `bootcsum`.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::path::hardlink_or_copy;

/// The layout a deployment's kernel lives under; new-layout is always
/// preferred when both are present (mirrors `ostree-sysroot-deploy.c`'s
/// `get_kernel_from_tree` search order).
const NEW_LAYOUT_DIR: &str = "usr/lib/ostree-boot";
const LEGACY_LAYOUT_DIR: &str = "boot";

/// The kernel payload files found under a deployment's checkout, all
/// sharing the same `<sha>` checksum suffix (§4.7 step 1).
#[derive(Debug, Clone)]
pub struct KernelFiles {
    /// The `<sha>` suffix shared by every file below.
    pub sha: String,
    /// Path (relative to the deployment root) of `vmlinuz-<sha>`.
    pub vmlinuz: Utf8PathBuf,
    /// Path of `initramfs-<sha>`, if present.
    pub initramfs: Option<Utf8PathBuf>,
    /// Path of `devicetree-<sha>`, if present.
    pub devicetree: Option<Utf8PathBuf>,
}

/// Locate the kernel payload under `deployment_root`, preferring
/// `usr/lib/ostree-boot/` over the legacy `boot/` directory (§4.7 step 1).
pub fn find_kernel(deployment_root: &Dir) -> Result<KernelFiles> {
    for dir in [NEW_LAYOUT_DIR, LEGACY_LAYOUT_DIR] {
        if let Some(files) = find_kernel_in(deployment_root, dir)? {
            return Ok(files);
        }
    }
    Err(Error::MissingKernel(Utf8PathBuf::from(NEW_LAYOUT_DIR)))
}

fn find_kernel_in(deployment_root: &Dir, dir: &str) -> Result<Option<KernelFiles>> {
    let Some(entries_dir) = deployment_root
        .open_dir_optional(dir)
        .map_err(|e| Error::path_io(Utf8Path::new(dir), e))?
    else {
        return Ok(None);
    };

    let mut vmlinuz = None;
    let mut initramfs = None;
    let mut devicetree = None;
    for entry in entries_dir
        .entries()
        .map_err(|e| Error::path_io(Utf8Path::new(dir), e))?
    {
        let entry = entry.map_err(|e| Error::path_io(Utf8Path::new(dir), e))?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Some(sha) = name.strip_prefix("vmlinuz-") {
            vmlinuz = Some((sha.to_string(), name));
        } else if let Some(sha) = name.strip_prefix("initramfs-") {
            initramfs = Some((sha.to_string(), name));
        } else if let Some(sha) = name.strip_prefix("devicetree-") {
            devicetree = Some((sha.to_string(), name));
        }
    }

    let Some((sha, vmlinuz_name)) = vmlinuz else {
        return Ok(None);
    };
    for (label, other) in [("initramfs", &initramfs), ("devicetree", &devicetree)] {
        if let Some((other_sha, _)) = other {
            if *other_sha != sha {
                return Err(Error::KernelChecksumMismatch {
                    vmlinuz_sha: sha,
                    other_sha: format!("{label}:{other_sha}"),
                });
            }
        }
    }

    Ok(Some(KernelFiles {
        vmlinuz: Utf8Path::new(dir).join(&vmlinuz_name),
        initramfs: initramfs.map(|(_, n)| Utf8Path::new(dir).join(n)),
        devicetree: devicetree.map(|(_, n)| Utf8Path::new(dir).join(n)),
        sha,
    }))
}

/// Recompute the bootcsum from staged bytes: SHA-256 over
/// `kernel || initramfs || devicetree` contents, in that order, skipping
/// absent files (§3.1 bootcsum definition, §9 `ostree_repo_regenerate_
/// bootcsum`-equivalent verification).
pub fn compute_bootcsum(
    deployment_root: &Dir,
    files: &KernelFiles,
) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in [
        Some(&files.vmlinuz),
        files.initramfs.as_ref(),
        files.devicetree.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        let bytes = deployment_root
            .read(path.as_std_path())
            .map_err(|e| Error::path_io(path, e))?;
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Target directory for a given (osname, bootcsum) pair, relative to the
/// physical sysroot (§4.7 step 2).
pub fn staging_dir(osname: &str, bootcsum: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("boot/ostree/{osname}-{bootcsum}"))
}

/// Whether the per-bootcsum staging directory already exists (i.e. a
/// previous deployment already staged this kernel; see §4.7 step 2: files
/// are never overwritten once a bootcsum directory exists).
pub fn is_staged(physical_root: &Dir, osname: &str, bootcsum: &str) -> Result<bool> {
    let path = staging_dir(osname, bootcsum);
    physical_root
        .try_exists(path.as_std_path())
        .map_err(|e| Error::path_io(&path, e))
}

/// Copy `files` out of `deployment_root` into the per-bootcsum staging
/// directory under `physical_root` (the sysroot's physical root,
/// containing `boot/`), preferring hardlinks and stripping the `-<sha>`
/// suffix from destination names.
///
/// This recomputes the bootcsum from the copied bytes and compares it to
/// `expected_bootcsum`, the value recorded on the [`crate::deployment::
/// Deployment`] being staged, surfacing [`Error::KernelChecksumDrift`] on
/// mismatch rather than silently staging the wrong kernel (§9 supplemented
/// verification). No-ops if the directory is already staged.
pub fn stage(
    physical_root: &Dir,
    deployment_root: &Dir,
    osname: &str,
    expected_bootcsum: &str,
    files: &KernelFiles,
) -> Result<()> {
    if is_staged(physical_root, osname, expected_bootcsum)? {
        return Ok(());
    }
    let computed = compute_bootcsum(deployment_root, files)?;
    if computed != expected_bootcsum {
        return Err(Error::KernelChecksumDrift {
            path: files.vmlinuz.clone(),
            expected: expected_bootcsum.to_string(),
            found: computed,
        });
    }

    let dest_dir_path = staging_dir(osname, expected_bootcsum);
    physical_root
        .create_dir_all(dest_dir_path.as_std_path())
        .map_err(|e| Error::path_io(&dest_dir_path, e))?;
    let dest_dir = physical_root
        .open_dir(dest_dir_path.as_std_path())
        .map_err(|e| Error::path_io(&dest_dir_path, e))?;

    for (src, dest_name) in [
        (Some(&files.vmlinuz), "vmlinuz"),
        (files.initramfs.as_ref(), "initramfs"),
        (files.devicetree.as_ref(), "devicetree"),
    ] {
        let Some(src) = src else { continue };
        hardlink_or_copy(
            deployment_root,
            src,
            &dest_dir,
            Utf8Path::new(dest_name),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_std;

    fn tmpdir() -> cap_std_ext::cap_tempfile::TempDir {
        cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority()).unwrap()
    }

    #[test]
    fn test_find_kernel_new_layout() -> Result<()> {
        let root = tmpdir();
        root.create_dir_all("usr/lib/ostree-boot")?;
        root.write("usr/lib/ostree-boot/vmlinuz-abc", b"kernel")?;
        root.write("usr/lib/ostree-boot/initramfs-abc", b"initrd")?;
        let files = find_kernel(&root)?;
        assert_eq!(files.sha, "abc");
        assert!(files.devicetree.is_none());
        Ok(())
    }

    #[test]
    fn test_find_kernel_prefers_new_layout() -> Result<()> {
        let root = tmpdir();
        root.create_dir_all("usr/lib/ostree-boot")?;
        root.write("usr/lib/ostree-boot/vmlinuz-new", b"k")?;
        root.create_dir("boot")?;
        root.write("boot/vmlinuz-old", b"k")?;
        let files = find_kernel(&root)?;
        assert_eq!(files.sha, "new");
        Ok(())
    }

    #[test]
    fn test_find_kernel_checksum_mismatch() -> Result<()> {
        let root = tmpdir();
        root.create_dir_all("usr/lib/ostree-boot")?;
        root.write("usr/lib/ostree-boot/vmlinuz-abc", b"k")?;
        root.write("usr/lib/ostree-boot/initramfs-def", b"i")?;
        assert!(matches!(
            find_kernel(&root),
            Err(Error::KernelChecksumMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_stage_is_idempotent_and_checksum_verified() -> Result<()> {
        let root = tmpdir();
        root.create_dir_all("usr/lib/ostree-boot")?;
        root.write("usr/lib/ostree-boot/vmlinuz-abc", b"kernel-bytes")?;
        let files = find_kernel(&root)?;
        let bootcsum = compute_bootcsum(&root, &files)?;

        let boot = tmpdir();
        stage(&boot, &root, "fedora", &bootcsum, &files)?;
        assert!(is_staged(&boot, "fedora", &bootcsum)?);
        assert_eq!(
            boot.read_to_string(format!("boot/ostree/fedora-{bootcsum}/vmlinuz"))?,
            "kernel-bytes"
        );
        // Second call is a no-op, not an error.
        stage(&boot, &root, "fedora", &bootcsum, &files)?;
        Ok(())
    }

    #[test]
    fn test_stage_rejects_drifted_bootcsum() -> Result<()> {
        let root = tmpdir();
        root.create_dir_all("usr/lib/ostree-boot")?;
        root.write("usr/lib/ostree-boot/vmlinuz-abc", b"kernel-bytes")?;
        let files = find_kernel(&root)?;

        let boot = tmpdir();
        let err = stage(&boot, &root, "fedora", "0000deadbeef", &files).unwrap_err();
        assert!(matches!(err, Error::KernelChecksumDrift { .. }));
        Ok(())
    }
}
