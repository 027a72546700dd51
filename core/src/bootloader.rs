//! Bootloader driver (§4.9, §6.2).
//!
//! Upstream models this as OO virtual dispatch over a handful of concrete
//! backends; per this repository's redesign notes that becomes a sum type
//! dispatched statically, since the set of backends is closed and known at
//! compile time (§9 "Object-oriented virtual dispatch for bootloader
//! backends").

use std::collections::BTreeSet;

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::deployment::Deployment;
use crate::error::{Error, Result};

/// Stamp file recording that an out-of-band bootloader installer still
/// needs to run after the visible cutover; survives a crash between
/// cutover and the external tool invocation (§4.11 step 12, §7).
pub const POST_BLS_SYNC_STAMP: &str = "boot/ostree-bootloader-update.stamp";

/// A concrete bootloader backend. The set is closed, so dispatch below is
/// a single `match`, not a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderKind {
    /// grub2, BIOS boot: `boot/grub2/grub.cfg`, atomic rename.
    Grub2Bios,
    /// grub2, EFI boot: `boot/efi/EFI/<vendor>/grub.cfg`, FAT-limited
    /// non-atomic swap.
    Grub2Efi,
    /// extlinux/syslinux: `boot/syslinux/syslinux.cfg`.
    Syslinux,
    /// U-Boot: `boot/loader/uEnv.txt`.
    Uboot,
    /// Android-style `aboot-deploy`; never auto-detected.
    Aboot,
    /// s390x zipl; never auto-detected.
    Zipl,
    /// No bootloader could be (or was asked to be) probed.
    None,
}

impl BootloaderKind {
    /// Human-readable name, used in `BootloaderWriteFailure` errors.
    pub fn name(&self) -> &'static str {
        match self {
            BootloaderKind::Grub2Bios => "grub2-bios",
            BootloaderKind::Grub2Efi => "grub2-efi",
            BootloaderKind::Syslinux => "syslinux",
            BootloaderKind::Uboot => "uboot",
            BootloaderKind::Aboot => "aboot",
            BootloaderKind::Zipl => "zipl",
            BootloaderKind::None => "none",
        }
    }

    /// Whether this backend's own config swap is atomic. `false` means the
    /// writer must take the extra remount/fsync care described in §4.11.
    pub fn is_atomic(&self) -> bool {
        !matches!(self, BootloaderKind::Grub2Efi | BootloaderKind::Aboot | BootloaderKind::Zipl)
    }

    /// Whether this backend needs an external helper run after cutover
    /// (§4.9 `post_bls_sync`).
    pub fn needs_post_bls_sync(&self) -> bool {
        matches!(self, BootloaderKind::Aboot | BootloaderKind::Zipl)
    }

    /// Write this backend's native configuration referencing
    /// `boot/loader.<new_bootversion>/`, from the already-rendered entries
    /// in `deployments` (§4.9 `write_config`).
    pub fn write_config(
        &self,
        physical_root: &Dir,
        new_bootversion: u8,
        deployments: &[Deployment],
    ) -> Result<()> {
        let result = match self {
            BootloaderKind::Grub2Bios => write_grub2(physical_root, new_bootversion, deployments, false),
            BootloaderKind::Grub2Efi => write_grub2(physical_root, new_bootversion, deployments, true),
            BootloaderKind::Syslinux => write_syslinux(physical_root, deployments),
            BootloaderKind::Uboot => write_uboot(physical_root, deployments),
            BootloaderKind::Aboot | BootloaderKind::Zipl => write_stamp_only(physical_root),
            BootloaderKind::None => Ok(()),
        };
        result.map_err(|e| Error::BootloaderWriteFailure {
            driver: self.name().to_string(),
            msg: e.to_string(),
        })
    }

    /// Run the external installer for backends that need one, if the stamp
    /// file from a prior `write_config` is present. Removes the stamp on
    /// success; a failure here is logged by the caller but does not roll
    /// back the already-completed cutover (§7).
    pub fn post_bls_sync(&self, physical_root: &Dir) -> Result<()> {
        if !self.needs_post_bls_sync() {
            return Ok(());
        }
        if !physical_root
            .try_exists(POST_BLS_SYNC_STAMP)
            .map_err(|e| Error::path_io(Utf8Path::new(POST_BLS_SYNC_STAMP), e))?
        {
            return Ok(());
        }
        let bin = match self {
            BootloaderKind::Aboot => "aboot-deploy",
            BootloaderKind::Zipl => "zipl",
            _ => unreachable!("checked by needs_post_bls_sync"),
        };
        let status = std::process::Command::new(bin)
            .status()
            .map_err(|e| Error::BootloaderWriteFailure {
                driver: self.name().to_string(),
                msg: e.to_string(),
            })?;
        if !status.success() {
            return Err(Error::BootloaderWriteFailure {
                driver: self.name().to_string(),
                msg: format!("{bin} exited with {status}"),
            });
        }
        physical_root
            .remove_file_optional(POST_BLS_SYNC_STAMP)
            .map_err(|e| Error::path_io(Utf8Path::new(POST_BLS_SYNC_STAMP), e))?;
        Ok(())
    }
}

/// Probe for an active bootloader by testing each well-known config path in
/// order, matching §4.9's closing paragraph. `aboot`/`zipl` are never
/// auto-detected and must be explicitly selected by the caller.
pub fn probe(physical_root: &Dir) -> Result<BootloaderKind> {
    let boot = physical_root.open_dir_optional("boot").map_err(|e| Error::path_io(Utf8Path::new("boot"), e))?;
    let Some(boot) = boot else {
        return Ok(BootloaderKind::None);
    };

    if efi_grub_cfg_exists(&boot)? {
        return Ok(BootloaderKind::Grub2Efi);
    }
    if boot
        .try_exists("grub2/grub.cfg")
        .map_err(|e| Error::path_io(Utf8Path::new("boot/grub2/grub.cfg"), e))?
    {
        return Ok(BootloaderKind::Grub2Bios);
    }
    if boot
        .symlink_metadata("syslinux/syslinux.cfg")
        .map(|m| m.is_symlink())
        .unwrap_or(false)
    {
        return Ok(BootloaderKind::Syslinux);
    }
    if boot
        .metadata("loader/uEnv.txt")
        .map(|m| m.is_file())
        .unwrap_or(false)
    {
        return Ok(BootloaderKind::Uboot);
    }
    Ok(BootloaderKind::None)
}

fn efi_grub_cfg_exists(boot: &Dir) -> Result<bool> {
    let Some(efi_dir) = boot
        .open_dir_optional("efi/EFI")
        .map_err(|e| Error::path_io(Utf8Path::new("boot/efi/EFI"), e))?
    else {
        return Ok(false);
    };
    for entry in efi_dir.entries().map_err(|e| Error::path_io(Utf8Path::new("boot/efi/EFI"), e))? {
        let entry = entry.map_err(|e| Error::path_io(Utf8Path::new("boot/efi/EFI"), e))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if efi_dir
            .try_exists(format!("{name}/grub.cfg"))
            .map_err(|e| Error::path_io(Utf8Path::new("boot/efi/EFI"), e))?
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn entry_field<'a>(d: &'a Deployment, key: &str) -> &'a str {
    d.bootconfig.get(key).unwrap_or_default()
}

/// Render the grub2 wrapper-script preamble (`_OSTREE_GRUB2_BOOTVERSION`,
/// `_OSTREE_GRUB2_IS_EFI`) plus one `menuentry` per deployment, and write
/// it either atomically (BIOS) or via the FAT-limited backup/rename dance
/// (EFI) (§6.2).
fn write_grub2(physical_root: &Dir, new_bootversion: u8, deployments: &[Deployment], is_efi: bool) -> Result<()> {
    let mut buf = String::new();
    buf.push_str(&format!("set _OSTREE_GRUB2_BOOTVERSION=\"{new_bootversion}\"\n"));
    buf.push_str(&format!(
        "set _OSTREE_GRUB2_IS_EFI=\"{}\"\n",
        if is_efi { "1" } else { "0" }
    ));
    for d in deployments {
        let title = entry_field(d, "title");
        let linux = entry_field(d, "linux");
        let initrd = entry_field(d, "initrd");
        let options = entry_field(d, "options");
        buf.push_str(&format!("menuentry '{title}' {{\n"));
        buf.push_str(&format!("\tlinux {linux} {options}\n"));
        if !initrd.is_empty() {
            buf.push_str(&format!("\tinitrd {initrd}\n"));
        }
        buf.push_str("}\n");
    }

    if is_efi {
        let dir = physical_root
            .open_dir("boot/efi/EFI")
            .map_err(|e| Error::path_io(Utf8Path::new("boot/efi/EFI"), e))?;
        // FAT doesn't support atomic rename-over in all configurations;
        // upstream backs up the old config rather than risk a torn write.
        if dir
            .try_exists("grub2/grub.cfg")
            .map_err(|e| Error::path_io(Utf8Path::new("grub.cfg"), e))?
        {
            dir.rename("grub2/grub.cfg", &dir, "grub2/grub.cfg.old")
                .map_err(|e| Error::path_io(Utf8Path::new("grub.cfg.old"), e))?;
        }
        dir.write("grub2/grub.cfg.new", buf.as_bytes())
            .map_err(|e| Error::path_io(Utf8Path::new("grub.cfg.new"), e))?;
        dir.rename("grub2/grub.cfg.new", &dir, "grub2/grub.cfg")
            .map_err(|e| Error::path_io(Utf8Path::new("grub.cfg"), e))?;
    } else {
        physical_root
            .atomic_write("boot/grub2/grub.cfg", buf.as_bytes())
            .map_err(|e| Error::path_io(Utf8Path::new("boot/grub2/grub.cfg"), e))?;
    }
    Ok(())
}

/// Append ostree entries to `syslinux.cfg`, preserving every non-ostree
/// `LABEL` block (one ends at the next un-indented line) and replacing the
/// `DEFAULT` line to point at the first new deployment (§6.2).
fn write_syslinux(physical_root: &Dir, deployments: &[Deployment]) -> Result<()> {
    let existing = physical_root
        .read_to_string("boot/syslinux/syslinux.cfg")
        .unwrap_or_default();
    let ostree_titles: BTreeSet<&str> = deployments.iter().map(|d| entry_field(d, "title")).collect();

    let mut preserved = String::new();
    let mut lines = existing.lines().peekable();
    'outer: while let Some(line) = lines.next() {
        if let Some(label) = line.strip_prefix("LABEL ") {
            if ostree_titles.contains(label.trim()) {
                // Skip this block (an ostree-owned LABEL from a previous
                // write); it will be re-emitted below.
                while let Some(next) = lines.peek() {
                    if next.starts_with(' ') || next.starts_with('\t') {
                        lines.next();
                    } else {
                        continue 'outer;
                    }
                }
                continue;
            }
        }
        if line.starts_with("DEFAULT ") {
            continue;
        }
        preserved.push_str(line);
        preserved.push('\n');
    }

    let mut buf = preserved;
    if let Some(first) = deployments.first() {
        buf.push_str(&format!("DEFAULT {}\n", entry_field(first, "title")));
    }
    for d in deployments {
        let title = entry_field(d, "title");
        let linux = entry_field(d, "linux");
        let initrd = entry_field(d, "initrd");
        let options = entry_field(d, "options");
        buf.push_str(&format!("LABEL {title}\n"));
        buf.push_str(&format!("\tKERNEL {linux}\n"));
        if !initrd.is_empty() {
            buf.push_str(&format!("\tINITRD {initrd}\n"));
        }
        buf.push_str(&format!("\tAPPEND {options}\n"));
    }

    physical_root
        .atomic_write("boot/syslinux/syslinux.cfg", buf.as_bytes())
        .map_err(|e| Error::path_io(Utf8Path::new("boot/syslinux/syslinux.cfg"), e))
}

/// Write `uEnv.txt`: three lines describing only the first (default)
/// deployment (§6.2).
fn write_uboot(physical_root: &Dir, deployments: &[Deployment]) -> Result<()> {
    let Some(first) = deployments.first() else {
        return Ok(());
    };
    let mut buf = String::new();
    buf.push_str(&format!("kernel_image={}\n", entry_field(first, "linux")));
    let initrd = entry_field(first, "initrd");
    if !initrd.is_empty() {
        buf.push_str(&format!("ramdisk_image={initrd}\n"));
    }
    buf.push_str(&format!("bootargs={}\n", entry_field(first, "options")));
    physical_root
        .atomic_write("boot/loader/uEnv.txt", buf.as_bytes())
        .map_err(|e| Error::path_io(Utf8Path::new("boot/loader/uEnv.txt"), e))
}

/// aboot/zipl don't have a native config file the core understands; drop
/// the stamp consumed by [`BootloaderKind::post_bls_sync`] and let the
/// external tool do the rest.
fn write_stamp_only(physical_root: &Dir) -> Result<()> {
    physical_root
        .write(POST_BLS_SYNC_STAMP, b"")
        .map_err(|e| Error::path_io(Utf8Path::new(POST_BLS_SYNC_STAMP), e))
}
