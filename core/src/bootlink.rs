//! Bootlink layout (§4.8): the two-level symlink farm indexing deployments
//! by `(osname, bootcsum, bootserial)` under `ostree/boot.<B>.<S>/`, and
//! the `ostree/boot.<B>` symlink naming the active subbootversion.

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::deployment::Deployment;
use crate::error::{Error, Result};
use crate::path::{rm_rf, symlink_replace};

/// Rebuild the bootlink farm for `(bootversion, subbootversion)` from
/// scratch: `rm_rf` any stale directory, create it, then symlink every
/// deployment into place (§4.8 steps 1-2).
///
/// The symlink target is always the 3-level-relative
/// `../../../deploy/<osname>/deploy/<csum>.<deployserial>`, matching the
/// farm's depth under `ostree/boot.<B>.<S>/<osname>/<bootcsum>/`.
pub fn rebuild_farm(
    physical_root: &Dir,
    bootversion: u8,
    subbootversion: u8,
    deployments: &[Deployment],
) -> Result<()> {
    let farm_path = format!("ostree/boot.{bootversion}.{subbootversion}");
    rm_rf(physical_root, Utf8Path::new(&farm_path))?;
    physical_root
        .create_dir_all(&farm_path)
        .map_err(|e| Error::path_io(Utf8Path::new(&farm_path), e))?;
    let farm_dir = physical_root
        .open_dir(&farm_path)
        .map_err(|e| Error::path_io(Utf8Path::new(&farm_path), e))?;

    for d in deployments {
        let link_dir = format!("{}/{}", d.osname, d.bootcsum);
        farm_dir
            .create_dir_all(&link_dir)
            .map_err(|e| Error::path_io(Utf8Path::new(&link_dir), e))?;
        let link_name = format!("{link_dir}/{}", d.bootserial);
        let target = format!("../../../deploy/{}/deploy/{}", d.osname, d.checkout_dirname());
        symlink_replace(
            &farm_dir,
            Utf8Path::new(&target),
            Utf8Path::new(&link_name),
        )?;
    }
    Ok(())
}

/// Atomically point `ostree/boot.<bootversion>` at the given
/// subbootversion's farm directory (§4.8 step 3).
pub fn swap_active(physical_root: &Dir, bootversion: u8, subbootversion: u8) -> Result<()> {
    let link_name = format!("ostree/boot.{bootversion}");
    let target = format!("boot.{bootversion}.{subbootversion}");
    symlink_replace(
        physical_root,
        Utf8Path::new(&target),
        Utf8Path::new(&link_name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootconfig::BootConfig;
    use crate::deployment::{Origin, UnlockedState};
    use cap_std_ext::cap_std;

    fn tmpdir() -> cap_std_ext::cap_tempfile::TempDir {
        cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority()).unwrap()
    }

    fn deployment(osname: &str, csum: &str, bootcsum: &str, bootserial: u32) -> Deployment {
        Deployment {
            osname: osname.into(),
            csum: csum.into(),
            deployserial: 0,
            bootcsum: bootcsum.into(),
            bootserial,
            bootconfig: BootConfig::new(),
            origin: Origin::default(),
            unlocked: UnlockedState::None,
        }
    }

    #[test]
    fn test_rebuild_farm_and_swap() -> Result<()> {
        let root = tmpdir();
        let d = deployment("fedora", "aaaa", "bbbb", 0);
        rebuild_farm(&root, 0, 0, std::slice::from_ref(&d))?;
        let link = format!("ostree/boot.0.0/{}/{}/{}", d.osname, d.bootcsum, d.bootserial);
        let target = root.read_link(&link)?;
        assert_eq!(
            target,
            std::path::PathBuf::from("../../../deploy/fedora/deploy/aaaa.0")
        );

        swap_active(&root, 0, 0)?;
        assert_eq!(
            root.read_link("ostree/boot.0")?,
            std::path::PathBuf::from("boot.0.0")
        );
        Ok(())
    }

    #[test]
    fn test_rebuild_farm_clears_stale_entries() -> Result<()> {
        let root = tmpdir();
        let first = deployment("fedora", "aaaa", "bbbb", 0);
        rebuild_farm(&root, 0, 0, std::slice::from_ref(&first))?;
        let second = deployment("fedora", "cccc", "dddd", 0);
        rebuild_farm(&root, 0, 0, std::slice::from_ref(&second))?;
        assert!(!root.try_exists("ostree/boot.0.0/fedora/bbbb")?);
        assert!(root.try_exists("ostree/boot.0.0/fedora/dddd/0")?);
        Ok(())
    }
}
