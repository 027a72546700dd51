//! Test-support fixture: a minimal on-disk sysroot skeleton, so tests
//! exercise real directory-fd operations rather than mocks (grounded on
//! `ostree-ext::fixture` and `bootc-lib::deploy`'s use of
//! `cap_std_ext::cap_tempfile::TempDir`).

use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_tempfile::TempDir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::bootconfig::BootConfig;
use crate::deployment::{Deployment, Origin, UnlockedState};
use crate::error::Result;
use crate::kernel::KernelFiles;
use crate::objectstore::{CommitMetadata, ObjectStore, PruneMode, PruneStats};

/// A throwaway physical sysroot rooted at a freshly created temp directory,
/// with the handful of directories every other module assumes exist
/// (`ostree/deploy`, `boot/ostree`).
pub struct Fixture {
    /// The opened physical root directory.
    pub root: TempDir,
}

impl std::fmt::Debug for Fixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixture").finish_non_exhaustive()
    }
}

impl Fixture {
    /// Create an empty sysroot skeleton.
    pub fn new() -> Result<Self> {
        let root = cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority())
            .map_err(|e| crate::error::Error::path_io(Utf8Path::new("<tempdir>"), e))?;
        root.create_dir_all("ostree/deploy")?;
        root.create_dir_all("boot/ostree")?;
        Ok(Self { root })
    }

    /// Check out a trivial deployment: an `os-release`, a kernel under the
    /// new-layout path, an origin file, and the commit's checkout directory.
    /// Returns the fully populated [`Deployment`] record (bootserial left
    /// at 0; callers run [`crate::writer::assign_bootserials`] themselves
    /// once they have the whole vector).
    pub fn add_deployment(&self, osname: &str, csum: &str, deployserial: u32, version: &str) -> Result<Deployment> {
        let checkout = format!("ostree/deploy/{osname}/deploy/{csum}.{deployserial}");
        self.root.create_dir_all(format!("{checkout}/usr/lib/ostree-boot"))?;
        self.root.create_dir_all(format!("{checkout}/usr/lib"))?;
        self.root.write(
            format!("{checkout}/usr/lib/os-release"),
            format!("PRETTY_NAME=\"Fixture Linux\"\nID=fixture\nVERSION={version}\n").as_bytes(),
        )?;
        let kernel_bytes = format!("kernel-for-{csum}").into_bytes();
        self.root
            .write(format!("{checkout}/usr/lib/ostree-boot/vmlinuz-abc"), &kernel_bytes)?;

        let deployment_root = self.root.open_dir(checkout.as_str())?;
        let files = KernelFiles {
            sha: "abc".to_string(),
            vmlinuz: camino::Utf8PathBuf::from("usr/lib/ostree-boot/vmlinuz-abc"),
            initramfs: None,
            devicetree: None,
        };
        let bootcsum = crate::kernel::compute_bootcsum(&deployment_root, &files)?;

        let mut bootconfig = BootConfig::new();
        bootconfig.parse("")?;
        bootconfig.set("options", "quiet");

        let origin = Origin {
            refspec: format!("fixture:fixture/{osname}"),
            ..Default::default()
        };
        self.root.write(
            format!("{checkout}.origin"),
            origin.to_string_serialized().as_bytes(),
        )?;

        Ok(Deployment {
            osname: osname.to_string(),
            csum: csum.to_string(),
            deployserial,
            bootcsum,
            bootserial: 0,
            bootconfig,
            origin,
            unlocked: UnlockedState::None,
        })
    }
}

/// An [`ObjectStore`] that treats "commits" as plain directories under a
/// root directory, for exercising writer/cleanup code paths without a real
/// object store. `checkout` recursively copies; `prune` is a no-op.
pub struct FixtureObjectStore {
    content_root: TempDir,
}

impl std::fmt::Debug for FixtureObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureObjectStore").finish_non_exhaustive()
    }
}

impl FixtureObjectStore {
    /// Create a store with an empty backing directory.
    pub fn new() -> Result<Self> {
        Ok(Self {
            content_root: cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority())
                .map_err(|e| crate::error::Error::path_io(Utf8Path::new("<tempdir>"), e))?,
        })
    }

    /// Seed a commit's content under `content_root/<commit>/...`.
    pub fn seed(&self, commit: &str, relpath: &str, contents: &[u8]) -> Result<()> {
        self.content_root.create_dir_all(commit)?;
        let full = format!("{commit}/{relpath}");
        if let Some(parent) = std::path::Path::new(&full).parent() {
            if parent != std::path::Path::new("") {
                self.content_root.create_dir_all(parent)?;
            }
        }
        self.content_root.write(full, contents)?;
        Ok(())
    }
}

impl ObjectStore for FixtureObjectStore {
    fn checkout(&self, commit: &str, target_dir: &cap_std_ext::cap_std::fs::Dir) -> Result<()> {
        let src = self.content_root.open_dir(commit)?;
        copy_tree_recursive(&src, target_dir)
    }

    fn load_commit_metadata(&self, _commit: &str) -> Result<CommitMetadata> {
        Ok(CommitMetadata::default())
    }

    fn prune(&self, _mode: PruneMode) -> Result<PruneStats> {
        Ok(PruneStats::default())
    }
}

fn copy_tree_recursive(src: &cap_std_ext::cap_std::fs::Dir, dst: &cap_std_ext::cap_std::fs::Dir) -> Result<()> {
    for entry in src.entries()? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let ft = entry.file_type()?;
        if ft.is_dir() {
            dst.create_dir_all(&name)?;
            let sub_src = src.open_dir(name.as_str())?;
            let sub_dst = dst.open_dir(name.as_str())?;
            copy_tree_recursive(&sub_src, &sub_dst)?;
        } else {
            src.copy_file_at(name.as_str(), dst, name.as_str())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_add_deployment() -> Result<()> {
        let fixture = Fixture::new()?;
        let d = fixture.add_deployment("fedora", "aaaa", 0, "42")?;
        assert_eq!(d.osname, "fedora");
        assert!(!d.bootcsum.is_empty());
        assert!(fixture
            .root
            .try_exists("ostree/deploy/fedora/deploy/aaaa.0/usr/lib/os-release")?);
        Ok(())
    }

    #[test]
    fn test_fixture_object_store_checkout() -> Result<()> {
        let store = FixtureObjectStore::new()?;
        store.seed("aaaa", "usr/lib/os-release", b"ID=fixture\n")?;
        let target = cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority())?;
        store.checkout("aaaa", &target)?;
        assert_eq!(target.read_to_string("usr/lib/os-release")?, "ID=fixture\n");
        Ok(())
    }
}
