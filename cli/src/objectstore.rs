//! A minimal [`ObjectStore`] backing the CLI: "commits" are plain
//! directories named by checksum under a configured root. Deliberately not
//! a real ostree repository (binary object format, signature verification,
//! and remote fetch are all out of scope per the engine's non-goals); this
//! exists only so the CLI's `deploy`/`cleanup` subcommands have something
//! to check out against and drive the core engine end to end.

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use ostree_deploy_core::objectstore::{CommitMetadata, ObjectStore, PruneMode, PruneStats};
use ostree_deploy_core::Result;

/// Backing store rooted at a plain directory: `<root>/<commit>/...` holds
/// the checked-out tree, `<root>/<commit>/commitmeta.json` an optional
/// metadata sidecar.
pub struct DirObjectStore {
    root: Dir,
}

impl std::fmt::Debug for DirObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirObjectStore").finish_non_exhaustive()
    }
}

impl DirObjectStore {
    /// Open (without creating) the repo root at `path`.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        Ok(Self {
            root: Dir::open_ambient_dir(path.as_std_path(), cap_std_ext::cap_std::ambient_authority())?,
        })
    }
}

impl ObjectStore for DirObjectStore {
    fn checkout(&self, commit: &str, target_dir: &Dir) -> Result<()> {
        let src = self.root.open_dir(commit)?;
        copy_tree(&src, target_dir)
    }

    fn load_commit_metadata(&self, commit: &str) -> Result<CommitMetadata> {
        let sidecar = format!("{commit}/commitmeta.json");
        if !self.root.try_exists(&sidecar)? {
            return Ok(CommitMetadata::default());
        }
        let contents = self.root.read_to_string(&sidecar)?;
        let parsed: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(CommitMetadata {
            timestamp: parsed.get("timestamp").and_then(|v| v.as_i64()),
            subject: parsed.get("subject").and_then(|v| v.as_str()).map(str::to_string),
            body: parsed.get("body").and_then(|v| v.as_str()).map(str::to_string),
            version: parsed.get("version").and_then(|v| v.as_str()).map(str::to_string),
            extra: Default::default(),
        })
    }

    fn prune(&self, _mode: PruneMode) -> Result<PruneStats> {
        // Real GC needs reachability analysis over the object store's own
        // format, which this shim deliberately doesn't implement.
        Ok(PruneStats::default())
    }
}

fn copy_tree(src: &Dir, dst: &Dir) -> Result<()> {
    for entry in src.entries()? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if entry.file_type()?.is_dir() {
            dst.create_dir_all(&name)?;
            let sub_src = src.open_dir(name.as_str())?;
            let sub_dst = dst.open_dir(name.as_str())?;
            copy_tree(&sub_src, &sub_dst)?;
        } else {
            src.copy_file_at(name.as_str(), dst, name.as_str())?;
        }
    }
    Ok(())
}
