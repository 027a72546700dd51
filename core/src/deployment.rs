//! Deployment record (§3.1, §4.3) and its on-disk origin file (§6.3).

use std::collections::BTreeMap;

use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::bootconfig::BootConfig;
use crate::error::{Error, Result};

/// The administrator-visible "unlocked" state of a deployment.
///
/// `Development`/`Hotfix` deployments leave the checkout directory mutable
/// (the immutable flag is never applied to them); `Transient` deployments
/// are expected to vanish on their own since nothing persists their origin,
/// so cleanup's keep/prune accounting never reasons about them the way it
/// does for a durable deployment (see `SPEC_FULL.md`'s supplemented-features
/// section, derived from `ostree-deployment.c`/`ostree-sysroot-deploy.c`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnlockedState {
    /// Normal, immutable deployment.
    #[default]
    None,
    /// `/usr` is bind-mounted read-write for local package development.
    Development,
    /// A single hotfix overlay is applied read-write.
    Hotfix,
    /// Mutable and not persisted across reboot.
    Transient,
}

impl UnlockedState {
    /// Whether this state means the deployment root must stay mutable
    /// (no immutable flag applied).
    pub fn is_mutable(self) -> bool {
        !matches!(self, UnlockedState::None)
    }

    fn as_origin_str(self) -> Option<&'static str> {
        match self {
            UnlockedState::None => None,
            UnlockedState::Development => Some("development"),
            UnlockedState::Hotfix => Some("hotfix"),
            UnlockedState::Transient => Some("transient"),
        }
    }

    fn from_origin_str(s: &str) -> Self {
        match s {
            "development" => UnlockedState::Development,
            "hotfix" => UnlockedState::Hotfix,
            "transient" => UnlockedState::Transient,
            _ => UnlockedState::None,
        }
    }
}

/// Upgrade-source metadata recorded alongside a deployment's checkout,
/// opaque to the core beyond the handful of keys it reads itself.
///
/// Persisted as an INI file, section `[origin]` (§6.3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    /// `refspec = <remote>:<ref>`, the minimum required key.
    pub refspec: String,
    /// Optional pin overriding the refspec's latest commit.
    pub override_commit: Option<String>,
    /// Opaque free-form state recorded by higher layers.
    pub unconfigured_state: Option<String>,
    /// Raw `unlocked` value as last written; re-derived into
    /// [`UnlockedState`] by the caller.
    pub unlocked: Option<String>,
    /// Any other keys present in the `[origin]` section, preserved
    /// verbatim so the core never drops data it doesn't understand.
    pub extra: BTreeMap<String, String>,
}

impl Origin {
    /// Parse an origin file's contents.
    pub fn parse(contents: &str) -> Result<Self> {
        let ini = tini::Ini::from_string(contents)
            .map_err(|e| Error::CorruptedLayout(format!("invalid origin file: {e}")))?;
        let refspec: String = ini
            .get("origin", "refspec")
            .ok_or_else(|| Error::CorruptedLayout("origin file missing refspec".to_string()))?;
        let override_commit = ini.get("origin", "override-commit");
        let unconfigured_state = ini.get("origin", "unconfigured-state");
        let unlocked = ini.get("origin", "unlocked");
        Ok(Self {
            refspec,
            override_commit,
            unconfigured_state,
            unlocked,
            extra: BTreeMap::new(),
        })
    }

    /// Parse the origin file at `path` relative to `dir`.
    pub fn parse_at(dir: &Dir, path: &Utf8Path) -> Result<Self> {
        let contents = dir
            .read_to_string(path.as_std_path())
            .map_err(|e| Error::path_io(path, e))?;
        Self::parse(&contents)
    }

    /// Serialize back to INI text.
    pub fn to_string_serialized(&self) -> String {
        let mut buf = String::new();
        buf.push_str("[origin]\n");
        buf.push_str(&format!("refspec={}\n", self.refspec));
        if let Some(v) = &self.override_commit {
            buf.push_str(&format!("override-commit={v}\n"));
        }
        if let Some(v) = &self.unconfigured_state {
            buf.push_str(&format!("unconfigured-state={v}\n"));
        }
        if let Some(v) = &self.unlocked {
            buf.push_str(&format!("unlocked={v}\n"));
        }
        for (k, v) in &self.extra {
            buf.push_str(&format!("{k}={v}\n"));
        }
        buf
    }

    /// This origin's [`UnlockedState`], default `None` if unset/unrecognized.
    pub fn unlocked_state(&self) -> UnlockedState {
        self.unlocked
            .as_deref()
            .map(UnlockedState::from_origin_str)
            .unwrap_or_default()
    }
}

/// One installed, bootable filesystem tree (§3.1).
///
/// Deployments are immutable values: clone by full copy, matching the
/// upstream object's copy-on-write-free clone semantics rather than
/// reference-counted sharing.
#[derive(Debug, Clone)]
pub struct Deployment {
    /// Administrative grouping under which deployments share `/var`.
    pub osname: String,
    /// The commit checked out as this deployment's root.
    pub csum: String,
    /// Disambiguator for repeated (osname, csum) pairs.
    pub deployserial: u32,
    /// SHA-256 over kernel + initramfs + devicetree bytes.
    pub bootcsum: String,
    /// Tiebreaker assigned at write time within a shared bootcsum.
    pub bootserial: u32,
    /// This deployment's bootloader-entry record.
    pub bootconfig: BootConfig,
    /// Upgrade-source metadata.
    pub origin: Origin,
    /// Mutability state.
    pub unlocked: UnlockedState,
}

impl Deployment {
    /// The directory name for this deployment's checkout under
    /// `ostree/deploy/<osname>/deploy/`.
    pub fn checkout_dirname(&self) -> String {
        format!("{}.{}", self.csum, self.deployserial)
    }

    /// The sibling origin file name for [`Self::checkout_dirname`].
    pub fn origin_filename(&self) -> String {
        format!("{}.origin", self.checkout_dirname())
    }

    /// The relative path to this deployment's checkout directory, rooted at
    /// the physical sysroot.
    pub fn checkout_path(&self) -> camino::Utf8PathBuf {
        camino::Utf8PathBuf::from(format!(
            "ostree/deploy/{}/deploy/{}",
            self.osname,
            self.checkout_dirname()
        ))
    }

    /// Two deployments identify the same installed tree iff their
    /// (osname, csum, deployserial) triple matches (§3.1 invariant).
    pub fn identity_eq(&self, other: &Self) -> bool {
        self.osname == other.osname
            && self.csum == other.csum
            && self.deployserial == other.deployserial
    }
}
