//! Debug/behavioral controls read once from the environment (§6.4).

/// Env var parsed into [`SysrootDebugFlags`].
const OSTREE_SYSROOT_DEBUG: &str = "OSTREE_SYSROOT_DEBUG";

/// Bitset of the comma-separated values accepted by `OSTREE_SYSROOT_DEBUG`.
///
/// Parsed once at sysroot-open time and threaded through the writer, rather
/// than re-reading the environment at each call site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SysrootDebugFlags {
    /// `mutable-deployments`: skip applying the immutable flag to deployment roots.
    pub mutable_deployments: bool,
    /// `no-xattrs`: suppress xattr copy during config merge and checkout.
    pub no_xattrs: bool,
}

impl SysrootDebugFlags {
    /// Parse from the given raw value (as would be read from the environment).
    pub fn from_str_value(value: &str) -> Self {
        let mut flags = Self::default();
        for word in value.split(',').map(str::trim) {
            match word {
                "mutable-deployments" => flags.mutable_deployments = true,
                "no-xattrs" => flags.no_xattrs = true,
                _ => {}
            }
        }
        flags
    }

    /// Parse from the process environment, defaulting to all-`false` if unset.
    pub fn from_env() -> Self {
        std::env::var(OSTREE_SYSROOT_DEBUG)
            .map(|v| Self::from_str_value(&v))
            .unwrap_or_default()
    }
}
