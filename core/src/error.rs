//! The error type returned by this crate's fallible operations.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors surfaced by the deployment engine.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("I/O error on {path}: {err}")]
    PathIo {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("no deployment is currently booted")]
    NotBooted,
    #[error("deployment already exists: {osname}/{csum}.{deployserial}")]
    AlreadyExists {
        osname: String,
        csum: String,
        deployserial: u32,
    },
    #[error("deployment {osname}/{csum}.{deployserial} has no checkout directory")]
    MissingCheckout {
        osname: String,
        csum: String,
        deployserial: u32,
    },
    #[error("no vmlinuz-<sha> found under {0}")]
    MissingKernel(Utf8PathBuf),
    #[error("kernel checksum mismatch: vmlinuz is {vmlinuz_sha} but initramfs is {other_sha}")]
    KernelChecksumMismatch {
        vmlinuz_sha: String,
        other_sha: String,
    },
    #[error("kernel directory {path} does not match the deployment's recorded bootcsum {expected} (found {found})")]
    KernelChecksumDrift {
        path: Utf8PathBuf,
        expected: String,
        found: String,
    },
    #[error("failed to parse ostree= argument: {0}")]
    InvalidBootlink(String),
    #[error("failed to probe for an active bootloader: {0}")]
    BootloaderProbeFailure(String),
    #[error("bootloader {driver} failed to write its configuration: {msg}")]
    BootloaderWriteFailure { driver: String, msg: String },
    #[error("both /etc and /usr/etc exist in new deployment root")]
    ConfigMergeConflict,
    #[error("corrupted on-disk layout: {0}")]
    CorruptedLayout(String),
    #[error("the sysroot lock is held by another process")]
    LockContended,
    #[error("operation was cancelled")]
    Cancelled,
}

/// This crate's result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a [`Error::PathIo`] from an I/O error observed against a path.
    pub(crate) fn path_io(path: impl Into<Utf8PathBuf>, err: std::io::Error) -> Self {
        Error::PathIo {
            path: path.into(),
            err,
        }
    }
}
