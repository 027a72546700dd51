//! # OSTree deployment engine
//!
//! This crate implements the deployment engine described in this
//! repository's design documents: given a populated content-addressed
//! object store and an ordered vector of target deployments, it atomically
//! installs them as a parallel family of bootable filesystem trees sharing
//! a single `/var`, merges administrator `/etc` customizations across
//! upgrades, synthesizes bootloader entries, and guarantees that a hard
//! crash at any point leaves the system able to boot the previous
//! configuration.
//!
//! The object store itself, remote transport, the CLI, and SELinux policy
//! computation are external collaborators reached through the narrow
//! traits in [`objectstore`] and [`relabel`]; this crate only consumes them.

pub mod bootconfig;
pub mod bootlink;
pub mod bootloader;
pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod configmerge;
pub mod deployment;
pub mod error;
#[cfg(test)]
pub(crate) mod fixture;
pub mod kargs;
pub mod kernel;
pub mod logging;
pub mod objectstore;
pub mod path;
pub mod relabel;
#[cfg(test)]
mod scenario_tests;
pub mod sysroot;
pub mod writer;

pub use error::{Error, Result};
