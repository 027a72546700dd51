//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
pub mod iterators;
pub mod path;
mod tracing_util;
pub use tracing_util::*;
