//! Deterministic fingerprints of everything that affects a native build.
//!
//! A fingerprint is computed in two phases:
//! - [`SourceCollector`] assembles the set of [`HashSource`]s for one platform
//!   (framework manifest, platform project directory, linked native modules,
//!   script declarations, user-configured extra sources).
//! - [`FingerprintEngine`] reduces that set to a single SHA-256 digest plus a
//!   per-source breakdown.
//!
//! The digest depends only on file contents and declared values. It does not
//! depend on modification times, traversal order, the order sources were
//! supplied in, or host path separators. The `reasons` attached to each source
//! are diagnostics only and never reach the hasher.

mod collector;
mod dependency;
mod digest;
mod engine;
mod error;
mod filter;
mod platform;
mod source;

pub use collector::{SourceCollector, DEFAULT_FRAMEWORK_MANIFEST};
pub use dependency::{DependencyGraph, NativeDependencyResolver};
pub use digest::{Fingerprint, FINGERPRINT_HEX_LEN};
pub use engine::{FingerprintEngine, FingerprintResult, SourceContribution, EMPTY_DIR_SENTINEL};
pub use error::{FingerprintError, Result};
pub use filter::{PathFilter, DEFAULT_EXCLUDES};
pub use platform::Platform;
pub use source::{FingerprintOptions, HashSource, SourceKind};

use std::path::Path;

/// Tracing target shared by the fingerprint crate.
pub(crate) const LOG_TARGET: &str = "prebuilt.fingerprint";

/// Collect and hash every input of a native build for `options.platform`.
///
/// Only a missing project root or an unobtainable native dependency graph is
/// fatal. Missing optional sources and unreadable files are logged and left out
/// of the fingerprint.
pub fn compute_fingerprint<R>(
    project_root: impl AsRef<Path>,
    options: &FingerprintOptions,
    resolver: &R,
) -> Result<FingerprintResult>
where
    R: NativeDependencyResolver + ?Sized,
{
    let collector = SourceCollector::new(project_root, resolver)?;
    collector.fingerprint(options)
}
