//! Terraform binary version constraint.
//!
//! The supported major line is fixed at compile time. The constraint is
//! parsed once at process init; a parse failure is a programming error
//! and panics immediately rather than surfacing as a runtime failure.

use semver::{Version, VersionReq};
use thiserror::Error;

use crate::errors::BoxError;

/// Terraform versions this daemon drives. The 1.x line.
pub const TERRAFORM_VERSION_CONSTRAINT: &str = ">=1.0.0, <2.0.0";

lazy_static::lazy_static! {
    static ref CONSTRAINT: VersionReq = VersionReq::parse(TERRAFORM_VERSION_CONSTRAINT)
        .expect("compile-time terraform version constraint must parse");
}

/// True if `version` satisfies the compiled-in constraint. Pure.
pub fn check(version: &Version) -> bool {
    CONSTRAINT.matches(version)
}

#[derive(Debug, Error)]
#[error("unable to parse terraform version from {0:?}")]
pub struct VersionParseError(String);

/// Extracts the version from `terraform version` output, e.g.
/// `"Terraform v1.5.7\non linux_amd64"`.
pub fn parse_version_output(output: &str) -> Result<Version, BoxError> {
    let first = output.lines().next().unwrap_or_default();
    let raw = first
        .split_whitespace()
        .find(|w| w.starts_with('v') && w.len() > 1)
        .map(|w| &w[1..])
        .ok_or_else(|| VersionParseError(first.to_string()))?;
    Ok(Version::parse(raw)?)
}
