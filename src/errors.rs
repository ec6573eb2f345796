//! Typed error kinds and classification helpers.
//!
//! Every outbound call flows through the retry engine, which needs to
//! distinguish errors it must give up on immediately from errors worth
//! backing off and retrying. Classification is done by *kind*, detected
//! by downcasting anywhere along the `source()` chain:
//!
//! | Kind                      | Retryable | Raised by                        |
//! |---------------------------|-----------|----------------------------------|
//! | `NonRetryableError`       | no        | Consul client (4xx except 429)   |
//! | `MissingConsulAclError`   | no        | Consul client (403)              |
//! | `NonEnterpriseConsulError`| no        | Consul client (404 on license)   |
//! | `UnhealthySystemError`    | no        | health checks                    |
//! | anything else             | yes       | network failures, 5xx, 429, ...  |
//!
//! Wrapping always preserves the cause, so a `MissingConsulAclError`
//! buried three layers deep in a retry composite still classifies.

use std::error::Error as StdError;
use std::fmt;

use regex::Regex;
use thiserror::Error;

/// Boxed error type carried across subsystem seams.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

// ── Error kinds ───────────────────────────────────────────────────────────────

/// An error the retry engine must not back off on.
///
/// Opaque wrapper; consumers downcast through the chain to find it.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct NonRetryableError {
    #[source]
    pub source: BoxError,
}

impl NonRetryableError {
    pub fn new(source: BoxError) -> Self {
        Self { source }
    }
}

/// A Consul call was denied because the configured token lacks an ACL.
///
/// Also non-retryable: retrying cannot grow the token's permissions.
#[derive(Debug, Error)]
#[error("missing Consul ACL: {source}. Check that a token with sufficient permissions is configured")]
pub struct MissingConsulAclError {
    #[source]
    pub source: BoxError,
}

impl MissingConsulAclError {
    pub fn new(source: BoxError) -> Self {
        Self { source }
    }
}

/// An enterprise-only Consul endpoint was called against a
/// community-edition server. Also non-retryable.
#[derive(Debug, Error)]
#[error("Consul is not an enterprise server: {source}")]
pub struct NonEnterpriseConsulError {
    #[source]
    pub source: BoxError,
}

impl NonEnterpriseConsulError {
    pub fn new(source: BoxError) -> Self {
        Self { source }
    }
}

/// The system reported itself unhealthy. Opaque, no cause.
#[derive(Debug, Error)]
#[error("unhealthy system: {0}")]
pub struct UnhealthySystemError(pub String);

// ── Composite retry error ─────────────────────────────────────────────────────

/// Accumulated failure returned by the retry engine after it gives up.
///
/// Keeps one line per attempt for the operator and the last underlying
/// error as the `source`, so kind downcasts still work through it.
#[derive(Debug)]
pub struct RetryExhaustedError {
    pub description: String,
    pub attempts: Vec<String>,
    pub source: Option<BoxError>,
}

impl fmt::Display for RetryExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retrying '{}' failed", self.description)?;
        for line in &self.attempts {
            write!(f, "\n{}", line)?;
        }
        Ok(())
    }
}

impl StdError for RetryExhaustedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.source {
            Some(e) => {
                let cause: &(dyn StdError + 'static) = e.as_ref();
                Some(cause)
            }
            None => None,
        }
    }
}

// ── Chain walking ─────────────────────────────────────────────────────────────

/// Iterates an error and every `source()` beneath it.
pub fn chain<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> + 'a {
    let mut cur = Some(err);
    std::iter::from_fn(move || {
        let e = cur?;
        cur = e.source();
        Some(e)
    })
}

/// True if any error in the chain is one of the fatal kinds the retry
/// engine must not retry.
pub fn is_non_retryable(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| {
        e.downcast_ref::<NonRetryableError>().is_some()
            || e.downcast_ref::<MissingConsulAclError>().is_some()
            || e.downcast_ref::<NonEnterpriseConsulError>().is_some()
            || e.downcast_ref::<UnhealthySystemError>().is_some()
    })
}

/// True if any error in the chain is a `MissingConsulAclError`.
pub fn is_missing_acl(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| e.downcast_ref::<MissingConsulAclError>().is_some())
}

/// True if any error in the chain is a `NonEnterpriseConsulError`.
pub fn is_non_enterprise(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| e.downcast_ref::<NonEnterpriseConsulError>().is_some())
}

// ── HTTP status recovery ──────────────────────────────────────────────────────

lazy_static::lazy_static! {
    /// Matches the status phrasing the Consul API uses in error text,
    /// e.g. "Unexpected response code: 403 (rpc error ...)".
    static ref RESPONSE_CODE_RE: Regex =
        Regex::new(r"Unexpected response code: (\d{3})").expect("invalid response-code regex");
}

/// Recovers an HTTP status code from an error's text, walking the whole
/// chain. Used when a typed status did not survive a boxing boundary.
pub fn status_from_error(err: &(dyn StdError + 'static)) -> Option<u16> {
    chain(err).find_map(|e| {
        RESPONSE_CODE_RE
            .captures(&e.to_string())
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}
