//! Shared error taxonomy
//!
//! Every caller-visible failure in the crate maps to one of these classes:
//! - `Validation`: malformed shape or schema mismatch, rejected before any
//!   ledger write, never retried
//! - `NotAuthorized`: permission/resource denial, rejected before any
//!   ledger write
//! - `NotFound`: unknown job/request id
//! - `Transient`: infrastructure unreachable after the built-in retry,
//!   with any partial ledger write rolled back
//! - `JobFailed`: a terminal FAILED state, carrying the stored result text
//!
//! Client polling timeouts are deliberately absent: a poll that hits its
//! ceiling is reported as an outcome, not an error.

use std::io;

/// Maximum number of denied resources named in a `NotAuthorized` error
pub const MAX_NAMED_DENIALS: usize = 5;

/// Crate-wide error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed request shape, unparseable parameters, or schema mismatch
    #[error("validation failed: {0}")]
    Validation(String),

    /// Caller lacks "use" permission on one or more resolved resources
    #[error("not authorized to use: {}{}", denied.join(", "),
        if *remainder > 0 { format!(" (and {remainder} more)") } else { String::new() })]
    NotAuthorized {
        /// Denied resource names, capped at `MAX_NAMED_DENIALS`
        denied: Vec<String>,
        /// How many further denials were not named
        remainder: usize,
    },

    /// Unknown job or request id
    #[error("not found: {0}")]
    NotFound(String),

    /// Infrastructure failure that survived the automatic retry
    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    /// A required service is not configured at all
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The request or job reached FAILED; the payload is the stored result
    #[error("job failed: {0}")]
    JobFailed(String),

    /// Ledger storage fault
    #[error("ledger error: {0}")]
    Ledger(String),

    /// I/O error reading or writing job artifacts
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a `NotAuthorized` error from the full denial list, naming at
    /// most `MAX_NAMED_DENIALS` resources and counting the rest.
    pub fn not_authorized(mut denied: Vec<String>) -> Self {
        let remainder = denied.len().saturating_sub(MAX_NAMED_DENIALS);
        denied.truncate(MAX_NAMED_DENIALS);
        Error::NotAuthorized { denied, remainder }
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;
