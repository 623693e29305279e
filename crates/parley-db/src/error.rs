//! Error types for the persistence layer.
//!
//! All errors are propagated via [`DbError`], which wraps the underlying
//! [`sqlx`] error or describes which part of the connect sequence failed.

use std::time::Duration;

/// Errors that can occur while establishing or using persistence.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A configuration error (for example an unparseable URL).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store refused or dropped the connection.
    #[error("Persistence unavailable: {0}")]
    Unavailable(String),

    /// A single connect attempt did not settle within its deadline.
    #[error("connect attempt {attempt} timed out after {timeout:?}")]
    Timeout {
        /// One-based attempt number.
        attempt: u32,
        /// The per-attempt deadline that elapsed.
        timeout: Duration,
    },

    /// Every attempt allowed by the connect policy failed.
    #[error("gave up connecting after {attempts} attempt(s): {last}")]
    Exhausted {
        /// Total attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last: Box<DbError>,
    },
}
