//! Persistence layer for the Parley service.
//!
//! The gateway never talks to a database driver directly. It depends on
//! the [`PersistenceConnector`] boundary, which exposes a single
//! asynchronous `connect` operation that must settle before routes and the
//! real-time channel are activated.
//!
//! # Modules
//!
//! - [`connector`] -- the [`PersistenceConnector`] trait
//! - [`postgres`] -- `PostgreSQL` implementation backed by an [`sqlx`] pool
//! - [`policy`] -- per-attempt timeout and bounded exponential backoff
//!   around `connect`
//! - [`error`] -- shared error types

pub mod connector;
pub mod error;
pub mod policy;
pub mod postgres;

// Re-export primary types for convenience.
pub use connector::PersistenceConnector;
pub use error::DbError;
pub use policy::{ConnectPolicy, backoff_delay, connect_with_policy};
pub use postgres::{PostgresConfig, PostgresConnector};
