//! The persistence boundary consumed by the bootstrap sequence.

use std::future::Future;

use crate::error::DbError;

/// A collaborator that establishes a connection to a durable store.
///
/// The bootstrap sequence awaits [`connect`] exactly once (through
/// [`connect_with_policy`]) before it mounts routes or activates the
/// real-time channel. Handlers registered afterwards may therefore assume
/// the connection is live.
///
/// Implementations own whatever handle they create (a pool, a client) and
/// expose it to route tables through their own API. The bootstrap keeps
/// the connector alive for as long as the server runs and calls
/// [`close`] once serving has stopped.
///
/// [`connect`]: PersistenceConnector::connect
/// [`close`]: PersistenceConnector::close
/// [`connect_with_policy`]: crate::policy::connect_with_policy
pub trait PersistenceConnector: Send + Sync {
    /// Short name of the backing store, used in logs and health output.
    fn name(&self) -> &'static str;

    /// Establish the connection.
    ///
    /// A returned error is treated as a failed attempt; the caller decides
    /// whether to retry.
    fn connect(&self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Check that an established connection is still usable.
    ///
    /// Stores without a cheap liveness check report healthy.
    fn ping(&self) -> impl Future<Output = Result<(), DbError>> + Send {
        async { Ok(()) }
    }

    /// Release the connection. Called after the server stops serving.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
