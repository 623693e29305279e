//! Error types for the Parley server binary.
//!
//! [`StartupError`] wraps every failure mode between process start and
//! clean shutdown so `main` can propagate with `?`.

/// Top-level error for the server binary.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// Configuration could not be resolved from the environment.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: parley_gateway::ConfigError,
    },

    /// Bootstrap or serving failed.
    #[error("bootstrap error: {source}")]
    Bootstrap {
        /// The underlying bootstrap error.
        #[from]
        source: parley_gateway::BootstrapError,
    },
}
