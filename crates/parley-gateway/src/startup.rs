//! The startup sequence as data.
//!
//! Each step of the bootstrap is a named [`Stage`] that declares the
//! stages it depends on. [`STARTUP_SEQUENCE`] is the canonical order and
//! [`validate_sequence`] proves it respects every declared dependency.
//! At runtime the bootstrap enters each stage through a [`StageLog`],
//! which refuses to enter a stage whose dependencies have not completed,
//! so the ordering guarantees hold by construction rather than by
//! statement order.

use std::fmt;

/// A named step of the bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Resolve the configuration snapshot.
    ResolveConfig,
    /// Create the HTTP server and the real-time server on the same transport.
    CreateServers,
    /// Apply the shared cross-origin policy to both servers.
    ApplyCors,
    /// Register body decoding and static assets.
    GenericStages,
    /// Wait for persistence `connect` to settle.
    AwaitPersistence,
    /// Mount the route table.
    MountRoutes,
    /// Run the real-time initializer and attach the upgrade endpoint.
    ActivateRealtime,
    /// Append the error boundary.
    ErrorBoundary,
    /// Bind the listener and announce readiness.
    Listen,
}

/// The canonical bootstrap order.
pub const STARTUP_SEQUENCE: [Stage; 9] = [
    Stage::ResolveConfig,
    Stage::CreateServers,
    Stage::ApplyCors,
    Stage::GenericStages,
    Stage::AwaitPersistence,
    Stage::MountRoutes,
    Stage::ActivateRealtime,
    Stage::ErrorBoundary,
    Stage::Listen,
];

impl Stage {
    /// Stages that must complete before this one may start.
    pub const fn depends_on(self) -> &'static [Self] {
        match self {
            Self::ResolveConfig => &[],
            Self::CreateServers => &[Self::ResolveConfig],
            Self::ApplyCors => &[Self::CreateServers],
            Self::GenericStages => &[Self::ApplyCors],
            Self::AwaitPersistence => &[Self::ResolveConfig],
            Self::MountRoutes => &[Self::GenericStages, Self::AwaitPersistence],
            Self::ActivateRealtime => &[Self::ApplyCors, Self::AwaitPersistence],
            Self::ErrorBoundary => &[Self::MountRoutes, Self::ActivateRealtime],
            Self::Listen => &[Self::ErrorBoundary],
        }
    }

    /// Short stage name for logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ResolveConfig => "resolve-config",
            Self::CreateServers => "create-servers",
            Self::ApplyCors => "apply-cors",
            Self::GenericStages => "generic-stages",
            Self::AwaitPersistence => "await-persistence",
            Self::MountRoutes => "mount-routes",
            Self::ActivateRealtime => "activate-realtime",
            Self::ErrorBoundary => "error-boundary",
            Self::Listen => "listen",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordering violations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SequenceError {
    /// A stage was entered before one of its dependencies completed.
    #[error("stage {stage} entered before its dependency {missing}")]
    MissingDependency {
        /// The stage being entered.
        stage: Stage,
        /// The dependency that has not completed.
        missing: Stage,
    },

    /// A stage was entered twice.
    #[error("stage {0} entered twice")]
    Repeated(Stage),
}

/// Check that `sequence` enters every stage at most once and only after
/// its dependencies.
pub fn validate_sequence(sequence: &[Stage]) -> Result<(), SequenceError> {
    let mut log = StageLog::new();
    for &stage in sequence {
        log.enter(stage)?;
    }
    Ok(())
}

/// Runtime record of completed stages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageLog {
    completed: Vec<Stage>,
}

impl StageLog {
    /// An empty log.
    pub const fn new() -> Self {
        Self {
            completed: Vec::new(),
        }
    }

    /// Record `stage` as completed if its dependencies are.
    pub fn enter(&mut self, stage: Stage) -> Result<(), SequenceError> {
        if self.completed.contains(&stage) {
            return Err(SequenceError::Repeated(stage));
        }
        if let Some(&missing) = stage
            .depends_on()
            .iter()
            .find(|dep| !self.completed.contains(dep))
        {
            return Err(SequenceError::MissingDependency { stage, missing });
        }

        tracing::debug!(stage = stage.name(), "Startup stage");
        self.completed.push(stage);
        Ok(())
    }

    /// Completed stages in order.
    pub fn completed(&self) -> &[Stage] {
        &self.completed
    }

    /// Whether `stage` has completed.
    pub fn has_completed(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }
}
