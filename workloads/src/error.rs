//! Errors of workload operations.

/// Represents an error from a workload operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A knit id is not lowercase.
    ///
    /// Knit ids name cluster resources, which only admit lowercase names.
    #[error("knit id `{0}` should consist of lowercase alphanumeric characters, `-`, `_` and `.`")]
    InvalidKnitId(String),
    /// A run cannot be executed as given.
    #[error("malformed run [planId:{plan_id} runId:{run_id}]: {reason}")]
    MalformedRun {
        /// The id of the run's plan.
        plan_id: String,
        /// The id of the run.
        run_id: String,
        /// The reason the run is malformed.
        reason: String,
    },
    /// A cluster operation failed.
    #[error(transparent)]
    Cluster(#[from] knitfab_cluster::Error),
}

impl Error {
    /// Determines if the error is a conflict with an existing resource.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Cluster(e) if e.is_conflict())
    }

    /// Determines if the error is a missing resource.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Cluster(e) if e.is_missing())
    }

    /// Determines if the error is an exceeded deadline.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::Cluster(e) if e.is_deadline_exceeded())
    }

    /// Determines if the error is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Cluster(e) if e.is_canceled())
    }
}

/// The result type of workload operations.
pub type WorkloadResult<T> = Result<T, Error>;
