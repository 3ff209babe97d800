//! Errors of cluster operations.

use kube::core::ErrorResponse;

/// Represents an error from a cluster operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A resource could not be created because it already exists.
    ///
    /// The existing resource is left untouched.
    #[error("{kind} `{name}` already exists")]
    Conflict {
        /// The kind of the resource.
        kind: &'static str,
        /// The name of the resource.
        name: String,
        /// The error returned by the cluster.
        #[source]
        source: kube::Error,
    },
    /// A resource does not exist.
    #[error("{kind} `{name}` was not found")]
    Missing {
        /// The kind of the resource.
        kind: &'static str,
        /// The name of the resource.
        name: String,
    },
    /// A checkpoint was not satisfied before its deadline.
    #[error("{kind} `{name}` did not become ready before the deadline")]
    DeadlineExceeded {
        /// The kind of the resource.
        kind: &'static str,
        /// The name of the resource.
        name: String,
    },
    /// The backoff schedule was exhausted before the resource became ready.
    #[error("{kind} `{name}` is not ready")]
    NotReady {
        /// The kind of the resource.
        kind: &'static str,
        /// The name of the resource.
        name: String,
    },
    /// A pod reported a warning while starting.
    #[error("pod `{name}` cannot start: [{reason}] {note}")]
    Unstartable {
        /// The name of the pod.
        name: String,
        /// The reason of the warning event.
        reason: String,
        /// The note of the warning event.
        note: String,
    },
    /// A job has no pods yet.
    #[error("job `{0}` has no pods")]
    JobHasNoPods(String),
    /// The operation was canceled.
    #[error("the operation was canceled")]
    Canceled,
    /// The task producing a result ended without one.
    #[error("the operation ended without producing a result")]
    Abandoned,
    /// A Kubernetes error occurred.
    #[error(transparent)]
    Kubernetes(#[from] kube::Error),
    /// A checkpoint rejected a resource.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Determines if the error is a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Determines if the error is a missing resource.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }

    /// Determines if the error is an exceeded deadline.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// Determines if the error is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// The result type of cluster operations.
pub type ClusterResult<T> = Result<T, Error>;

/// Determines if a Kubernetes error is a "not found" response.
pub(crate) fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ErrorResponse { code: 404, .. }))
}

/// Determines if a Kubernetes error is an "already exists" response.
pub(crate) fn is_already_exists(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ErrorResponse { code: 409, .. }))
}
