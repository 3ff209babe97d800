//! Derivation of job health.
//!
//! The status of a job is a function of the job's conditions, the pods it
//! selects, and the events reported for those pods.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ContainerStateTerminated;
use k8s_openapi::api::core::v1::ContainerStatus;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::events::is_warning;
use crate::events::significant_event;
use crate::handle::PodExt;

/// The exit code reported for jobs that cannot progress.
const STUCK_EXIT_CODE: u8 = 255;

/// The reason reported for a terminated container without one.
const DEFAULT_TERMINATION_REASON: &str = "Error";

/// The state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// The job has not started running.
    Pending,
    /// The job is running.
    Running,
    /// The job completed successfully.
    Succeeded,
    /// The job failed.
    Failed,
    /// The job has not failed, but a warning suggests it may never progress.
    Stucking,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Stucking => write!(f, "stucking"),
        }
    }
}

/// The health of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobStatus {
    /// The state of the job.
    pub state: JobState,
    /// The exit code of the job.
    ///
    /// This is only meaningful for failed and stuck jobs.
    pub code: u8,
    /// A message explaining the state.
    pub message: String,
}

impl JobStatus {
    /// Constructs a status with no code or message.
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            code: 0,
            message: String::new(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            JobState::Failed | JobState::Stucking => write!(
                f,
                "{state} (code {code}): {message}",
                state = self.state,
                code = self.code,
                message = self.message
            ),
            state => write!(f, "{state}"),
        }
    }
}

/// Derives the status of a job.
///
/// `events` maps pod names to the events reported for the pod.
pub fn job_status(job: &Job, pods: &[Pod], events: &BTreeMap<String, Vec<Event>>) -> JobStatus {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    let holds = |ty: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == ty && c.status == "True")
    };

    if holds("Complete") {
        return JobStatus::new(JobState::Succeeded);
    }

    if holds("Failed") {
        return failure(job, pods);
    }

    let mut progressing = false;
    for pod in pods {
        match pod.phase() {
            Some("Running" | "Succeeded" | "Failed") => progressing = true,
            Some("Pending") => {
                let name = pod.metadata.name.as_deref().unwrap_or_default();
                let warning = events
                    .get(name)
                    .and_then(|e| significant_event(e))
                    .filter(|e| is_warning(e));

                let Some(warning) = warning else {
                    continue;
                };

                let reason = warning.reason.as_deref().unwrap_or_default();
                let note = warning.message.as_deref().unwrap_or_default();

                if !pod.is_scheduled() {
                    debug!("pod `{name}` has not been scheduled: [{reason}] {note}");
                    continue;
                }

                return JobStatus {
                    state: JobState::Stucking,
                    code: STUCK_EXIT_CODE,
                    message: format!("(pod {name}) [{reason}] {note}"),
                };
            }
            _ => {}
        }
    }

    if progressing {
        JobStatus::new(JobState::Running)
    } else {
        JobStatus::new(JobState::Pending)
    }
}

/// Builds the status of a failed job.
///
/// The code and message come from the terminated container with the highest
/// non-zero exit code; if there is none, the job's failure condition is
/// reported instead.
fn failure(job: &Job, pods: &[Pod]) -> JobStatus {
    let terminated = pods
        .iter()
        .filter_map(|p| p.status.as_ref())
        .flat_map(|s| {
            s.init_container_statuses
                .iter()
                .flatten()
                .chain(s.container_statuses.iter().flatten())
        })
        .filter_map(|c: &ContainerStatus| {
            let terminated = c.state.as_ref()?.terminated.as_ref()?;
            (terminated.exit_code != 0).then_some((c, terminated))
        })
        .fold(None, |max: Option<(&ContainerStatus, &ContainerStateTerminated)>, (c, t)| match max {
            Some((_, m)) if m.exit_code >= t.exit_code => max,
            _ => Some((c, t)),
        });

    if let Some((container, terminated)) = terminated {
        return JobStatus {
            state: JobState::Failed,
            code: u8::try_from(terminated.exit_code).unwrap_or(u8::MAX),
            message: format!(
                "(container {name}) {reason}",
                name = container.name,
                reason = terminated
                    .reason
                    .as_deref()
                    .filter(|r| !r.is_empty())
                    .unwrap_or(DEFAULT_TERMINATION_REASON)
            ),
        };
    }

    let condition = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
        .iter()
        .find(|c| c.type_ == "Failed");

    JobStatus {
        state: JobState::Failed,
        code: STUCK_EXIT_CODE,
        message: condition
            .and_then(|c| c.message.clone().or_else(|| c.reason.clone()))
            .unwrap_or_else(|| DEFAULT_TERMINATION_REASON.to_string()),
    }
}
