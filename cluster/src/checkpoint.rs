//! Checkpoints decide whether an observed resource is ready.
//!
//! A checkpoint returns `Ok(true)` to accept the resource, `Ok(false)` to
//! keep polling, and an error to stop polling.

use std::fmt;

use k8s_openapi::Metadata;
use k8s_openapi::Resource;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::time::Instant;

use crate::ClusterResult;
use crate::Error;
use crate::WithEvents;
use crate::events::is_warning;
use crate::handle::PodExt;

/// The function type wrapped by a checkpoint.
type CheckFn<T> = dyn FnMut(&WithEvents<T>) -> ClusterResult<bool> + Send;

/// A predicate deciding whether an observed resource is ready.
pub struct Checkpoint<T>(Box<CheckFn<T>>);

impl<T: 'static> Checkpoint<T> {
    /// Constructs a checkpoint from a function.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(&WithEvents<T>) -> ClusterResult<bool> + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// Constructs a checkpoint that accepts anything.
    pub fn accept() -> Self {
        Self::new(|_| Ok(true))
    }

    /// Evaluates the checkpoint.
    pub fn check(&mut self, observed: &WithEvents<T>) -> ClusterResult<bool> {
        (self.0)(observed)
    }
}

impl<T> Checkpoint<T>
where
    T: Resource + Metadata<Ty = ObjectMeta> + 'static,
{
    /// Limits the time the checkpoint may take to accept.
    ///
    /// Once accepted, the checkpoint keeps accepting without being evaluated
    /// again. Past the deadline, an unaccepted checkpoint stops polling with
    /// [`Error::DeadlineExceeded`] without evaluating the inner checkpoint.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        let mut satisfied = false;
        Self::new(move |observed| {
            if satisfied {
                return Ok(true);
            }

            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded {
                    kind: T::KIND,
                    name: observed.value.metadata().name.clone().unwrap_or_default(),
                });
            }

            satisfied = self.check(observed)?;
            Ok(satisfied)
        })
    }
}

impl<T> fmt::Debug for Checkpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint").finish_non_exhaustive()
    }
}

/// Evaluates checkpoints in order, stopping at the first that does not
/// accept.
pub(crate) fn check_all<T>(
    checkpoints: &mut [Checkpoint<T>],
    observed: &WithEvents<T>,
) -> ClusterResult<bool> {
    for checkpoint in checkpoints {
        if !(checkpoint.0)(observed)? {
            return Ok(false);
        }
    }

    Ok(true)
}

impl Checkpoint<PersistentVolumeClaim> {
    /// Accepts a claim that has been bound to a volume.
    pub fn pvc_is_bound() -> Self {
        Self::new(|observed| {
            Ok(observed
                .value
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                == Some("Bound"))
        })
    }
}

impl Checkpoint<Pod> {
    /// Accepts a pod that has been accepted by the cluster.
    pub fn pod_has_been_pending() -> Self {
        Self::new(|observed| {
            Ok(matches!(
                observed.value.phase(),
                Some("Pending" | "Running" | "Succeeded" | "Failed")
            ))
        })
    }

    /// Accepts a pod that has started running (or already finished).
    pub fn pod_has_been_running() -> Self {
        Self::new(|observed| {
            Ok(matches!(
                observed.value.phase(),
                Some("Running" | "Succeeded" | "Failed")
            ))
        })
    }

    /// Accepts a pod that has been scheduled to a node.
    ///
    /// An unscheduled pod whose most significant event is a warning fails
    /// with [`Error::Unstartable`].
    pub fn pod_is_scheduled() -> Self {
        Self::new(|observed| {
            if observed.value.is_scheduled() {
                return Ok(true);
            }

            unstartable(observed)
        })
    }

    /// Fails a pending pod whose most significant event is a warning.
    ///
    /// Pods that are not pending are accepted.
    pub fn no_warning_while_pending() -> Self {
        Self::new(|observed| {
            if observed.value.phase() != Some("Pending") {
                return Ok(true);
            }

            unstartable(observed).map(|_| true)
        })
    }
}

/// Fails with the pod's most significant event if it is a warning.
///
/// Returns `Ok(false)` otherwise.
fn unstartable(observed: &WithEvents<Pod>) -> ClusterResult<bool> {
    match observed.significant_event() {
        Some(event) if is_warning(event) => Err(Error::Unstartable {
            name: observed.value.metadata.name.clone().unwrap_or_default(),
            reason: event.reason.clone().unwrap_or_default(),
            note: event.message.clone().unwrap_or_default(),
        }),
        _ => Ok(false),
    }
}

impl Checkpoint<Service> {
    /// Accepts a service that has been assigned a cluster IP.
    pub fn service_is_ready() -> Self {
        Self::new(|observed| {
            Ok(observed
                .value
                .spec
                .as_ref()
                .and_then(|s| s.cluster_ip.as_deref())
                .is_some_and(|ip| !ip.is_empty()))
        })
    }
}

impl Checkpoint<Deployment> {
    /// Accepts a deployment with as many available replicas as desired.
    ///
    /// The desired replica count defaults to one.
    pub fn enough_replicas() -> Self {
        Self::new(|observed| {
            let desired = observed
                .value
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1);
            let available = observed
                .value
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0);

            Ok(desired <= available)
        })
    }
}

impl Checkpoint<Job> {
    /// Accepts any job that exists.
    pub fn job_has_been_created() -> Self {
        Self::accept()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::api::core::v1::PodCondition;
    use k8s_openapi::api::core::v1::PodStatus;

    use super::*;
    use crate::events::tests::event;

    /// Creates a pod with the given phase and scheduled condition.
    fn pod(phase: &str, scheduled: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("agent".into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.into()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".into(),
                    status: if scheduled { "True" } else { "False" }.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn scheduled_pods_are_accepted() {
        let mut checkpoint = Checkpoint::pod_is_scheduled();
        assert!(!checkpoint.check(&WithEvents::new(pod("Pending", false))).unwrap());
        assert!(checkpoint.check(&WithEvents::new(pod("Pending", true))).unwrap());
    }

    #[test]
    fn unscheduled_pods_with_warnings_are_unstartable() {
        let mut checkpoint = Checkpoint::pod_is_scheduled();
        let observed = WithEvents::with_events(
            pod("Pending", false),
            vec![event("default-scheduler", "Warning", "FailedScheduling", 1)],
        );

        match checkpoint.check(&observed) {
            Err(Error::Unstartable { name, reason, .. }) => {
                assert_eq!(name, "agent");
                assert_eq!(reason, "FailedScheduling");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn pending_pods_with_warnings_fail() {
        let mut checkpoint = Checkpoint::no_warning_while_pending();
        let warning = vec![event("kubelet", "Warning", "FailedMount", 1)];

        assert!(
            checkpoint
                .check(&WithEvents::with_events(pod("Pending", true), warning.clone()))
                .is_err()
        );
        assert!(
            checkpoint
                .check(&WithEvents::with_events(pod("Running", true), warning))
                .unwrap()
        );
    }

    #[test]
    fn phases() {
        let mut pending = Checkpoint::pod_has_been_pending();
        let mut running = Checkpoint::pod_has_been_running();

        assert!(pending.check(&WithEvents::new(pod("Pending", false))).unwrap());
        assert!(!running.check(&WithEvents::new(pod("Pending", true))).unwrap());
        assert!(running.check(&WithEvents::new(pod("Failed", true))).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_latch_once_satisfied() {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut checkpoint = Checkpoint::pod_is_scheduled().with_deadline(deadline);

        assert!(!checkpoint.check(&WithEvents::new(pod("Pending", false))).unwrap());
        assert!(checkpoint.check(&WithEvents::new(pod("Pending", true))).unwrap());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(checkpoint.check(&WithEvents::new(pod("Pending", false))).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_expire() {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut checkpoint = Checkpoint::pod_is_scheduled().with_deadline(deadline);

        assert!(!checkpoint.check(&WithEvents::new(pod("Pending", false))).unwrap());

        tokio::time::advance(Duration::from_secs(20)).await;
        let err = checkpoint
            .check(&WithEvents::new(pod("Pending", false)))
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadlines_take_precedence_over_errors() {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut checkpoint = Checkpoint::<Pod>::new(|observed| {
            if observed.value.is_scheduled() {
                Ok(true)
            } else {
                Err(Error::Canceled)
            }
        })
        .with_deadline(deadline);

        tokio::time::advance(Duration::from_secs(20)).await;
        let err = checkpoint
            .check(&WithEvents::new(pod("Pending", false)))
            .unwrap_err();
        assert!(err.is_deadline_exceeded());

        let err = checkpoint
            .check(&WithEvents::new(pod("Pending", true)))
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
    }

    #[test]
    fn check_all_stops_at_the_first_rejection() {
        let mut checkpoints = vec![
            Checkpoint::<Pod>::new(|_| Ok(false)),
            Checkpoint::<Pod>::new(|_| Err(Error::Canceled)),
        ];

        assert!(!check_all(&mut checkpoints, &WithEvents::new(pod("Pending", true))).unwrap());
    }

    #[test]
    fn deployments_need_enough_replicas() {
        let mut checkpoint = Checkpoint::enough_replicas();
        assert!(!checkpoint.check(&WithEvents::new(Deployment::default())).unwrap());
    }
}
