//! The handle to a job.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::Pod as KubePod;
use tracing::debug;

use crate::ClusterResult;
use crate::Error;
use crate::Handle;
use crate::KubeClient;
use crate::LabelSelector;
use crate::LogStream;
use crate::WithEvents;
use crate::handle::Closer;
use crate::handle::PodExt;
use crate::status::JobStatus;
use crate::status::job_status;

/// The label set by Kubernetes on the pods of a job.
const K8S_LABEL_JOB_NAME: &str = "job-name";

/// A handle to a job.
pub struct Job {
    /// The last observed job.
    job: KubeJob,
    /// Deletes the job and its pods.
    closer: Closer<KubeJob>,
}

impl Job {
    /// Constructs a handle from an observed job.
    pub(crate) fn new(
        observed: WithEvents<KubeJob>,
        client: Arc<dyn KubeClient>,
        namespace: &str,
    ) -> Self {
        let job = observed.value;
        let closer = Closer::new(client, namespace, job.metadata.name.clone().unwrap_or_default());
        Self { job, closer }
    }

    /// Gets the selector of the job's pods.
    ///
    /// Falls back to the `job-name` label when the job has no selector.
    pub fn selector(&self) -> LabelSelector {
        let selector = self
            .job
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .and_then(|s| s.match_labels.as_ref())
            .map(LabelSelector::from)
            .unwrap_or_default();

        if selector.is_empty() {
            return LabelSelector::new().eq(K8S_LABEL_JOB_NAME, self.closer.name());
        }

        selector
    }

    /// Lists the pods of the job.
    pub async fn pods(&self) -> ClusterResult<Vec<KubePod>> {
        Ok(self
            .closer
            .client()
            .find_pods(self.closer.namespace(), &self.selector())
            .await?)
    }

    /// Derives the current status of the job.
    ///
    /// The pods of the job are listed again; events are fetched only for
    /// pods that are still pending. Failing to list either is treated as
    /// having none.
    pub async fn status(&self) -> JobStatus {
        let pods = match self.pods().await {
            Ok(pods) => pods,
            Err(e) => {
                debug!("failed to list pods of job `{name}`: {e}", name = self.closer.name());
                Vec::new()
            }
        };

        let client = self.closer.client();
        let mut events = BTreeMap::new();
        for pod in pods.iter().filter(|p| p.phase() == Some("Pending")) {
            let name = pod.metadata.name.clone().unwrap_or_default();
            match client
                .get_events(self.closer.namespace(), "Pod", &pod.metadata)
                .await
            {
                Ok(e) => {
                    events.insert(name, e);
                }
                Err(e) => debug!("failed to list events of pod `{name}`: {e}"),
            }
        }

        job_status(&self.job, &pods, &events)
    }

    /// Follows the log of a container of the job's first pod.
    pub async fn log(&self, container: &str) -> ClusterResult<LogStream> {
        let pods = self.pods().await?;
        let Some(pod) = pods.first() else {
            return Err(Error::JobHasNoPods(self.closer.name().to_string()));
        };

        let name = pod.metadata.name.as_deref().unwrap_or_default();
        self.closer
            .client()
            .log(self.closer.namespace(), name, container)
            .await
    }

    /// Gets the last observed job.
    pub fn resource(&self) -> &KubeJob {
        &self.job
    }
}

#[async_trait]
impl Handle for Job {
    fn name(&self) -> &str {
        self.closer.name()
    }

    fn namespace(&self) -> &str {
        self.closer.namespace()
    }

    async fn close(&self) -> ClusterResult<()> {
        self.closer.close().await
    }
}
