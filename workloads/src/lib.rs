//! The Kubernetes workloads of Knitfab.
//!
//! Domain values are turned into resource specifications by
//! [`ResourceBuilder`]s and run on a [`Cluster`]:
//!
//! * [`dataagt`] serves a piece of data over HTTP from a short-lived pod.
//! * [`run`] provisions the claims a run writes to.
//! * [`worker`] executes a run as a job.
//!
//! Every resource is named and labeled through [`MetaSource`], so it can be
//! found again from the same domain value.

use std::sync::Arc;

use knitfab_cluster::Cluster;
use knitfab_domain::ClusterConfig;
use knitfab_domain::DataAgent;
use knitfab_domain::KnitDataBody;
use knitfab_domain::Run;
use knitfab_domain::RunBody;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub mod data;
pub mod dataagt;
mod error;
pub mod metasource;
pub mod run;
pub mod worker;

pub use data::DataBuilder;
pub use dataagt::DataAgentBuilder;
pub use dataagt::DataAgentHandle;
pub use error::*;
pub use metasource::MetaSource;
pub use metasource::ResourceBuilder;
pub use worker::Executable;
pub use worker::RunIdentifier;
pub use worker::Worker;

/// Runs Knitfab workloads on a cluster.
#[derive(Clone)]
pub struct Workloads {
    /// The cluster the workloads run on.
    cluster: Cluster,
    /// The configuration of the workloads.
    config: Arc<ClusterConfig>,
}

impl Workloads {
    /// Constructs a new workloads runner.
    pub fn new(cluster: Cluster, config: Arc<ClusterConfig>) -> Self {
        Self { cluster, config }
    }

    /// Gets the cluster the workloads run on.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Gets the configuration of the workloads.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Spawns a data agent.
    ///
    /// See [`dataagt::spawn`].
    pub async fn spawn_data_agent(
        &self,
        token: &CancellationToken,
        agent: &DataAgent,
        pending_deadline: Instant,
    ) -> WorkloadResult<DataAgentHandle> {
        dataagt::spawn(&self.cluster, &self.config, token, agent, pending_deadline).await
    }

    /// Finds a running data agent.
    pub async fn find_data_agent(
        &self,
        token: &CancellationToken,
        agent: &DataAgent,
    ) -> WorkloadResult<DataAgentHandle> {
        dataagt::find(&self.cluster, token, agent).await
    }

    /// Determines if the claim of a piece of data is bound.
    pub async fn check_data_is_bound(
        &self,
        token: &CancellationToken,
        body: &KnitDataBody,
    ) -> WorkloadResult<bool> {
        data::check_data_is_bound(&self.cluster, token, body).await
    }

    /// Provisions the claims a run writes to.
    pub async fn initialize_run(&self, token: &CancellationToken, run: &Run) -> WorkloadResult<()> {
        run::initialize(&self.cluster, &self.config, token, run).await
    }

    /// Spawns the worker of a run.
    pub async fn spawn_worker(
        &self,
        token: &CancellationToken,
        executable: &Executable,
    ) -> WorkloadResult<Worker> {
        worker::spawn(&self.cluster, &self.config, token, executable).await
    }

    /// Finds the worker of a run.
    pub async fn find_worker(
        &self,
        token: &CancellationToken,
        run: &RunBody,
    ) -> WorkloadResult<Worker> {
        worker::find(&self.cluster, token, run).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use knitfab_cluster::testing::FakeKubeClient;
    use knitfab_domain::DataAgentConfig;
    use knitfab_domain::DataAgentMode;
    use knitfab_domain::InitConfig;
    use knitfab_domain::NurseConfig;
    use knitfab_domain::VolumeConfig;
    use knitfab_domain::WorkerConfig;

    use super::*;

    /// The configuration used throughout the tests.
    pub(crate) fn config() -> ClusterConfig {
        ClusterConfig::builder()
            .namespace("knitfab")
            .data_agent(
                DataAgentConfig::builder()
                    .image("knitfab/dataagt:v1")
                    .port(8080)
                    .volume(
                        VolumeConfig::builder()
                            .storage_class_name("knitfab-data")
                            .initial_capacity("1Gi")
                            .build(),
                    )
                    .build(),
            )
            .worker(
                WorkerConfig::builder()
                    .priority("knitfab-worker")
                    .init(
                        InitConfig::builder()
                            .image("knitfab/empty:v1")
                            .build(),
                    )
                    .nurse(
                        NurseConfig::builder()
                            .image("knitfab/nurse:v1")
                            .service_account_secret("nurse-token")
                            .build(),
                    )
                    .build(),
            )
            .build()
    }

    #[tokio::test]
    async fn workloads_share_the_cluster() {
        let client = Arc::new(FakeKubeClient::new());
        let workloads = Workloads::new(
            Cluster::new(client.clone(), "knitfab", "cluster.local"),
            Arc::new(config()),
        );
        assert_eq!(workloads.cluster().namespace(), "knitfab");
        assert_eq!(workloads.config().data_agent.port, 8080);

        let agent = DataAgent {
            name: "agent-1".into(),
            mode: DataAgentMode::Read,
            data: KnitDataBody::new("d1", "pvc-d1"),
        };
        let err = workloads
            .find_data_agent(&CancellationToken::new(), &agent)
            .await
            .err()
            .unwrap();
        assert!(err.is_missing());

        let run = Run {
            body: RunBody {
                id: "run-1".into(),
                worker_name: "worker-run-1".into(),
                plan: Default::default(),
            },
            inputs: vec![],
            outputs: vec![],
            log: None,
        };
        workloads
            .initialize_run(&CancellationToken::new(), &run)
            .await
            .unwrap();
        assert!(client.deleted().is_empty());

        let err = Executable::new(&run, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::MalformedRun { .. }));
    }
}
