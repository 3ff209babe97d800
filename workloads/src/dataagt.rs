//! Data agents: short-lived pods serving one piece of data over HTTP.
//!
//! A data agent is a pod mounting the claim of a piece of data. In write mode
//! the claim is created along with the agent; in read mode it must already
//! exist. Closing an agent deletes its pod only, as the claim belongs to the
//! data.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::ContainerPort;
use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;
use k8s_openapi::api::core::v1::Pod as KubePod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use knitfab_cluster::Backoff;
use knitfab_cluster::Checkpoint;
use knitfab_cluster::Cluster;
use knitfab_cluster::ClusterResult;
use knitfab_cluster::Handle;
use knitfab_cluster::Pod;
use knitfab_cluster::PodPhase;
use knitfab_cluster::Pvc;
use knitfab_domain::ClusterConfig;
use knitfab_domain::DataAgent;
use knitfab_domain::DataAgentMode;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::DataBuilder;
use crate::MetaSource;
use crate::ResourceBuilder;
use crate::WorkloadResult;

/// The name of the data agent's API port.
pub const DATA_AGENT_PORT_NAME: &str = "dataagt-port";

/// The name of the data agent's container.
const CONTAINER_NAME: &str = "dataagt";

/// The name of the volume holding the data.
const VOLUME_NAME: &str = "the-volume";

/// The path the data is mounted at.
const DATA_PATH: &str = "/data";

/// The lifetime the data agent enforces on itself, in seconds.
///
/// This applies regardless of what the caller waits for.
const SELF_DEADLINE_SECS: &str = "180";

/// The polling interval while spawning a data agent.
const SPAWN_INTERVAL: Duration = Duration::from_millis(200);

/// The polling interval while finding a data agent.
const FIND_INTERVAL: Duration = Duration::from_millis(50);

/// Builds the pod of a data agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAgentBuilder {
    /// The builder of the claim served by the agent.
    data: DataBuilder,
    /// The name of the agent.
    name: String,
    /// The mode of the agent.
    mode: DataAgentMode,
}

impl DataAgentBuilder {
    /// Constructs a builder for a data agent.
    ///
    /// Fails if the knit id of the agent's data is not lowercase.
    pub fn new(agent: &DataAgent) -> WorkloadResult<Self> {
        Ok(Self {
            data: DataBuilder::new(agent.data.clone())?,
            name: agent.name.clone(),
            mode: agent.mode,
        })
    }

    /// Gets the builder of the claim served by the agent.
    pub fn data(&self) -> &DataBuilder {
        &self.data
    }

    /// Gets the mode of the agent.
    pub fn mode(&self) -> DataAgentMode {
        self.mode
    }
}

impl MetaSource for DataAgentBuilder {
    fn component(&self) -> &str {
        "dataagt"
    }

    fn instance(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        self.data.id()
    }

    fn id_type(&self) -> &str {
        self.data.id_type()
    }

    fn extras(&self) -> BTreeMap<String, String> {
        BTreeMap::from_iter([("mode".to_string(), self.mode.to_string())])
    }
}

impl ResourceBuilder<ClusterConfig, KubePod> for DataAgentBuilder {
    fn build(&self, config: &ClusterConfig) -> KubePod {
        let port = config.data_agent.port;

        KubePod {
            metadata: self.object_meta(&config.namespace),
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                automount_service_account_token: Some(false),
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image: Some(config.data_agent.image.clone()),
                    args: Some(
                        [
                            "--mode",
                            &self.mode.to_string(),
                            "--path",
                            DATA_PATH,
                            "--port",
                            &port.to_string(),
                            "--deadline",
                            SELF_DEADLINE_SECS,
                        ]
                        .map(str::to_string)
                        .to_vec(),
                    ),
                    volume_mounts: Some(vec![VolumeMount {
                        name: VOLUME_NAME.to_string(),
                        mount_path: DATA_PATH.to_string(),
                        read_only: Some(self.mode.is_read_only()),
                        ..Default::default()
                    }]),
                    ports: Some(vec![ContainerPort {
                        name: Some(DATA_AGENT_PORT_NAME.to_string()),
                        container_port: port,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: VOLUME_NAME.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: self.data.instance().to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// A running data agent.
pub struct DataAgentHandle {
    /// The knit id of the served data.
    knit_id: String,
    /// The mode of the agent.
    mode: DataAgentMode,
    /// The name of the claim mounted by the agent.
    volume_ref: String,
    /// The pod of the agent.
    pod: Pod,
}

impl DataAgentHandle {
    /// Gets the port the agent's API listens on.
    pub fn api_port(&self) -> i32 {
        self.pod
            .ports()
            .get(DATA_AGENT_PORT_NAME)
            .copied()
            .unwrap_or_default()
    }

    /// Gets the URL of the agent's API.
    pub fn url(&self) -> String {
        format!(
            "http://{host}:{port}/",
            host = self.pod.host().unwrap_or_default(),
            port = self.api_port()
        )
    }

    /// Gets the mode of the agent.
    pub fn mode(&self) -> DataAgentMode {
        self.mode
    }

    /// Gets the knit id of the served data.
    pub fn knit_id(&self) -> &str {
        &self.knit_id
    }

    /// Gets the name of the claim mounted by the agent.
    pub fn volume_ref(&self) -> &str {
        &self.volume_ref
    }

    /// Gets the phase of the agent's pod when it was last observed.
    pub fn pod_phase(&self) -> PodPhase {
        self.pod.phase()
    }
}

#[async_trait]
impl Handle for DataAgentHandle {
    fn name(&self) -> &str {
        self.pod.name()
    }

    fn namespace(&self) -> &str {
        self.pod.namespace()
    }

    async fn close(&self) -> ClusterResult<()> {
        self.pod.close().await
    }
}

impl fmt::Display for DataAgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dataagt({mode} knitId: {knit_id})",
            mode = self.mode,
            knit_id = self.knit_id
        )
    }
}

/// A claim to delete unless the spawn it belongs to succeeds.
///
/// Only claims created by the spawn are held.
struct OwnedClaim(Option<Pvc>);

impl OwnedClaim {
    /// Deletes the claim now.
    async fn release(mut self) {
        if let Some(pvc) = self.0.take() {
            if let Err(e) = pvc.close().await {
                error!("failed to delete PersistentVolumeClaim `{name}`: {e}", name = pvc.name());
            }
        }
    }

    /// Keeps the claim.
    fn keep(mut self) {
        self.0 = None;
    }
}

impl Drop for OwnedClaim {
    fn drop(&mut self) {
        let Some(pvc) = self.0.take() else {
            return;
        };

        // The spawn was abandoned before finishing
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = pvc.close().await {
                        error!(
                            "failed to delete PersistentVolumeClaim `{name}`: {e}",
                            name = pvc.name()
                        );
                    }
                });
            }
            Err(_) => warn!(
                "PersistentVolumeClaim `{name}` is left behind by an abandoned data agent",
                name = pvc.name()
            ),
        }
    }
}

/// Spawns a data agent.
///
/// The agent's pod must be scheduled by `pending_deadline`; a warning while
/// it is being scheduled fails the spawn immediately. Any resource created
/// by a failed spawn is deleted, including when the returned future is
/// dropped. Resources that already existed are left untouched.
pub async fn spawn(
    cluster: &Cluster,
    config: &ClusterConfig,
    token: &CancellationToken,
    agent: &DataAgent,
    pending_deadline: Instant,
) -> WorkloadResult<DataAgentHandle> {
    let builder = DataAgentBuilder::new(agent)?;
    let pod = builder.build(config);

    let token = token.child_token();
    let _guard = token.clone().drop_guard();

    let pvc = match agent.mode {
        DataAgentMode::Write => cluster.new_pvc(
            &token,
            Backoff::fixed(SPAWN_INTERVAL),
            builder.data().build(config),
            vec![],
        ),
        DataAgentMode::Read => cluster.get_pvc(
            &token,
            Backoff::fixed(SPAWN_INTERVAL),
            builder.data().instance(),
            vec![],
        ),
    };

    let pod = cluster.new_pod(
        &token,
        Backoff::fixed(SPAWN_INTERVAL),
        pod,
        vec![
            Checkpoint::pod_is_scheduled().with_deadline(pending_deadline),
            Checkpoint::no_warning_while_pending(),
            Checkpoint::pod_has_been_running(),
        ],
    );

    let pvc = match pvc.await {
        Ok(pvc) => pvc,
        Err(e) => {
            debug!("abandoning data agent `{name}`: {e}", name = agent.name);
            token.cancel();
            if let Ok(pod) = pod.await {
                if let Err(e) = pod.close().await {
                    error!("failed to delete Pod `{name}`: {e}", name = pod.name());
                }
            }

            return Err(e.into());
        }
    };

    let volume_ref = pvc.name().to_string();
    let claim = OwnedClaim(match agent.mode {
        DataAgentMode::Write => Some(pvc),
        DataAgentMode::Read => None,
    });

    let pod = match pod.await {
        Ok(pod) => pod,
        Err(e) => {
            debug!("abandoning data agent `{name}`: {e}", name = agent.name);
            claim.release().await;
            return Err(e.into());
        }
    };

    claim.keep();
    Ok(DataAgentHandle {
        knit_id: agent.data.knit_id.clone(),
        mode: agent.mode,
        volume_ref,
        pod,
    })
}

/// Finds a data agent spawned earlier, possibly by another process.
///
/// Fails with a missing resource error if the agent's pod or claim does not
/// exist. The claim is awaited until it is bound.
pub async fn find(
    cluster: &Cluster,
    token: &CancellationToken,
    agent: &DataAgent,
) -> WorkloadResult<DataAgentHandle> {
    let data = DataBuilder::new(agent.data.clone())?;

    let pod = cluster.get_pod(
        token,
        Backoff::fixed(FIND_INTERVAL),
        &agent.name,
        vec![Checkpoint::accept()],
    );
    let pvc = cluster.get_pvc(token, Backoff::fixed(FIND_INTERVAL), data.instance(), vec![]);

    let (pod, pvc) = futures::future::try_join(pod, pvc).await?;
    Ok(DataAgentHandle {
        knit_id: agent.data.knit_id.clone(),
        mode: agent.mode,
        volume_ref: pvc.name().to_string(),
        pod,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;
    use k8s_openapi::api::core::v1::PodCondition;
    use k8s_openapi::api::core::v1::PodStatus;
    use knitfab_cluster::testing::FakeKubeClient;
    use knitfab_domain::KnitDataBody;

    use super::*;
    use crate::Error;
    use crate::tests::config;

    fn bind(pvc: &mut PersistentVolumeClaim) {
        pvc.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".into()),
            ..Default::default()
        });
    }

    fn start(pod: &mut KubePod) {
        pod.status = Some(PodStatus {
            phase: Some("Running".into()),
            pod_ip: Some("10.0.0.2".into()),
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    fn never_schedule(pod: &mut KubePod) {
        pod.status = Some(PodStatus {
            phase: Some("Pending".into()),
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".into(),
                status: "False".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    fn agent(name: &str, mode: DataAgentMode) -> DataAgent {
        DataAgent {
            name: name.into(),
            mode,
            data: KnitDataBody::new("d1", "pvc-d1"),
        }
    }

    fn cluster(client: &Arc<FakeKubeClient>) -> Cluster {
        Cluster::new(client.clone(), "knitfab", "cluster.local")
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    /// Gets the read-only flag of the data mount of a pod.
    fn data_mount_is_read_only(pod: &KubePod) -> Option<bool> {
        pod.spec.as_ref()?.containers[0].volume_mounts.as_ref()?[0].read_only
    }

    #[test]
    fn pods_mount_the_data_claim() {
        let builder = DataAgentBuilder::new(&agent("agent-1", DataAgentMode::Read)).unwrap();
        let pod = builder.build(&config());

        assert_eq!(pod.metadata.name.as_deref(), Some("agent-1"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app.kubernetes.io/component"], "dataagt");
        assert_eq!(labels["knitfab/id"], "d1");
        assert_eq!(labels["knitfab/mode"], "read");

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.automount_service_account_token, Some(false));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            spec.containers[0].args.as_ref().unwrap(),
            &["--mode", "read", "--path", "/data", "--port", "8080", "--deadline", "180"]
        );
        assert_eq!(
            spec.volumes.as_ref().unwrap()[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "pvc-d1"
        );
        assert_eq!(data_mount_is_read_only(&pod), Some(true));
        assert_eq!(builder.build(&config()).metadata, pod.metadata);
    }

    #[tokio::test]
    async fn malformed_knit_ids_touch_nothing() {
        let client = Arc::new(FakeKubeClient::new());
        let mut agent = agent("agent-1", DataAgentMode::Write);
        agent.data.knit_id = "D1".into();

        let err = spawn(&cluster(&client), &config(), &CancellationToken::new(), &agent, deadline())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::InvalidKnitId(_)));
        assert!(client.pvc("pvc-d1").is_none());
        assert!(client.pod("agent-1").is_none());
    }

    #[tokio::test]
    async fn write_agents_create_their_claim() {
        let client = Arc::new(FakeKubeClient::new().on_create_pvc(bind).on_create_pod(start));

        let agent = spawn(
            &cluster(&client),
            &config(),
            &CancellationToken::new(),
            &agent("agent-1", DataAgentMode::Write),
            deadline(),
        )
        .await
        .unwrap();

        assert_eq!(agent.name(), "agent-1");
        assert_eq!(agent.mode(), DataAgentMode::Write);
        assert_eq!(agent.knit_id(), "d1");
        assert_eq!(agent.volume_ref(), "pvc-d1");
        assert_eq!(agent.api_port(), 8080);
        assert_eq!(agent.url(), "http://10.0.0.2:8080/");
        assert_eq!(agent.pod_phase(), PodPhase::Running);
        assert_eq!(agent.to_string(), "Dataagt(write knitId: d1)");

        let pvc = client.pvc("pvc-d1").unwrap();
        assert_eq!(
            pvc.spec.unwrap().resources.unwrap().requests.unwrap()["storage"].0,
            "1Gi"
        );
        assert_eq!(data_mount_is_read_only(&client.pod("agent-1").unwrap()), Some(false));

        agent.close().await.unwrap();
        assert!(client.pod("agent-1").is_none());
        assert!(client.pvc("pvc-d1").is_some());
        assert_eq!(client.deleted(), ["Pod/agent-1"]);
    }

    #[tokio::test]
    async fn read_agents_share_the_claim() {
        let client = Arc::new(FakeKubeClient::new().on_create_pod(start));
        let mut pvc = DataBuilder::new(KnitDataBody::new("d1", "pvc-d1"))
            .unwrap()
            .build(&config());
        bind(&mut pvc);
        client.insert_pvc("knitfab", pvc);

        let cluster = cluster(&client);
        let config = config();
        let token = CancellationToken::new();
        let (a, b) = (
            agent("agent-1", DataAgentMode::Read),
            agent("agent-2", DataAgentMode::Read),
        );
        let (first, second) = tokio::join!(
            spawn(&cluster, &config, &token, &a, deadline()),
            spawn(&cluster, &config, &token, &b, deadline()),
        );

        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.name(), second.name());
        assert_eq!(first.volume_ref(), second.volume_ref());
        assert_eq!(data_mount_is_read_only(&client.pod("agent-2").unwrap()), Some(true));
        assert!(client.deleted().is_empty());
    }

    #[tokio::test]
    async fn read_agents_never_create_claims() {
        let client = Arc::new(FakeKubeClient::new().on_create_pod(start));

        let err = spawn(
            &cluster(&client),
            &config(),
            &CancellationToken::new(),
            &agent("agent-1", DataAgentMode::Read),
            deadline(),
        )
        .await
        .err()
        .unwrap();

        assert!(err.is_missing());
        assert!(client.pvc("pvc-d1").is_none());
        assert!(client.pod("agent-1").is_none());
    }

    #[tokio::test]
    async fn a_second_writer_conflicts() {
        let client = Arc::new(FakeKubeClient::new().on_create_pvc(bind).on_create_pod(start));
        let cluster = cluster(&client);
        let token = CancellationToken::new();

        let first = spawn(
            &cluster,
            &config(),
            &token,
            &agent("agent-1", DataAgentMode::Write),
            deadline(),
        )
        .await
        .unwrap();

        let err = spawn(
            &cluster,
            &config(),
            &token,
            &agent("agent-2", DataAgentMode::Write),
            deadline(),
        )
        .await
        .err()
        .unwrap();

        assert!(err.is_conflict());
        assert!(client.pvc("pvc-d1").is_some());
        assert!(client.pod(first.name()).is_some());
        assert!(client.pod("agent-2").is_none());
    }

    #[tokio::test]
    async fn racing_writers_leave_the_winner_intact() {
        let client = Arc::new(FakeKubeClient::new().on_create_pvc(bind).on_create_pod(start));
        let cluster = cluster(&client);
        let config = config();
        let token = CancellationToken::new();
        let (a, b) = (
            agent("agent-1", DataAgentMode::Write),
            agent("agent-2", DataAgentMode::Write),
        );

        let (first, second) = tokio::join!(
            spawn(&cluster, &config, &token, &a, deadline()),
            spawn(&cluster, &config, &token, &b, deadline()),
        );

        let (winner, err) = match (first, second) {
            (Ok(winner), Err(err)) | (Err(err), Ok(winner)) => (winner, err),
            (Ok(_), Ok(_)) => panic!("both writers were spawned"),
            (Err(first), Err(second)) => panic!("both writers failed: {first}, {second}"),
        };

        assert!(err.is_conflict());
        assert!(client.pvc("pvc-d1").is_some());
        assert!(client.pod(winner.name()).is_some());

        let deleted = client.deleted();
        assert!(!deleted.contains(&"PersistentVolumeClaim/pvc-d1".to_string()));
        assert!(!deleted.contains(&format!("Pod/{name}", name = winner.name())));
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_spawns_are_reclaimed() {
        let client = Arc::new(
            FakeKubeClient::new()
                .on_create_pvc(bind)
                .on_create_pod(never_schedule),
        );
        let token = CancellationToken::new();
        tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            }
        });

        let err = spawn(
            &cluster(&client),
            &config(),
            &token,
            &agent("agent-1", DataAgentMode::Write),
            deadline(),
        )
        .await
        .err()
        .unwrap();

        assert!(err.is_canceled());
        assert!(client.pod("agent-1").is_none());
        assert!(client.pvc("pvc-d1").is_none());

        let mut deleted = client.deleted();
        deleted.sort();
        assert_eq!(deleted, ["PersistentVolumeClaim/pvc-d1", "Pod/agent-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_spawns_are_reclaimed() {
        let client = Arc::new(
            FakeKubeClient::new()
                .on_create_pvc(bind)
                .on_create_pod(never_schedule),
        );
        let cluster = cluster(&client);
        let config = config();
        let token = CancellationToken::new();
        let request = agent("agent-1", DataAgentMode::Write);

        let spawned = tokio::time::timeout(
            Duration::from_secs(1),
            spawn(&cluster, &config, &token, &request, deadline()),
        )
        .await;
        assert!(spawned.is_err());
        assert!(!token.is_cancelled());

        // Let the background deletions run
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(client.pod("agent-1").is_none());
        assert!(client.pvc("pvc-d1").is_none());

        let mut deleted = client.deleted();
        deleted.sort();
        assert_eq!(deleted, ["PersistentVolumeClaim/pvc-d1", "Pod/agent-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unscheduled_agents_are_reclaimed() {
        let client = Arc::new(
            FakeKubeClient::new()
                .on_create_pvc(bind)
                .on_create_pod(never_schedule),
        );

        let err = spawn(
            &cluster(&client),
            &config(),
            &CancellationToken::new(),
            &agent("agent-1", DataAgentMode::Write),
            deadline(),
        )
        .await
        .err()
        .unwrap();

        assert!(err.is_deadline_exceeded());
        assert!(client.pod("agent-1").is_none());
        assert!(client.pvc("pvc-d1").is_none());

        let mut deleted = client.deleted();
        deleted.sort();
        assert_eq!(deleted, ["PersistentVolumeClaim/pvc-d1", "Pod/agent-1"]);
    }

    #[tokio::test]
    async fn agents_are_found_again() {
        let client = Arc::new(FakeKubeClient::new().on_create_pvc(bind).on_create_pod(start));
        let cluster = cluster(&client);
        let token = CancellationToken::new();
        let request = agent("agent-1", DataAgentMode::Write);

        let spawned = spawn(&cluster, &config(), &token, &request, deadline())
            .await
            .unwrap();
        let found = find(&cluster, &token, &request).await.unwrap();

        assert_eq!(found.name(), spawned.name());
        assert_eq!(found.url(), spawned.url());
        assert_eq!(found.volume_ref(), "pvc-d1");

        spawned.close().await.unwrap();
        let err = find(&cluster, &token, &request).await.err().unwrap();
        assert!(err.is_missing());
    }

    #[tokio::test(start_paused = true)]
    async fn agents_with_unbound_claims_are_not_found() {
        let client = Arc::new(FakeKubeClient::new());
        let request = agent("agent-1", DataAgentMode::Read);

        let mut pod = DataAgentBuilder::new(&request).unwrap().build(&config());
        start(&mut pod);
        client.insert_pod("knitfab", pod);
        client.insert_pvc(
            "knitfab",
            DataBuilder::new(request.data.clone())
                .unwrap()
                .build(&config()),
        );

        let token = CancellationToken::new();
        tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                token.cancel();
            }
        });

        let err = find(&cluster(&client), &token, &request).await.err().unwrap();
        assert!(err.is_canceled());
    }
}
