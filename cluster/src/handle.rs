//! Handles to provisioned cluster resources.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment as KubeDeployment;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod as KubePod;
use k8s_openapi::api::core::v1::Service as KubeService;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tokio::sync::Mutex;

use crate::ClusterResult;
use crate::KubeClient;
use crate::WithEvents;
use crate::cluster::Managed;
use crate::cluster::delete;
use crate::events::is_warning;

/// The resources key of storage.
const K8S_KEY_STORAGE: &str = "storage";

/// The capabilities shared by every resource handle.
#[async_trait]
pub trait Handle: Send + Sync {
    /// Gets the name of the resource.
    fn name(&self) -> &str;

    /// Gets the namespace of the resource.
    fn namespace(&self) -> &str;

    /// Deletes the resource.
    ///
    /// Closing an already closed (or already deleted) resource succeeds.
    async fn close(&self) -> ClusterResult<()>;
}

/// Deletes a resource at most once.
pub(crate) struct Closer<K> {
    /// The client used to delete the resource.
    client: Arc<dyn KubeClient>,
    /// The namespace of the resource.
    namespace: String,
    /// The name of the resource.
    name: String,
    /// Whether or not the resource has been deleted.
    closed: Mutex<bool>,
    /// The kind of the resource.
    kind: PhantomData<fn() -> K>,
}

impl<K: Managed> Closer<K> {
    /// Constructs a new closer.
    pub(crate) fn new(
        client: Arc<dyn KubeClient>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
            closed: Mutex::new(false),
            kind: PhantomData,
        }
    }

    /// Gets the client of the closer.
    pub(crate) fn client(&self) -> &dyn KubeClient {
        self.client.as_ref()
    }

    /// Gets the name of the resource.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Gets the namespace of the resource.
    pub(crate) fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Deletes the resource unless it was already deleted by this closer.
    pub(crate) async fn close(&self) -> ClusterResult<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }

        delete::<K>(self.client.as_ref(), &self.namespace, &self.name).await?;
        *closed = true;
        Ok(())
    }
}

/// An extension trait for Kubernetes pods.
pub(crate) trait PodExt {
    /// Gets the phase of the pod.
    fn phase(&self) -> Option<&str>;

    /// Determines if the pod has been scheduled to a node.
    fn is_scheduled(&self) -> bool;

    /// Determines if the pod reports that it is waiting for a node.
    ///
    /// Unlike `!is_scheduled()`, a pod without a `PodScheduled` condition is
    /// not waiting.
    fn is_waiting_for_node(&self) -> bool;
}

impl PodExt for KubePod {
    fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }

    fn is_scheduled(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "PodScheduled" && c.status == "True")
    }

    fn is_waiting_for_node(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "PodScheduled" && c.status != "True")
    }
}

/// The phase of a pod as seen by Knitfab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodPhase {
    /// The pod is waiting to start.
    Pending,
    /// The pod is pending and a warning was reported for it.
    Stucking,
    /// The pod is running.
    Running,
    /// The pod exited successfully.
    Succeeded,
    /// The pod exited unsuccessfully.
    Failed,
    /// The phase of the pod is unknown.
    Unknown,
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Stucking => write!(f, "stucking"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A handle to a persistent volume claim.
pub struct Pvc {
    /// The last observed claim.
    pvc: PersistentVolumeClaim,
    /// Deletes the claim.
    closer: Closer<PersistentVolumeClaim>,
}

impl Pvc {
    /// Constructs a handle from an observed claim.
    pub(crate) fn new(
        observed: WithEvents<PersistentVolumeClaim>,
        client: Arc<dyn KubeClient>,
        namespace: &str,
    ) -> Self {
        let pvc = observed.value;
        let closer = Closer::new(client, namespace, pvc.metadata.name.clone().unwrap_or_default());
        Self { pvc, closer }
    }

    /// Gets the name of the volume bound to the claim.
    pub fn volume_name(&self) -> Option<&str> {
        self.pvc.spec.as_ref().and_then(|s| s.volume_name.as_deref())
    }

    /// Gets the storage requested by the claim.
    pub fn claimed_capacity(&self) -> Option<&Quantity> {
        self.pvc
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get(K8S_KEY_STORAGE))
    }

    /// Gets the last observed claim.
    pub fn resource(&self) -> &PersistentVolumeClaim {
        &self.pvc
    }
}

#[async_trait]
impl Handle for Pvc {
    fn name(&self) -> &str {
        &self.closer.name
    }

    fn namespace(&self) -> &str {
        &self.closer.namespace
    }

    async fn close(&self) -> ClusterResult<()> {
        self.closer.close().await
    }
}

/// A handle to a pod.
pub struct Pod {
    /// The last observed pod.
    pod: KubePod,
    /// The events of the pod when it was observed.
    events: Vec<Event>,
    /// Deletes the pod.
    closer: Closer<KubePod>,
}

impl Pod {
    /// Constructs a handle from an observed pod.
    pub(crate) fn new(
        observed: WithEvents<KubePod>,
        client: Arc<dyn KubeClient>,
        namespace: &str,
    ) -> Self {
        let WithEvents { value: pod, events } = observed;
        let closer = Closer::new(client, namespace, pod.metadata.name.clone().unwrap_or_default());
        Self {
            pod,
            events,
            closer,
        }
    }

    /// Gets the phase of the pod.
    ///
    /// A pending pod that has been scheduled and whose most significant
    /// event is a warning is [`PodPhase::Stucking`]. A pod waiting for a node
    /// is [`PodPhase::Pending`] whatever its events.
    pub fn phase(&self) -> PodPhase {
        match self.pod.phase() {
            Some("Pending") if self.pod.is_waiting_for_node() => PodPhase::Pending,
            Some("Pending") => {
                match crate::events::significant_event(&self.events) {
                    Some(event) if is_warning(event) => PodPhase::Stucking,
                    _ => PodPhase::Pending,
                }
            }
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Gets the IP address of the pod.
    pub fn host(&self) -> Option<&str> {
        self.pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())
    }

    /// Gets the named container ports of the pod.
    pub fn ports(&self) -> BTreeMap<String, i32> {
        self.pod
            .spec
            .iter()
            .flat_map(|s| s.containers.iter())
            .flat_map(|c| c.ports.iter().flatten())
            .filter_map(|p| Some((p.name.clone()?, p.container_port)))
            .collect()
    }

    /// Gets the events of the pod, oldest first.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Gets the last observed pod.
    pub fn resource(&self) -> &KubePod {
        &self.pod
    }
}

#[async_trait]
impl Handle for Pod {
    fn name(&self) -> &str {
        &self.closer.name
    }

    fn namespace(&self) -> &str {
        &self.closer.namespace
    }

    async fn close(&self) -> ClusterResult<()> {
        self.closer.close().await
    }
}

/// A handle to a service.
pub struct Service {
    /// The last observed service.
    service: KubeService,
    /// The cluster domain.
    domain: String,
    /// Deletes the service.
    closer: Closer<KubeService>,
}

impl Service {
    /// Constructs a handle from an observed service.
    pub(crate) fn new(
        observed: WithEvents<KubeService>,
        client: Arc<dyn KubeClient>,
        namespace: &str,
        domain: &str,
    ) -> Self {
        let service = observed.value;
        let closer = Closer::new(
            client,
            namespace,
            service.metadata.name.clone().unwrap_or_default(),
        );
        Self {
            service,
            domain: domain.to_string(),
            closer,
        }
    }

    /// Gets the fully qualified host name of the service.
    pub fn host(&self) -> String {
        format!(
            "{name}.{namespace}.svc.{domain}",
            name = self.closer.name,
            namespace = self.closer.namespace,
            domain = self.domain
        )
    }

    /// Gets the cluster IP of the service.
    pub fn ip(&self) -> Option<&str> {
        self.service
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.as_deref())
    }

    /// Gets the port number of a named port.
    pub fn port(&self, name: &str) -> Option<i32> {
        self.service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| ports.iter().find(|p| p.name.as_deref() == Some(name)))
            .map(|p| p.port)
    }

    /// Gets the last observed service.
    pub fn resource(&self) -> &KubeService {
        &self.service
    }
}

#[async_trait]
impl Handle for Service {
    fn name(&self) -> &str {
        &self.closer.name
    }

    fn namespace(&self) -> &str {
        &self.closer.namespace
    }

    async fn close(&self) -> ClusterResult<()> {
        self.closer.close().await
    }
}

/// A handle to a deployment.
pub struct Deployment {
    /// The last observed deployment.
    deployment: KubeDeployment,
    /// Deletes the deployment.
    closer: Closer<KubeDeployment>,
}

impl Deployment {
    /// Constructs a handle from an observed deployment.
    pub(crate) fn new(
        observed: WithEvents<KubeDeployment>,
        client: Arc<dyn KubeClient>,
        namespace: &str,
    ) -> Self {
        let deployment = observed.value;
        let closer = Closer::new(
            client,
            namespace,
            deployment.metadata.name.clone().unwrap_or_default(),
        );
        Self { deployment, closer }
    }

    /// Gets the last observed deployment.
    pub fn resource(&self) -> &KubeDeployment {
        &self.deployment
    }
}

#[async_trait]
impl Handle for Deployment {
    fn name(&self) -> &str {
        &self.closer.name
    }

    fn namespace(&self) -> &str {
        &self.closer.namespace
    }

    async fn close(&self) -> ClusterResult<()> {
        self.closer.close().await
    }
}
