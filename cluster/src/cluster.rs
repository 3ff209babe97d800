//! Implementation of the cluster façade.
//!
//! The façade creates resources, polls them until their checkpoints accept,
//! and hands back typed handles. Resources created by a `new_*` operation
//! that then fail to become ready are deleted before the error is returned,
//! including when the operation is canceled.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use futures::future::BoxFuture;
use k8s_openapi::Metadata;
use k8s_openapi::Resource;
use k8s_openapi::api::apps::v1::Deployment as KubeDeployment;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod as KubePod;
use k8s_openapi::api::core::v1::Service as KubeService;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_retry2::RetryError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;

use crate::Backoff;
use crate::Checkpoint;
use crate::ClusterResult;
use crate::Deployment;
use crate::Error;
use crate::Job;
use crate::KubeClient;
use crate::Pod;
use crate::Promise;
use crate::Pvc;
use crate::Service;
use crate::WithEvents;
use crate::checkpoint::check_all;
use crate::error::is_already_exists;
use crate::error::is_not_found;
use crate::retry::poll;

/// A Kubernetes resource kind managed by the façade.
pub(crate) trait Managed:
    Resource + Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static
{
    /// Whether or not events are observed along with the resource.
    const HAS_EVENTS: bool = false;

    /// Creates the resource.
    fn create<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        resource: &'a Self,
    ) -> BoxFuture<'a, kube::Result<Self>>;

    /// Gets the resource.
    fn get<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<Self>>;

    /// Deletes the resource.
    fn delete<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<()>>;
}

impl Managed for PersistentVolumeClaim {
    fn create<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        resource: &'a Self,
    ) -> BoxFuture<'a, kube::Result<Self>> {
        client.create_pvc(namespace, resource)
    }

    fn get<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<Self>> {
        client.get_pvc(namespace, name)
    }

    fn delete<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<()>> {
        client.delete_pvc(namespace, name)
    }
}

impl Managed for KubePod {
    const HAS_EVENTS: bool = true;

    fn create<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        resource: &'a Self,
    ) -> BoxFuture<'a, kube::Result<Self>> {
        client.create_pod(namespace, resource)
    }

    fn get<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<Self>> {
        client.get_pod(namespace, name)
    }

    fn delete<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<()>> {
        client.delete_pod(namespace, name)
    }
}

impl Managed for KubeJob {
    fn create<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        resource: &'a Self,
    ) -> BoxFuture<'a, kube::Result<Self>> {
        client.create_job(namespace, resource)
    }

    fn get<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<Self>> {
        client.get_job(namespace, name)
    }

    fn delete<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<()>> {
        client.delete_job(namespace, name)
    }
}

impl Managed for KubeService {
    fn create<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        resource: &'a Self,
    ) -> BoxFuture<'a, kube::Result<Self>> {
        client.create_service(namespace, resource)
    }

    fn get<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<Self>> {
        client.get_service(namespace, name)
    }

    fn delete<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<()>> {
        client.delete_service(namespace, name)
    }
}

impl Managed for KubeDeployment {
    fn create<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        resource: &'a Self,
    ) -> BoxFuture<'a, kube::Result<Self>> {
        client.create_deployment(namespace, resource)
    }

    fn get<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<Self>> {
        client.get_deployment(namespace, name)
    }

    fn delete<'a>(
        client: &'a dyn KubeClient,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, kube::Result<()>> {
        client.delete_deployment(namespace, name)
    }
}

/// Deletes a resource.
///
/// Deleting a resource that does not exist succeeds.
pub(crate) async fn delete<K: Managed>(
    client: &dyn KubeClient,
    namespace: &str,
    name: &str,
) -> ClusterResult<()> {
    match K::delete(client, namespace, name).await {
        Ok(()) => {
            debug!("deleted {kind} `{name}`", kind = K::KIND);
            Ok(())
        }
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Gets a resource along with its events.
///
/// A missing resource is reported as [`Error::Missing`]. Failing to list
/// events is not an error; the resource is returned without events.
async fn observe<K: Managed>(
    client: &dyn KubeClient,
    namespace: &str,
    name: &str,
) -> ClusterResult<WithEvents<K>> {
    let value = match K::get(client, namespace, name).await {
        Ok(value) => value,
        Err(e) if is_not_found(&e) => {
            return Err(Error::Missing {
                kind: K::KIND,
                name: name.to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    if !K::HAS_EVENTS {
        return Ok(WithEvents::new(value));
    }

    match client.get_events(namespace, K::KIND, value.metadata()).await {
        Ok(events) => Ok(WithEvents::with_events(value, events)),
        Err(e) => {
            debug!(
                "ignoring failure to list events of {kind} `{name}`: {e}",
                kind = K::KIND
            );
            Ok(WithEvents::new(value))
        }
    }
}

/// Polls a resource until every checkpoint accepts it.
async fn verify<K: Managed>(
    client: &dyn KubeClient,
    namespace: &str,
    name: &str,
    token: &CancellationToken,
    backoff: Backoff,
    checkpoints: Vec<Checkpoint<K>>,
) -> ClusterResult<WithEvents<K>> {
    let checkpoints = &Mutex::new(checkpoints);

    poll(token, backoff, move || async move {
        let observed = observe::<K>(client, namespace, name)
            .await
            .map_err(RetryError::permanent)?;

        let mut checkpoints = checkpoints.lock().unwrap_or_else(PoisonError::into_inner);
        match check_all(&mut checkpoints, &observed) {
            Ok(true) => Ok(observed),
            Ok(false) => Err(RetryError::transient(Error::NotReady {
                kind: K::KIND,
                name: name.to_string(),
            })),
            Err(e) => Err(RetryError::permanent(e)),
        }
    })
    .await
}

/// Creates a resource and polls it until every checkpoint accepts it.
///
/// A resource that already exists is left untouched. A created resource that
/// does not become ready is deleted.
async fn create_and_verify<K: Managed>(
    client: Arc<dyn KubeClient>,
    namespace: String,
    token: CancellationToken,
    backoff: Backoff,
    resource: K,
    checkpoints: Vec<Checkpoint<K>>,
) -> ClusterResult<WithEvents<K>> {
    if token.is_cancelled() {
        return Err(Error::Canceled);
    }

    let name = resource.metadata().name.clone().unwrap_or_default();
    if let Err(e) = K::create(client.as_ref(), &namespace, &resource).await {
        if is_already_exists(&e) {
            return Err(Error::Conflict {
                kind: K::KIND,
                name,
                source: e,
            });
        }

        return Err(e.into());
    }

    debug!("created {kind} `{name}`", kind = K::KIND);

    match verify(client.as_ref(), &namespace, &name, &token, backoff, checkpoints).await {
        Ok(observed) => Ok(observed),
        Err(e) => {
            debug!(
                "deleting {kind} `{name}` because it did not become ready: {e}",
                kind = K::KIND
            );

            if let Err(cleanup) = delete::<K>(client.as_ref(), &namespace, &name).await {
                error!(
                    "failed to delete {kind} `{name}`: {cleanup}",
                    kind = K::KIND
                );
            }

            Err(e)
        }
    }
}

/// Gets a resource and polls it until every checkpoint accepts it.
async fn get_and_verify<K: Managed>(
    client: Arc<dyn KubeClient>,
    namespace: String,
    token: CancellationToken,
    backoff: Backoff,
    name: String,
    checkpoints: Vec<Checkpoint<K>>,
) -> ClusterResult<WithEvents<K>> {
    verify(client.as_ref(), &namespace, &name, &token, backoff, checkpoints).await
}

/// Uses the default checkpoints when none are given.
fn or_default<K>(
    checkpoints: Vec<Checkpoint<K>>,
    default: impl FnOnce() -> Checkpoint<K>,
) -> Vec<Checkpoint<K>> {
    if checkpoints.is_empty() {
        vec![default()]
    } else {
        checkpoints
    }
}

/// The resource orchestration façade of a namespace.
///
/// Every `new_*` and `get_*` operation runs in the background and returns a
/// [`Promise`] of a handle, so independent resources can be provisioned
/// concurrently. When no checkpoints are given, the kind's default
/// checkpoint is used.
#[derive(Clone)]
pub struct Cluster {
    /// The raw Kubernetes client.
    client: Arc<dyn KubeClient>,
    /// The namespace resources live in.
    namespace: String,
    /// The cluster domain.
    domain: String,
}

impl Cluster {
    /// Constructs a new cluster façade.
    pub fn new(
        client: Arc<dyn KubeClient>,
        namespace: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            domain: domain.into(),
        }
    }

    /// Gets the namespace of the cluster.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Gets the cluster domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Creates a resource in the background.
    fn spawn_new<K, H>(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        resource: K,
        checkpoints: Vec<Checkpoint<K>>,
        handle: impl FnOnce(WithEvents<K>, Arc<dyn KubeClient>, &str) -> H + Send + 'static,
    ) -> Promise<H>
    where
        K: Managed,
        H: Send + 'static,
    {
        let client = self.client.clone();
        let namespace = self.namespace.clone();
        let token = token.clone();

        Promise::spawn(async move {
            let observed = create_and_verify(
                client.clone(),
                namespace.clone(),
                token,
                backoff,
                resource,
                checkpoints,
            )
            .await?;

            Ok(handle(observed, client, &namespace))
        })
    }

    /// Gets a resource in the background.
    fn spawn_get<K, H>(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        name: &str,
        checkpoints: Vec<Checkpoint<K>>,
        handle: impl FnOnce(WithEvents<K>, Arc<dyn KubeClient>, &str) -> H + Send + 'static,
    ) -> Promise<H>
    where
        K: Managed,
        H: Send + 'static,
    {
        let client = self.client.clone();
        let namespace = self.namespace.clone();
        let token = token.clone();
        let name = name.to_string();

        Promise::spawn(async move {
            let observed = get_and_verify(
                client.clone(),
                namespace.clone(),
                token,
                backoff,
                name,
                checkpoints,
            )
            .await?;

            Ok(handle(observed, client, &namespace))
        })
    }

    /// Creates a persistent volume claim.
    ///
    /// Defaults to waiting for the claim to be bound.
    pub fn new_pvc(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        pvc: PersistentVolumeClaim,
        checkpoints: Vec<Checkpoint<PersistentVolumeClaim>>,
    ) -> Promise<Pvc> {
        let checkpoints = or_default(checkpoints, Checkpoint::pvc_is_bound);
        self.spawn_new(token, backoff, pvc, checkpoints, Pvc::new)
    }

    /// Gets an existing persistent volume claim.
    ///
    /// Defaults to waiting for the claim to be bound.
    pub fn get_pvc(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        name: &str,
        checkpoints: Vec<Checkpoint<PersistentVolumeClaim>>,
    ) -> Promise<Pvc> {
        let checkpoints = or_default(checkpoints, Checkpoint::pvc_is_bound);
        self.spawn_get(token, backoff, name, checkpoints, Pvc::new)
    }

    /// Deletes a persistent volume claim.
    pub async fn delete_pvc(&self, name: &str) -> ClusterResult<()> {
        delete::<PersistentVolumeClaim>(self.client.as_ref(), &self.namespace, name).await
    }

    /// Creates a pod.
    ///
    /// Defaults to waiting for the pod to run.
    pub fn new_pod(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        pod: KubePod,
        checkpoints: Vec<Checkpoint<KubePod>>,
    ) -> Promise<Pod> {
        let checkpoints = or_default(checkpoints, Checkpoint::pod_has_been_running);
        self.spawn_new(token, backoff, pod, checkpoints, Pod::new)
    }

    /// Gets an existing pod.
    ///
    /// Defaults to waiting for the pod to run.
    pub fn get_pod(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        name: &str,
        checkpoints: Vec<Checkpoint<KubePod>>,
    ) -> Promise<Pod> {
        let checkpoints = or_default(checkpoints, Checkpoint::pod_has_been_running);
        self.spawn_get(token, backoff, name, checkpoints, Pod::new)
    }

    /// Deletes a pod.
    pub async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        delete::<KubePod>(self.client.as_ref(), &self.namespace, name).await
    }

    /// Creates a job.
    ///
    /// Defaults to accepting the job as soon as it exists.
    pub fn new_job(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        job: KubeJob,
        checkpoints: Vec<Checkpoint<KubeJob>>,
    ) -> Promise<Job> {
        let checkpoints = or_default(checkpoints, Checkpoint::job_has_been_created);
        self.spawn_new(token, backoff, job, checkpoints, Job::new)
    }

    /// Gets an existing job.
    ///
    /// Defaults to accepting the job as soon as it exists.
    pub fn get_job(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        name: &str,
        checkpoints: Vec<Checkpoint<KubeJob>>,
    ) -> Promise<Job> {
        let checkpoints = or_default(checkpoints, Checkpoint::job_has_been_created);
        self.spawn_get(token, backoff, name, checkpoints, Job::new)
    }

    /// Deletes a job and its pods.
    pub async fn delete_job(&self, name: &str) -> ClusterResult<()> {
        delete::<KubeJob>(self.client.as_ref(), &self.namespace, name).await
    }

    /// Creates a service.
    ///
    /// Defaults to waiting for the service to be assigned a cluster IP.
    pub fn new_service(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        service: KubeService,
        checkpoints: Vec<Checkpoint<KubeService>>,
    ) -> Promise<Service> {
        let checkpoints = or_default(checkpoints, Checkpoint::service_is_ready);
        let domain = self.domain.clone();
        self.spawn_new(token, backoff, service, checkpoints, move |o, c, ns| {
            Service::new(o, c, ns, &domain)
        })
    }

    /// Gets an existing service.
    ///
    /// Defaults to waiting for the service to be assigned a cluster IP.
    pub fn get_service(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        name: &str,
        checkpoints: Vec<Checkpoint<KubeService>>,
    ) -> Promise<Service> {
        let checkpoints = or_default(checkpoints, Checkpoint::service_is_ready);
        let domain = self.domain.clone();
        self.spawn_get(token, backoff, name, checkpoints, move |o, c, ns| {
            Service::new(o, c, ns, &domain)
        })
    }

    /// Deletes a service.
    pub async fn delete_service(&self, name: &str) -> ClusterResult<()> {
        delete::<KubeService>(self.client.as_ref(), &self.namespace, name).await
    }

    /// Creates a deployment.
    ///
    /// Defaults to waiting for every replica to be available.
    pub fn new_deployment(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        deployment: KubeDeployment,
        checkpoints: Vec<Checkpoint<KubeDeployment>>,
    ) -> Promise<Deployment> {
        let checkpoints = or_default(checkpoints, Checkpoint::enough_replicas);
        self.spawn_new(token, backoff, deployment, checkpoints, Deployment::new)
    }

    /// Gets an existing deployment.
    ///
    /// Defaults to waiting for every replica to be available.
    pub fn get_deployment(
        &self,
        token: &CancellationToken,
        backoff: Backoff,
        name: &str,
        checkpoints: Vec<Checkpoint<KubeDeployment>>,
    ) -> Promise<Deployment> {
        let checkpoints = or_default(checkpoints, Checkpoint::enough_replicas);
        self.spawn_get(token, backoff, name, checkpoints, Deployment::new)
    }

    /// Deletes a deployment.
    pub async fn delete_deployment(&self, name: &str) -> ClusterResult<()> {
        delete::<KubeDeployment>(self.client.as_ref(), &self.namespace, name).await
    }
}
