//! An in-memory Kubernetes API for tests.
//!
//! Resources live in a single map per kind. Creating a resource whose name
//! is taken fails with a conflict; getting or deleting a missing one fails
//! with "not found", as the API server does.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use futures::StreamExt as _;
use k8s_openapi::Metadata;
use k8s_openapi::Resource;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;

use crate::ClusterResult;
use crate::KubeClient;
use crate::LabelSelector;
use crate::LogStream;

/// Constructs an error response of the API server.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    })
}

/// A function applied to resources as they are created.
type Reaction<K> = Box<dyn Fn(&mut K) + Send + Sync>;

/// The resources of a single kind.
struct Store<K> {
    /// The resources keyed by name.
    objects: BTreeMap<String, K>,
    /// Applied to every created resource.
    reaction: Option<Reaction<K>>,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            reaction: None,
        }
    }
}

/// The state of the fake cluster.
#[derive(Default)]
struct State {
    pvcs: Store<PersistentVolumeClaim>,
    pods: Store<Pod>,
    jobs: Store<Job>,
    services: Store<Service>,
    deployments: Store<Deployment>,
    /// Events keyed by the kind and name of the object they reference.
    events: BTreeMap<(String, String), Vec<Event>>,
    /// Log lines keyed by pod and container.
    logs: BTreeMap<(String, String), Vec<String>>,
    /// Status codes returned when creating resources of a kind.
    rejections: BTreeMap<&'static str, u16>,
    /// The resources deleted so far, as `Kind/name`.
    deleted: Vec<String>,
}

/// A resource kind held by the fake cluster.
trait Stored: Resource + Metadata<Ty = ObjectMeta> + Clone {
    /// Gets the store of the kind.
    fn store(state: &mut State) -> &mut Store<Self>;
}

impl Stored for PersistentVolumeClaim {
    fn store(state: &mut State) -> &mut Store<Self> {
        &mut state.pvcs
    }
}

impl Stored for Pod {
    fn store(state: &mut State) -> &mut Store<Self> {
        &mut state.pods
    }
}

impl Stored for Job {
    fn store(state: &mut State) -> &mut Store<Self> {
        &mut state.jobs
    }
}

impl Stored for Service {
    fn store(state: &mut State) -> &mut Store<Self> {
        &mut state.services
    }
}

impl Stored for Deployment {
    fn store(state: &mut State) -> &mut Store<Self> {
        &mut state.deployments
    }
}

/// Constructs a "not found" error for a resource.
fn not_found(kind: &str, name: &str) -> kube::Error {
    api_error(404, "NotFound", format!("{kind} \"{name}\" not found"))
}

/// An in-memory implementation of [`KubeClient`].
#[derive(Default)]
pub struct FakeKubeClient {
    /// The state of the fake cluster.
    state: Mutex<State>,
}

impl FakeKubeClient {
    /// Constructs an empty fake cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the state of the fake cluster.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the reaction of a kind.
    fn react<K: Stored>(self, reaction: impl Fn(&mut K) + Send + Sync + 'static) -> Self {
        K::store(&mut self.state()).reaction = Some(Box::new(reaction));
        self
    }

    /// Applies a function to created persistent volume claims.
    pub fn on_create_pvc(
        self,
        reaction: impl Fn(&mut PersistentVolumeClaim) + Send + Sync + 'static,
    ) -> Self {
        self.react(reaction)
    }

    /// Applies a function to created pods.
    pub fn on_create_pod(self, reaction: impl Fn(&mut Pod) + Send + Sync + 'static) -> Self {
        self.react(reaction)
    }

    /// Applies a function to created jobs.
    pub fn on_create_job(self, reaction: impl Fn(&mut Job) + Send + Sync + 'static) -> Self {
        self.react(reaction)
    }

    /// Applies a function to created services.
    pub fn on_create_service(
        self,
        reaction: impl Fn(&mut Service) + Send + Sync + 'static,
    ) -> Self {
        self.react(reaction)
    }

    /// Applies a function to created deployments.
    pub fn on_create_deployment(
        self,
        reaction: impl Fn(&mut Deployment) + Send + Sync + 'static,
    ) -> Self {
        self.react(reaction)
    }

    /// Fails every creation of the given kind with the given status code.
    pub fn reject_creates(self, kind: &'static str, code: u16) -> Self {
        self.state().rejections.insert(kind, code);
        self
    }

    /// Stores a resource, replacing any resource of the same name.
    fn insert<K: Stored>(&self, namespace: &str, mut resource: K) {
        resource.metadata_mut().namespace = Some(namespace.to_string());
        let name = resource.metadata().name.clone().unwrap_or_default();
        K::store(&mut self.state()).objects.insert(name, resource);
    }

    /// Stores a persistent volume claim.
    pub fn insert_pvc(&self, namespace: &str, pvc: PersistentVolumeClaim) {
        self.insert(namespace, pvc)
    }

    /// Stores a pod.
    pub fn insert_pod(&self, namespace: &str, pod: Pod) {
        self.insert(namespace, pod)
    }

    /// Stores a job.
    pub fn insert_job(&self, namespace: &str, job: Job) {
        self.insert(namespace, job)
    }

    /// Stores a service.
    pub fn insert_service(&self, namespace: &str, service: Service) {
        self.insert(namespace, service)
    }

    /// Stores a deployment.
    pub fn insert_deployment(&self, namespace: &str, deployment: Deployment) {
        self.insert(namespace, deployment)
    }

    /// Modifies a stored pod.
    ///
    /// Does nothing if the pod does not exist.
    pub fn update_pod(&self, name: &str, update: impl FnOnce(&mut Pod)) {
        if let Some(pod) = self.state().pods.objects.get_mut(name) {
            update(pod);
        }
    }

    /// Adds events referencing an object.
    pub fn add_events(&self, kind: &str, name: &str, events: Vec<Event>) {
        self.state()
            .events
            .entry((kind.to_string(), name.to_string()))
            .or_default()
            .extend(events);
    }

    /// Sets the log of a container.
    pub fn set_log<I>(&self, pod: &str, container: &str, lines: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.state().logs.insert(
            (pod.to_string(), container.to_string()),
            lines.into_iter().map(Into::into).collect(),
        );
    }

    /// Gets a stored resource.
    fn lookup<K: Stored>(&self, name: &str) -> Option<K> {
        K::store(&mut self.state()).objects.get(name).cloned()
    }

    /// Gets a stored persistent volume claim.
    pub fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.lookup(name)
    }

    /// Gets a stored pod.
    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.lookup(name)
    }

    /// Gets a stored job.
    pub fn job(&self, name: &str) -> Option<Job> {
        self.lookup(name)
    }

    /// Gets a stored service.
    pub fn service(&self, name: &str) -> Option<Service> {
        self.lookup(name)
    }

    /// Gets a stored deployment.
    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.lookup(name)
    }

    /// Gets the resources deleted so far, as `Kind/name`, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    /// Creates a resource.
    fn create<K: Stored>(&self, namespace: &str, resource: &K) -> kube::Result<K> {
        let mut state = self.state();
        let name = resource.metadata().name.clone().unwrap_or_default();

        if let Some(&code) = state.rejections.get(K::KIND) {
            return Err(api_error(
                code,
                "Rejected",
                format!("{kind} \"{name}\" was rejected", kind = K::KIND),
            ));
        }

        let store = K::store(&mut state);
        if store.objects.contains_key(&name) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{kind} \"{name}\" already exists", kind = K::KIND),
            ));
        }

        let mut resource = resource.clone();
        resource.metadata_mut().namespace = Some(namespace.to_string());
        if let Some(reaction) = &store.reaction {
            reaction(&mut resource);
        }

        store.objects.insert(name, resource.clone());
        Ok(resource)
    }

    /// Gets a resource.
    fn get<K: Stored>(&self, name: &str) -> kube::Result<K> {
        self.lookup(name).ok_or_else(|| not_found(K::KIND, name))
    }

    /// Deletes a resource.
    fn delete<K: Stored>(&self, name: &str) -> kube::Result<()> {
        let mut state = self.state();
        if K::store(&mut state).objects.remove(name).is_none() {
            return Err(not_found(K::KIND, name));
        }

        state.deleted.push(format!("{kind}/{name}", kind = K::KIND));
        Ok(())
    }
}

#[async_trait]
impl KubeClient for FakeKubeClient {
    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> kube::Result<PersistentVolumeClaim> {
        self.create(namespace, pvc)
    }

    async fn get_pvc(&self, _: &str, name: &str) -> kube::Result<PersistentVolumeClaim> {
        self.get(name)
    }

    async fn delete_pvc(&self, _: &str, name: &str) -> kube::Result<()> {
        self.delete::<PersistentVolumeClaim>(name)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> kube::Result<Pod> {
        self.create(namespace, pod)
    }

    async fn get_pod(&self, _: &str, name: &str) -> kube::Result<Pod> {
        self.get(name)
    }

    async fn delete_pod(&self, _: &str, name: &str) -> kube::Result<()> {
        self.delete::<Pod>(name)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> kube::Result<Job> {
        self.create(namespace, job)
    }

    async fn get_job(&self, _: &str, name: &str) -> kube::Result<Job> {
        self.get(name)
    }

    async fn delete_job(&self, _: &str, name: &str) -> kube::Result<()> {
        self.delete::<Job>(name)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> kube::Result<Service> {
        self.create(namespace, service)
    }

    async fn get_service(&self, _: &str, name: &str) -> kube::Result<Service> {
        self.get(name)
    }

    async fn delete_service(&self, _: &str, name: &str) -> kube::Result<()> {
        self.delete::<Service>(name)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> kube::Result<Deployment> {
        self.create(namespace, deployment)
    }

    async fn get_deployment(&self, _: &str, name: &str) -> kube::Result<Deployment> {
        self.get(name)
    }

    async fn delete_deployment(&self, _: &str, name: &str) -> kube::Result<()> {
        self.delete::<Deployment>(name)
    }

    async fn find_pods(&self, _: &str, selector: &LabelSelector) -> kube::Result<Vec<Pod>> {
        let empty = BTreeMap::new();
        Ok(self
            .state()
            .pods
            .objects
            .values()
            .filter(|p| selector.matches(p.metadata.labels.as_ref().unwrap_or(&empty)))
            .cloned()
            .collect())
    }

    async fn get_events(
        &self,
        _: &str,
        kind: &str,
        meta: &ObjectMeta,
    ) -> kube::Result<Vec<Event>> {
        let name = meta.name.clone().unwrap_or_default();
        Ok(self
            .state()
            .events
            .get(&(kind.to_string(), name))
            .cloned()
            .unwrap_or_default())
    }

    async fn log(&self, _: &str, pod: &str, container: &str) -> ClusterResult<LogStream> {
        let state = self.state();
        if !state.pods.objects.contains_key(pod) {
            return Err(not_found(Pod::KIND, pod).into());
        }

        let lines = state
            .logs
            .get(&(pod.to_string(), container.to_string()))
            .cloned()
            .unwrap_or_default();

        Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
    }
}
