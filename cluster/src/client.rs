//! The raw Kubernetes API used by the cluster façade.

use std::fmt;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::AsyncBufReadExt as _;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::Client;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::LogParams;
use kube::api::PostParams;
use kube::api::PropagationPolicy;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::pin;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;

use crate::ClusterResult;
use crate::Error;
use crate::LabelSelector;

/// The number of log lines buffered ahead of the reader.
const LOG_BUFFER_LINES: usize = 64;

/// A stream of log lines.
pub type LogStream = BoxStream<'static, std::io::Result<String>>;

/// Represents the Kubernetes operations the cluster façade relies on.
///
/// Errors are returned as reported by the API server; the façade is
/// responsible for interpreting them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Creates a persistent volume claim.
    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> kube::Result<PersistentVolumeClaim>;

    /// Gets a persistent volume claim.
    async fn get_pvc(&self, namespace: &str, name: &str) -> kube::Result<PersistentVolumeClaim>;

    /// Deletes a persistent volume claim.
    async fn delete_pvc(&self, namespace: &str, name: &str) -> kube::Result<()>;

    /// Creates a pod.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> kube::Result<Pod>;

    /// Gets a pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> kube::Result<Pod>;

    /// Deletes a pod.
    async fn delete_pod(&self, namespace: &str, name: &str) -> kube::Result<()>;

    /// Creates a job.
    async fn create_job(&self, namespace: &str, job: &Job) -> kube::Result<Job>;

    /// Gets a job.
    async fn get_job(&self, namespace: &str, name: &str) -> kube::Result<Job>;

    /// Deletes a job along with its pods.
    async fn delete_job(&self, namespace: &str, name: &str) -> kube::Result<()>;

    /// Creates a service.
    async fn create_service(&self, namespace: &str, service: &Service) -> kube::Result<Service>;

    /// Gets a service.
    async fn get_service(&self, namespace: &str, name: &str) -> kube::Result<Service>;

    /// Deletes a service.
    async fn delete_service(&self, namespace: &str, name: &str) -> kube::Result<()>;

    /// Creates a deployment.
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> kube::Result<Deployment>;

    /// Gets a deployment.
    async fn get_deployment(&self, namespace: &str, name: &str) -> kube::Result<Deployment>;

    /// Deletes a deployment.
    async fn delete_deployment(&self, namespace: &str, name: &str) -> kube::Result<()>;

    /// Lists the pods matching a label selector.
    async fn find_pods(&self, namespace: &str, selector: &LabelSelector) -> kube::Result<Vec<Pod>>;

    /// Lists the events regarding an object of the given kind.
    async fn get_events(
        &self,
        namespace: &str,
        kind: &str,
        meta: &ObjectMeta,
    ) -> kube::Result<Vec<Event>>;

    /// Follows the log of a container of a pod.
    async fn log(&self, namespace: &str, pod: &str, container: &str) -> ClusterResult<LogStream>;
}

/// The delete parameters used for every resource.
fn delete_params() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(0),
        ..Default::default()
    }
}

/// Implements [`KubeClient`] with a Kubernetes client.
#[derive(Clone)]
pub struct KubeApiClient {
    /// The underlying Kubernetes client.
    client: Client,
}

impl KubeApiClient {
    /// Constructs a new client from a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Constructs a new client from the ambient Kubernetes configuration.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("failed to get default Kubernetes client")?;

        Ok(Self::new(client))
    }

    /// Gets the API for a namespaced resource.
    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Creates a namespaced resource.
    async fn create<K>(&self, namespace: &str, resource: &K) -> kube::Result<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + fmt::Debug,
    {
        self.api(namespace)
            .create(&PostParams::default(), resource)
            .await
    }

    /// Gets a namespaced resource.
    async fn get<K>(&self, namespace: &str, name: &str) -> kube::Result<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        self.api(namespace).get(name).await
    }

    /// Deletes a namespaced resource.
    async fn delete<K>(&self, namespace: &str, name: &str, params: &DeleteParams) -> kube::Result<()>
    where
        K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        self.api::<K>(namespace)
            .delete(name, params)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl KubeClient for KubeApiClient {
    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> kube::Result<PersistentVolumeClaim> {
        self.create(namespace, pvc).await
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> kube::Result<PersistentVolumeClaim> {
        self.get(namespace, name).await
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> kube::Result<()> {
        self.delete::<PersistentVolumeClaim>(namespace, name, &delete_params())
            .await
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> kube::Result<Pod> {
        self.create(namespace, pod).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> kube::Result<Pod> {
        self.get(namespace, name).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> kube::Result<()> {
        self.delete::<Pod>(namespace, name, &delete_params()).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> kube::Result<Job> {
        self.create(namespace, job).await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> kube::Result<Job> {
        self.get(namespace, name).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> kube::Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..delete_params()
        };

        self.delete::<Job>(namespace, name, &params).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> kube::Result<Service> {
        self.create(namespace, service).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> kube::Result<Service> {
        self.get(namespace, name).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> kube::Result<()> {
        self.delete::<Service>(namespace, name, &delete_params())
            .await
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> kube::Result<Deployment> {
        self.create(namespace, deployment).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> kube::Result<Deployment> {
        self.get(namespace, name).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> kube::Result<()> {
        self.delete::<Deployment>(namespace, name, &delete_params())
            .await
    }

    async fn find_pods(&self, namespace: &str, selector: &LabelSelector) -> kube::Result<Vec<Pod>> {
        let pods = self
            .api::<Pod>(namespace)
            .list(&ListParams::default().labels(&selector.query_string()))
            .await?;

        Ok(pods.items)
    }

    async fn get_events(
        &self,
        namespace: &str,
        kind: &str,
        meta: &ObjectMeta,
    ) -> kube::Result<Vec<Event>> {
        let Some(name) = &meta.name else {
            return Ok(Vec::new());
        };

        let mut fields = vec![
            format!("involvedObject.kind={kind}"),
            format!("involvedObject.name={name}"),
        ];
        if let Some(uid) = &meta.uid {
            fields.push(format!("involvedObject.uid={uid}"));
        }

        let events = self
            .api::<Event>(namespace)
            .list(&ListParams::default().fields(&fields.join(",")))
            .await?;

        Ok(events.items)
    }

    async fn log(&self, namespace: &str, pod: &str, container: &str) -> ClusterResult<LogStream> {
        let api = self.api::<Pod>(namespace);
        let name = pod.to_string();
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..Default::default()
        };

        let (opened_tx, opened_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(LOG_BUFFER_LINES);

        // The log stream borrows the API, so it is read from a task owning both
        tokio::spawn(async move {
            let reader = match api.log_stream(&name, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(e));
                    return;
                }
            };

            let lines = reader.lines();
            pin!(lines);

            while let Some(line) = lines.next().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        opened_rx.await.map_err(|_| Error::Abandoned)??;
        Ok(ReceiverStream::new(rx).boxed())
    }
}
