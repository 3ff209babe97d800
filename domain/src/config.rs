//! Cluster configuration.

use bon::Builder;
use serde::Deserialize;

/// The default cluster domain.
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Returns the default cluster domain for deserialization.
fn default_cluster_domain() -> String {
    DEFAULT_CLUSTER_DOMAIN.to_string()
}

/// The configuration of the cluster Knitfab runs on.
#[derive(Debug, Clone, Builder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// The namespace all resources are created in.
    #[builder(into)]
    pub namespace: String,

    /// The cluster domain used to address services.
    ///
    /// Defaults to `cluster.local`.
    #[builder(into, default = DEFAULT_CLUSTER_DOMAIN)]
    #[serde(default = "default_cluster_domain")]
    pub domain: String,

    /// The data agent settings.
    pub data_agent: DataAgentConfig,

    /// The worker settings.
    pub worker: WorkerConfig,
}

/// Data agent settings.
#[derive(Debug, Clone, Builder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataAgentConfig {
    /// The data agent image.
    #[builder(into)]
    pub image: String,
    /// The port the data agent serves on.
    pub port: i32,
    /// The settings of data volumes.
    pub volume: VolumeConfig,
}

/// Data volume settings.
#[derive(Debug, Clone, Builder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    /// The storage class of data volumes.
    #[builder(into)]
    pub storage_class_name: String,
    /// The capacity requested for new data volumes (e.g. `1Gi`).
    #[builder(into)]
    pub initial_capacity: String,
}

/// Worker settings.
#[derive(Debug, Clone, Builder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// The priority class of worker pods.
    #[builder(into)]
    pub priority: Option<String>,
    /// The init container settings.
    pub init: InitConfig,
    /// The log recording sidecar settings.
    pub nurse: NurseConfig,
}

/// Init container settings.
#[derive(Debug, Clone, Builder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfig {
    /// The image preparing mount paths.
    #[builder(into)]
    pub image: String,
}

/// Log recording sidecar settings.
#[derive(Debug, Clone, Builder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NurseConfig {
    /// The image of the sidecar.
    #[builder(into)]
    pub image: String,
    /// The secret holding the service account token the sidecar reads logs
    /// with.
    #[builder(into)]
    pub service_account_secret: String,
}
