//! Persistent volume claims holding Knitfab data.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use k8s_openapi::api::core::v1::VolumeResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use knitfab_cluster::Backoff;
use knitfab_cluster::Checkpoint;
use knitfab_cluster::Cluster;
use knitfab_domain::ClusterConfig;
use knitfab_domain::KnitDataBody;
use knitfab_domain::Run;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Error;
use crate::MetaSource;
use crate::ResourceBuilder;
use crate::WorkloadResult;

/// The interval between checks of whether a claim is bound.
const BOUND_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait for a claim to be bound.
const BOUND_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Builds the persistent volume claim of a piece of data.
///
/// The claim is named by the data's volume ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuilder {
    /// The data the claim holds.
    body: KnitDataBody,
}

impl DataBuilder {
    /// Constructs a builder for the given data.
    ///
    /// Fails if the knit id is not lowercase.
    pub fn new(body: KnitDataBody) -> WorkloadResult<Self> {
        if body.knit_id != body.knit_id.to_lowercase() {
            return Err(Error::InvalidKnitId(body.knit_id));
        }

        Ok(Self { body })
    }

    /// Gets the data the claim holds.
    pub fn body(&self) -> &KnitDataBody {
        &self.body
    }
}

impl MetaSource for DataBuilder {
    fn component(&self) -> &str {
        "data"
    }

    fn instance(&self) -> &str {
        &self.body.volume_ref
    }

    fn id(&self) -> &str {
        &self.body.knit_id
    }

    fn id_type(&self) -> &str {
        "knitid"
    }
}

impl ResourceBuilder<ClusterConfig, PersistentVolumeClaim> for DataBuilder {
    fn build(&self, config: &ClusterConfig) -> PersistentVolumeClaim {
        let volume = &config.data_agent.volume;

        PersistentVolumeClaim {
            metadata: self.object_meta(&config.namespace),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                storage_class_name: Some(volume.storage_class_name.clone()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from_iter([(
                        "storage".to_string(),
                        Quantity(volume.initial_capacity.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Gets the builders of the data a run writes: its outputs, then its log.
pub fn outputs_of(run: &Run) -> WorkloadResult<Vec<DataBuilder>> {
    run.outputs
        .iter()
        .map(|o| &o.data)
        .chain(run.log.iter().map(|l| &l.data))
        .map(|d| DataBuilder::new(d.clone()))
        .collect()
}

/// Determines if the claim of a piece of data is bound to a volume.
///
/// Waits a few seconds for the claim to be bound; a claim that is still not
/// bound by then is reported as unbound.
pub async fn check_data_is_bound(
    cluster: &Cluster,
    token: &CancellationToken,
    body: &KnitDataBody,
) -> WorkloadResult<bool> {
    let token = token.child_token();
    let _guard = token.clone().drop_guard();

    let pvc = cluster.get_pvc(
        &token,
        Backoff::fixed(BOUND_CHECK_INTERVAL),
        &body.volume_ref,
        vec![Checkpoint::pvc_is_bound()],
    );

    match tokio::time::timeout(BOUND_CHECK_TIMEOUT, pvc).await {
        Ok(Ok(_)) => Ok(true),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            debug!(
                "PersistentVolumeClaim `{name}` was not bound within {secs} seconds",
                name = body.volume_ref,
                secs = BOUND_CHECK_TIMEOUT.as_secs()
            );
            Ok(false)
        }
    }
}
