//! Preparing the cluster for a run.

use std::time::Duration;

use futures::future::join_all;
use knitfab_cluster::Backoff;
use knitfab_cluster::Cluster;
use knitfab_domain::ClusterConfig;
use knitfab_domain::Run;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ResourceBuilder;
use crate::WorkloadResult;
use crate::data::outputs_of;

/// The polling interval while provisioning the data of a run.
const PROVISION_INTERVAL: Duration = Duration::from_millis(200);

/// Provisions the claims of the data a run writes.
///
/// The claims of the outputs and the log are created concurrently and
/// awaited until bound. Claims that already exist are left as they are. If
/// any claim cannot be provisioned, the first such error is returned once
/// every claim has settled.
pub async fn initialize(
    cluster: &Cluster,
    config: &ClusterConfig,
    token: &CancellationToken,
    run: &Run,
) -> WorkloadResult<()> {
    let builders = outputs_of(run)?;
    let pvcs = builders.iter().map(|b| {
        cluster.new_pvc(
            token,
            Backoff::fixed(PROVISION_INTERVAL),
            b.build(config),
            vec![],
        )
    });

    let mut first = None;
    for (builder, result) in builders.iter().zip(join_all(pvcs).await) {
        match result {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                debug!(
                    "PersistentVolumeClaim `{name}` of run `{run}` already exists",
                    name = builder.body().volume_ref,
                    run = run.body.id
                );
            }
            Err(e) => {
                first.get_or_insert(e);
            }
        }
    }

    match first {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
