//! Resource orchestration for Knitfab on Kubernetes.
//!
//! The [`Cluster`] façade creates persistent volume claims, pods, jobs,
//! services and deployments in a namespace, polls them until caller-supplied
//! [`Checkpoint`]s accept them, and hands back typed handles. Every operation
//! runs in the background and returns a [`Promise`] of its result; every
//! operation is cancelable through a [`CancellationToken`].
//!
//! Resources created by an operation that then fails are deleted before the
//! failure is reported. Resources that already existed are never deleted.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

mod checkpoint;
mod client;
mod cluster;
mod error;
mod events;
mod handle;
mod job;
mod labels;
mod promise;
mod retry;
mod status;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use checkpoint::*;
#[cfg(test)]
pub use client::MockKubeClient;
pub use client::KubeApiClient;
pub use client::KubeClient;
pub use client::LogStream;
pub use cluster::Cluster;
pub use error::*;
pub use events::*;
pub use handle::Deployment;
pub use handle::Handle;
pub use handle::Pod;
pub use handle::PodPhase;
pub use handle::Pvc;
pub use handle::Service;
pub use job::Job;
pub use labels::*;
pub use promise::*;
pub use retry::*;
pub use status::*;
