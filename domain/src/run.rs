//! Plan and run values.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

use crate::KnitDataBody;

/// A container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageIdentifier {
    /// The image repository.
    pub image: String,
    /// The image tag.
    pub version: String,
}

impl fmt::Display for ImageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{image}:{version}", image = self.image, version = self.version)
    }
}

/// How strongly a plan wants to run on nodes carrying a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnNodeMode {
    /// The plan may run on matching nodes (tolerate their taints).
    May,
    /// The plan prefers matching nodes.
    Prefer,
    /// The plan must run on matching nodes.
    Must,
}

impl fmt::Display for OnNodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::May => write!(f, "may"),
            Self::Prefer => write!(f, "prefer"),
            Self::Must => write!(f, "must"),
        }
    }
}

impl FromStr for OnNodeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "may" => Ok(Self::May),
            "prefer" => Ok(Self::Prefer),
            "must" => Ok(Self::Must),
            _ => bail!("unknown on-node mode `{s}`"),
        }
    }
}

/// A node placement rule of a plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OnNode {
    /// The strength of the rule.
    pub mode: OnNodeMode,
    /// The node label (and taint) key.
    pub key: String,
    /// The node label (and taint) value.
    pub value: String,
}

/// A mount point declared by a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    /// The id of the mount point.
    pub id: i32,
    /// The path the data is mounted at in the main container.
    pub path: String,
}

/// A mount point bound to concrete data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// The mount point of the plan.
    pub mount_point: MountPoint,
    /// The data assigned to the mount point.
    pub data: KnitDataBody,
}

/// The log point of a run bound to the data receiving the log.
///
/// Logs have no user-defined path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPoint {
    /// The id of the log point.
    pub id: i32,
    /// The data receiving the log.
    pub data: KnitDataBody,
}

/// The part of a plan relevant to running it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanBody {
    /// The id of the plan.
    pub plan_id: String,
    /// The image of the plan.
    ///
    /// Pseudo plans have no image.
    pub image: Option<ImageIdentifier>,
    /// The entrypoint overriding the image's.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// The arguments overriding the image's.
    #[serde(default)]
    pub args: Vec<String>,
    /// Resource limits keyed by resource name (e.g. `cpu`, `memory`).
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    /// Node placement rules.
    #[serde(default)]
    pub on_node: Vec<OnNode>,
    /// The service account the run's pod is bound to.
    pub service_account: Option<String>,
}

/// The identity of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBody {
    /// The id of the run.
    pub id: String,
    /// The name of the worker (job) executing the run.
    pub worker_name: String,
    /// The plan of the run.
    pub plan: PlanBody,
}

/// A run with its resolved assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// The identity of the run.
    pub body: RunBody,
    /// The inputs of the run.
    #[serde(default)]
    pub inputs: Vec<Assignment>,
    /// The outputs of the run.
    #[serde(default)]
    pub outputs: Vec<Assignment>,
    /// The log of the run, if recorded.
    pub log: Option<LogPoint>,
}
