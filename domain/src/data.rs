//! Data and data agent values.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

/// The identity of a piece of Knitfab data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnitDataBody {
    /// The knit id of the data.
    pub knit_id: String,
    /// The name of the persistent volume claim holding the data.
    pub volume_ref: String,
}

impl KnitDataBody {
    /// Constructs a new data body.
    pub fn new(knit_id: impl Into<String>, volume_ref: impl Into<String>) -> Self {
        Self {
            knit_id: knit_id.into(),
            volume_ref: volume_ref.into(),
        }
    }
}

/// The mode a data agent is spawned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataAgentMode {
    /// The agent serves the data for download.
    ///
    /// The data volume is mounted read-only.
    Read,
    /// The agent accepts an upload into the data volume.
    Write,
}

impl DataAgentMode {
    /// Determines if the data agent mounts its volume read-only.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Read)
    }
}

impl fmt::Display for DataAgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

impl FromStr for DataAgentMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            _ => bail!("unknown data agent mode `{s}`"),
        }
    }
}

/// A request for a data agent.
///
/// The name is assigned by the caller and becomes the name of the agent's
/// pod, so it must be unique among live agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataAgent {
    /// The name of the data agent.
    pub name: String,
    /// The mode of the data agent.
    pub mode: DataAgentMode,
    /// The data served by the agent.
    pub data: KnitDataBody,
}
