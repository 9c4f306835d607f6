use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A workload rollout, identified by name and revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub namespace: String,
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Rollout revision; empty when the orchestrator has not assigned one yet
    pub version: String,
}

impl Deployment {
    /// Registry key: `name:version`
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}
