use objsync_core::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Caller commands buffered before `SyncClient` methods wait.
    pub command_capacity: usize,
    pub engine: EngineConfig,
    /// Re-issue the current query after the notification channel reconnects.
    pub requery_on_reconnect: bool,
    /// Re-issue the current query when the event receiver dropped events.
    pub requery_on_lag: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_capacity: 64,
            engine: EngineConfig::default(),
            requery_on_reconnect: true,
            requery_on_lag: true,
        }
    }
}

impl ClientConfig {
    pub fn from_json(text: &str) -> Result<Self, ClientError> {
        Ok(serde_json::from_str(text)?)
    }
}
