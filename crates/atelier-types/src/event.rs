use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One persisted entry in a run's append-only event log.
///
/// Sequence ids start at 1 and are gapless per run. The `ping` heartbeat is
/// synthesized by the streaming layer and never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub sequence_id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(sequence_id: u64, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            sequence_id,
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

pub mod event_type {
    pub const STATUS: &str = "status";
    pub const TOOL: &str = "tool";
    pub const MESSAGE: &str = "message";
    pub const DONE: &str = "done";
    pub const PING: &str = "ping";
}
