//! JSON frames exchanged between nodes.
//!
//! Every frame is an object with a `type`. Tasks carry a hex `taskId` and a
//! task `payload`; each is answered by exactly one `task_response`. Cluster
//! events carry `data` and the sending node in `from`.

use chrono::Utc;
use colony_core::{collab_events, ColonyError, ColonyResult, TaskRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame types every node accepts, besides `collab_*` events.
pub mod message_types {
    pub const SYNC: &str = "sync";
    pub const UPDATE: &str = "update";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const STATE: &str = "state";
    pub const TASK: &str = "task";
    pub const TASK_RESPONSE: &str = "task_response";

    pub const ALL: [&str; 6] = [SYNC, UPDATE, HEARTBEAT, STATE, TASK, TASK_RESPONSE];
}

/// Whether `kind` is in the fixed frame set or is a collaboration event.
pub fn is_allowed_type(kind: &str) -> bool {
    message_types::ALL.contains(&kind) || kind.starts_with(collab_events::PREFIX)
}

/// One frame on a peer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PeerMessage {
    fn bare(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            task_id: None,
            payload: None,
            result: None,
            error: None,
            data: None,
            from: None,
            timestamp: None,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            timestamp: Some(Utc::now().timestamp_millis()),
            ..Self::bare(message_types::HEARTBEAT)
        }
    }

    pub fn task(task_id: impl Into<String>, request: &TaskRequest) -> ColonyResult<Self> {
        Ok(Self {
            task_id: Some(task_id.into()),
            payload: Some(serde_json::to_value(request)?),
            timestamp: Some(Utc::now().timestamp_millis()),
            ..Self::bare(message_types::TASK)
        })
    }

    pub fn task_result(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: Some(task_id.into()),
            result: Some(result),
            ..Self::bare(message_types::TASK_RESPONSE)
        }
    }

    pub fn task_error(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            error: Some(error.into()),
            ..Self::bare(message_types::TASK_RESPONSE)
        }
    }

    pub fn cluster_event(kind: &str, data: Value, from: impl Into<String>) -> Self {
        Self {
            data: Some(data),
            from: Some(from.into()),
            ..Self::bare(kind)
        }
    }

    pub fn to_json(&self) -> ColonyResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a raw frame, enforcing the size limit and per-type required fields.
    ///
    /// The type itself is not checked against an allow-list here; see
    /// [`is_allowed_type`].
    pub fn parse(raw: &str, max_bytes: usize, peer: &str) -> ColonyResult<Self> {
        let invalid = |reason: String| ColonyError::InvalidPeerMessage {
            peer: peer.to_string(),
            reason,
        };
        if raw.len() > max_bytes {
            return Err(invalid(format!(
                "frame of {} bytes exceeds limit of {max_bytes}",
                raw.len()
            )));
        }
        let message: PeerMessage =
            serde_json::from_str(raw).map_err(|e| invalid(format!("malformed frame: {e}")))?;
        if message.kind.trim().is_empty() {
            return Err(invalid("frame has an empty type".to_string()));
        }
        match message.kind.as_str() {
            message_types::TASK => {
                if message.task_id.is_none() || message.payload.is_none() {
                    return Err(invalid("task frame needs taskId and payload".to_string()));
                }
            }
            message_types::TASK_RESPONSE => {
                if message.task_id.is_none() {
                    return Err(invalid("task_response frame needs taskId".to_string()));
                }
            }
            _ => {}
        }
        Ok(message)
    }
}

/// Fresh 128-bit task id from the OS random source, hex-encoded.
pub fn random_task_id() -> ColonyResult<String> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| ColonyError::Io(format!("random source unavailable: {e}")))?;
    Ok(hex::encode(bytes))
}
