//! Wire protocol for observer connections.
//!
//! Three envelope kinds flow over a connection: `component_action`
//! (inbound control), `component_update` (outbound state deltas), and
//! `data_request`/`data_response` (history queries). Binary output
//! chunks are base64-encoded.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use mirror_core::{ExecStatus, SessionId, SessionStatus, SyncEvent, SyncEventType};

/// Inbound control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Flush the current coalescing window immediately.
    ForceSync,
    /// Start a proxied CLI execution.
    ExecuteCommand,
    /// Cancel a running execution.
    CancelExecution,
    /// Stop the whole mirror session.
    StopSession,
}

/// Parameters for [`ActionKind::ExecuteCommand`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteParams {
    /// Model passed to the CLI via `--model`.
    pub model: Option<String>,
    /// Working directory override.
    pub working_dir: Option<String>,
    /// Pass-through arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Watchdog timeout in seconds.
    pub timeout_secs: Option<u64>,
}

/// Parameters for [`ActionKind::CancelExecution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelParams {
    /// Execution to cancel.
    pub exec_id: Uuid,
}

/// What a `data_request` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Buffered sync events.
    SyncHistory,
    /// Retained execution snapshots.
    Executions,
    /// The session record itself.
    Session,
}

/// Filters for a `sync_history` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    /// Keep only events of this type.
    pub event_type: Option<SyncEventType>,
    /// Keep at most this many events, newest last.
    pub limit: Option<usize>,
}

/// Message from an observer to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Control action.
    ComponentAction {
        session_id: SessionId,
        action: ActionKind,
        #[serde(default)]
        parameters: Value,
    },
    /// History/state query.
    DataRequest {
        session_id: SessionId,
        data_type: DataType,
        #[serde(default)]
        filters: Value,
    },
    /// Heartbeat reply.
    Pong,
}

/// Payload of a `component_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateData {
    /// A sync pipeline event, fields mirrored verbatim.
    SyncEvent(SyncEvent),
    /// One captured output chunk (base64).
    ExecOutput {
        exec_id: Uuid,
        stream: OutputStreamKind,
        data: String,
    },
    /// Output was truncated for this execution.
    ExecTruncated { exec_id: Uuid },
    /// Execution state transition.
    ExecStatus {
        exec_id: Uuid,
        status: ExecStatus,
        exit_code: Option<i32>,
    },
    /// Session state transition.
    SessionStatus { status: SessionStatus },
}

/// Which process stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStreamKind {
    Stdout,
    Stderr,
}

/// Message from the server to an observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Outbound state delta.
    ComponentUpdate {
        session_id: SessionId,
        data: UpdateData,
        timestamp: DateTime<Utc>,
    },
    /// Answer to a `data_request`.
    DataResponse {
        session_id: SessionId,
        data_type: DataType,
        data: Value,
    },
    /// Heartbeat probe.
    Ping,
    /// Protocol-level error report.
    Error { message: String },
}

impl ServerMessage {
    /// A `component_update` stamped now.
    #[must_use]
    pub fn update(session_id: SessionId, data: UpdateData) -> Self {
        Self::ComponentUpdate {
            session_id,
            data,
            timestamp: Utc::now(),
        }
    }

    /// An output-chunk update with base64-encoded payload.
    #[must_use]
    pub fn exec_output(
        session_id: SessionId,
        exec_id: Uuid,
        stream: OutputStreamKind,
        data: &[u8],
    ) -> Self {
        Self::update(
            session_id,
            UpdateData::ExecOutput {
                exec_id,
                stream,
                data: BASE64.encode(data),
            },
        )
    }
}

impl UpdateData {
    /// Decode an `ExecOutput` payload.
    #[must_use]
    pub fn decode_output(&self) -> Option<Vec<u8>> {
        if let Self::ExecOutput { data, .. } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_envelope_uses_component_action_tag() {
        let msg = ClientMessage::ComponentAction {
            session_id: Uuid::new_v4(),
            action: ActionKind::ForceSync,
            parameters: Value::Null,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"component_action\""));
        assert!(json.contains("\"action\":\"force_sync\""));
    }

    #[test]
    fn execute_parameters_roundtrip() {
        let raw = serde_json::json!({
            "model": "opus",
            "extra_args": ["--print", "hi"],
        });
        let params: ExecuteParams = serde_json::from_value(raw).unwrap();
        assert_eq!(params.model.as_deref(), Some("opus"));
        assert_eq!(params.extra_args, vec!["--print", "hi"]);
        assert!(params.working_dir.is_none());
    }

    #[test]
    fn exec_output_roundtrips_binary_data() {
        let original = b"\x1b[31mred\x1b[0m\n";
        let msg = ServerMessage::exec_output(
            Uuid::new_v4(),
            Uuid::new_v4(),
            OutputStreamKind::Stdout,
            original,
        );
        let ServerMessage::ComponentUpdate { data, .. } = msg else {
            panic!("wrong envelope");
        };
        assert_eq!(data.decode_output().unwrap(), original);
    }

    #[test]
    fn component_update_carries_sync_event_verbatim() {
        let sid = Uuid::new_v4();
        let event = SyncEvent::sync_complete(sid, 2, 64, 17);
        let msg = ServerMessage::update(sid, UpdateData::SyncEvent(event.clone()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "component_update");
        assert_eq!(json["data"]["kind"], "sync_event");
        assert_eq!(json["data"]["files_count"], 2);
        assert_eq!(json["data"]["event_id"], event.event_id.to_string());
    }

    #[test]
    fn pong_parses_from_bare_type() {
        let msg: ClientMessage = serde_json::from_str("{\"type\":\"pong\"}").unwrap();
        assert!(matches!(msg, ClientMessage::Pong));
    }
}
