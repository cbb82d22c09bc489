//! WebSocket transport for mirror observers.
//!
//! Provides:
//! - `protocol` - The JSON wire envelopes exchanged with observers
//! - `ConnectionHub` - Connection registry, fan-out, and heartbeats
//! - `websocket` - The axum `/ws/{session_id}` endpoint

pub mod hub;
pub mod protocol;
pub mod websocket;

pub use hub::{ConnectionHub, ConnectionState, InboundEvent};
pub use protocol::{
    ActionKind, CancelParams, ClientMessage, DataType, ExecuteParams, HistoryFilter,
    OutputStreamKind, ServerMessage, UpdateData,
};
pub use websocket::{WsState, router};
