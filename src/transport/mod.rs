//! # Transport
//!
//! Authenticated JSON-over-HTTP request/response channel between nodes:
//! the axum server half, the pooled reqwest client half, the wire envelope
//! types, and the per-endpoint token-bucket rate limiter.

pub mod client;
pub mod rate_limit;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::gossip::registry::NodeRecord;
use crate::types::{NodeId, NodeRole, RpcErrorBody};

/// Envelope of a `POST /rpc` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// `service/method` path.
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Opaque request id, used server-side to deduplicate retries.
    pub id: String,
}

/// Envelope of a `POST /rpc` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
    pub id: String,
}

impl RpcResponse {
    pub fn ok(id: String, result: Value) -> Self {
        Self { result: Some(result), error: None, id }
    }

    pub fn err(id: String, error: RpcErrorBody) -> Self {
        Self { result: None, error: Some(error), id }
    }
}

/// Handshake request, both phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum AuthRequest {
    Challenge { node_id: NodeId },
    Response {
        node_id: NodeId,
        role: NodeRole,
        signature: String,
    },
    Logout,
}

/// Handshake response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// Body of a `GET /gossip/pull` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPullResponse {
    /// Records newer than the caller's version vector.
    pub records: Vec<NodeRecord>,
    /// The responder's own summary, so the caller can push back.
    pub summary: HashMap<NodeId, u64>,
}

/// Body of a `POST /gossip/push` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPushRequest {
    pub records: Vec<NodeRecord>,
}

/// One long-poll mailbox message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub id: u64,
    pub sender: String,
    pub payload: Value,
}

/// Body of a `GET /lp/{client_id}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongPollResponse {
    pub client_id: String,
    pub messages: Vec<MailboxMessage>,
}
