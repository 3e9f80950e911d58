//! # Core Types
//!
//! This module defines the fundamental types used throughout the GridMesh fabric:
//! node identity, roles, and the error taxonomy that crosses the RPC boundary.

use std::fmt;
use serde::{Deserialize, Serialize};

/// Stable identifier for a fabric node.
///
/// Node ids are operator-chosen strings (`coordinator-1`, `worker-eu-3`) and
/// travel unchanged through gossip records, chunk assignments, and tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier for a hash-cracking job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Role a node plays in the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Coordinator => write!(f, "coordinator"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(NodeRole::Coordinator),
            "worker" => Ok(NodeRole::Worker),
            other => Err(FabricError::bad_request(format!("unknown role: {other}"))),
        }
    }
}

/// Machine tags for every error that crosses the RPC boundary.
///
/// The set is closed; remote peers match on the tag, never on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthInvalid,
    AuthExpired,
    AuthRevoked,
    AuthForbidden,
    MethodNotFound,
    ServiceUnavailable,
    NodeUnreachable,
    Timeout,
    Cancelled,
    BadRequest,
    RateLimited,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthInvalid => "auth_invalid",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::AuthRevoked => "auth_revoked",
            ErrorKind::AuthForbidden => "auth_forbidden",
            ErrorKind::MethodNotFound => "method_not_found",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::NodeUnreachable => "node_unreachable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "auth_invalid" => ErrorKind::AuthInvalid,
            "auth_expired" => ErrorKind::AuthExpired,
            "auth_revoked" => ErrorKind::AuthRevoked,
            "auth_forbidden" => ErrorKind::AuthForbidden,
            "method_not_found" => ErrorKind::MethodNotFound,
            "service_unavailable" => ErrorKind::ServiceUnavailable,
            "node_unreachable" => ErrorKind::NodeUnreachable,
            "timeout" => ErrorKind::Timeout,
            "cancelled" => ErrorKind::Cancelled,
            "bad_request" => ErrorKind::BadRequest,
            "rate_limited" => ErrorKind::RateLimited,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error type for GridMesh fabric operations.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("auth invalid: {0}")]
    AuthInvalid(String),

    #[error("auth expired: {0}")]
    AuthExpired(String),

    #[error("auth revoked: {0}")]
    AuthRevoked(String),

    #[error("forbidden: {0}")]
    AuthForbidden(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FabricError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FabricError::AuthInvalid(_) => ErrorKind::AuthInvalid,
            FabricError::AuthExpired(_) => ErrorKind::AuthExpired,
            FabricError::AuthRevoked(_) => ErrorKind::AuthRevoked,
            FabricError::AuthForbidden(_) => ErrorKind::AuthForbidden,
            FabricError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            FabricError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            FabricError::NodeUnreachable(_) => ErrorKind::NodeUnreachable,
            FabricError::Timeout(_) => ErrorKind::Timeout,
            FabricError::Cancelled(_) => ErrorKind::Cancelled,
            FabricError::BadRequest(_) => ErrorKind::BadRequest,
            FabricError::RateLimited(_) => ErrorKind::RateLimited,
            FabricError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        FabricError::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        FabricError::Internal(msg.into())
    }

    pub fn from_wire(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match ErrorKind::from_tag(code) {
            ErrorKind::AuthInvalid => FabricError::AuthInvalid(message),
            ErrorKind::AuthExpired => FabricError::AuthExpired(message),
            ErrorKind::AuthRevoked => FabricError::AuthRevoked(message),
            ErrorKind::AuthForbidden => FabricError::AuthForbidden(message),
            ErrorKind::MethodNotFound => FabricError::MethodNotFound(message),
            ErrorKind::ServiceUnavailable => FabricError::ServiceUnavailable(message),
            ErrorKind::NodeUnreachable => FabricError::NodeUnreachable(message),
            ErrorKind::Timeout => FabricError::Timeout(message),
            ErrorKind::Cancelled => FabricError::Cancelled(message),
            ErrorKind::BadRequest => FabricError::BadRequest(message),
            ErrorKind::RateLimited => FabricError::RateLimited(message),
            ErrorKind::Internal => FabricError::Internal(message),
        }
    }

    /// Whether an internal retry may be attempted for this error.
    ///
    /// Only transport failures and timeouts are retriable, and only for
    /// methods tagged idempotent.
    pub fn is_retriable(&self) -> bool {
        matches!(self, FabricError::NodeUnreachable(_) | FabricError::Timeout(_))
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(err: serde_json::Error) -> Self {
        FabricError::BadRequest(format!("malformed payload: {err}"))
    }
}

/// Result type for GridMesh fabric operations.
pub type FabricResult<T> = Result<T, FabricError>;

/// Error body carried inside an RPC response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&FabricError> for RpcErrorBody {
    fn from(err: &FabricError) -> Self {
        Self {
            code: err.kind().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<FabricError> for RpcErrorBody {
    fn from(err: FabricError) -> Self {
        (&err).into()
    }
}
