//! # Transport Client
//!
//! Outbound half of the transport: a pooled HTTP client that carries the
//! node's bearer token, retries idempotent calls with exponential backoff
//! (250 ms doubling, capped at 10 s), and maps transport failures into the
//! fabric error taxonomy.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::gossip::registry::NodeRecord;
use crate::transport::{
    AuthRequest, AuthResponse, GossipPullResponse, GossipPushRequest, LongPollResponse,
    RpcRequest, RpcResponse,
};
use crate::types::{FabricError, FabricResult, NodeId, NodeRole};

/// Pooled, authenticated HTTP client for node-to-node calls.
pub struct TransportClient {
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    config: TransportConfig,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> FabricResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_secs(config.rpc_timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| FabricError::internal(format!("building http client: {e}")))?;

        Ok(Self {
            http,
            token: RwLock::new(None),
            config,
        })
    }

    pub fn set_token(&self, token: String) {
        *self.token.write() = Some(token);
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn bearer(&self) -> Option<String> {
        self.token.read().as_ref().map(|t| format!("Bearer {t}"))
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let ms = self
            .config
            .backoff_initial_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.config.backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Issue one RPC to a remote node. `idempotent` methods are retried up
    /// to `max_retries` times on transport failure or timeout; everything
    /// else surfaces immediately.
    pub async fn rpc(
        &self,
        endpoint: &str,
        method_path: &str,
        params: Value,
        idempotent: bool,
    ) -> FabricResult<Value> {
        let request = RpcRequest {
            method: method_path.to_string(),
            params,
            id: Uuid::new_v4().to_string(),
        };

        let attempts = if idempotent { self.config.max_retries + 1 } else { 1 };
        let mut last_err = FabricError::NodeUnreachable(format!("{endpoint} never attempted"));

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt - 1);
                debug!(
                    "Retrying {} against {} (attempt {}/{}) after {:?}",
                    method_path, endpoint, attempt + 1, attempts, delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.rpc_once(endpoint, &request).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt + 1 < attempts => {
                    warn!("Transient failure calling {} on {}: {}", method_path, endpoint, err);
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err)
    }

    async fn rpc_once(&self, endpoint: &str, request: &RpcRequest) -> FabricResult<Value> {
        let mut builder = self.http.post(format!("{endpoint}/rpc")).json(request);
        if let Some(bearer) = self.bearer() {
            builder = builder.header(reqwest::header::AUTHORIZATION, bearer);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                FabricError::Timeout(format!("rpc to {endpoint}: {err}"))
            } else {
                FabricError::NodeUnreachable(format!("rpc to {endpoint}: {err}"))
            }
        })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FabricError::RateLimited(format!("{endpoint} throttled the call")));
        }

        let envelope: RpcResponse = response
            .json()
            .await
            .map_err(|err| FabricError::internal(format!("malformed rpc response: {err}")))?;

        if let Some(error) = envelope.error {
            return Err(FabricError::from_wire(&error.code, error.message));
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    /// Two-phase handshake against a peer's `/auth` endpoint, storing the
    /// minted token for subsequent calls.
    pub async fn handshake(
        &self,
        endpoint: &str,
        node_id: &NodeId,
        role: NodeRole,
        signing_key: &ed25519_dalek::SigningKey,
    ) -> FabricResult<String> {
        use ed25519_dalek::Signer;

        let challenge: AuthResponse = self
            .post_json(endpoint, "/auth", &AuthRequest::Challenge { node_id: node_id.clone() })
            .await?;
        let challenge_hex = challenge
            .challenge
            .ok_or_else(|| FabricError::AuthInvalid("peer returned no challenge".into()))?;
        let challenge_bytes = hex::decode(&challenge_hex)
            .map_err(|_| FabricError::AuthInvalid("malformed challenge".into()))?;

        let signature = signing_key.sign(&challenge_bytes);
        let minted: AuthResponse = self
            .post_json(
                endpoint,
                "/auth",
                &AuthRequest::Response {
                    node_id: node_id.clone(),
                    role,
                    signature: hex::encode(signature.to_bytes()),
                },
            )
            .await?;

        match minted.token {
            Some(token) => {
                self.set_token(token.clone());
                Ok(token)
            }
            None => {
                let err = minted
                    .error
                    .map(|e| FabricError::from_wire(&e.code, e.message))
                    .unwrap_or_else(|| FabricError::AuthInvalid("handshake refused".into()));
                Err(err)
            }
        }
    }

    /// Pull gossip deltas given our version vector.
    pub async fn gossip_pull(
        &self,
        endpoint: &str,
        summary: &HashMap<NodeId, u64>,
    ) -> FabricResult<GossipPullResponse> {
        let since = serde_json::to_string(summary)?;
        let mut builder = self
            .http
            .get(format!("{endpoint}/gossip/pull"))
            .query(&[("since", since)]);
        if let Some(bearer) = self.bearer() {
            builder = builder.header(reqwest::header::AUTHORIZATION, bearer);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| FabricError::NodeUnreachable(format!("gossip pull {endpoint}: {err}")))?;
        response
            .error_for_status()
            .map_err(|err| FabricError::NodeUnreachable(format!("gossip pull {endpoint}: {err}")))?
            .json()
            .await
            .map_err(|err| FabricError::internal(format!("malformed pull response: {err}")))
    }

    /// Push records the peer is behind on.
    pub async fn gossip_push(&self, endpoint: &str, records: Vec<NodeRecord>) -> FabricResult<()> {
        let mut builder = self
            .http
            .post(format!("{endpoint}/gossip/push"))
            .json(&GossipPushRequest { records });
        if let Some(bearer) = self.bearer() {
            builder = builder.header(reqwest::header::AUTHORIZATION, bearer);
        }
        builder
            .send()
            .await
            .map_err(|err| FabricError::NodeUnreachable(format!("gossip push {endpoint}: {err}")))?
            .error_for_status()
            .map_err(|err| FabricError::NodeUnreachable(format!("gossip push {endpoint}: {err}")))?;
        Ok(())
    }

    /// Long-poll a mailbox.
    pub async fn lp_poll(
        &self,
        endpoint: &str,
        client_id: &str,
        last_id: u64,
    ) -> FabricResult<LongPollResponse> {
        let mut builder = self
            .http
            .get(format!("{endpoint}/lp/{client_id}"))
            .query(&[("last_id", last_id.to_string())])
            .timeout(Duration::from_secs(self.config.lp_timeout_secs + 5));
        if let Some(bearer) = self.bearer() {
            builder = builder.header(reqwest::header::AUTHORIZATION, bearer);
        }
        builder
            .send()
            .await
            .map_err(|err| FabricError::NodeUnreachable(format!("long-poll {endpoint}: {err}")))?
            .json()
            .await
            .map_err(|err| FabricError::internal(format!("malformed long-poll response: {err}")))
    }

    /// Enqueue a mailbox message for a specific client.
    pub async fn lp_push(
        &self,
        endpoint: &str,
        client_id: &str,
        payload: Value,
    ) -> FabricResult<()> {
        let mut builder = self
            .http
            .post(format!("{endpoint}/lp/{client_id}/push"))
            .json(&payload);
        if let Some(bearer) = self.bearer() {
            builder = builder.header(reqwest::header::AUTHORIZATION, bearer);
        }
        builder
            .send()
            .await
            .map_err(|err| FabricError::NodeUnreachable(format!("lp push {endpoint}: {err}")))?
            .error_for_status()
            .map_err(|err| FabricError::NodeUnreachable(format!("lp push {endpoint}: {err}")))?;
        Ok(())
    }

    async fn post_json<B, R>(&self, endpoint: &str, path: &str, body: &B) -> FabricResult<R>
    where
        B: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.http
            .post(format!("{endpoint}{path}"))
            .json(body)
            .send()
            .await
            .map_err(|err| FabricError::NodeUnreachable(format!("{endpoint}{path}: {err}")))?
            .json()
            .await
            .map_err(|err| FabricError::internal(format!("malformed response from {path}: {err}")))
    }
}
