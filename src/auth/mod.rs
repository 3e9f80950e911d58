//! # Authentication
//!
//! Token issuance and verification for the fabric. The handshake is
//! challenge/response: a node proves its identity by signing a server nonce
//! with its ed25519 key, which the server checks against the out-of-band
//! trust bundle before minting a short-lived bearer token. Every RPC then
//! carries the token; verification checks the signature, expiry (with skew),
//! and the persistent nonce blacklist.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::services::metrics::MetricsState;
use crate::storage::SecureArchive;
use crate::types::{FabricError, FabricResult, NodeId, NodeRole};

const BLACKLIST_BLOB: &str = "jwt_blacklist";
const TRUST_BUNDLE_CERT: &str = "trust_bundle.json";

/// Claims carried by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Node identity the token binds.
    pub sub: String,
    pub role: NodeRole,
    pub iat: i64,
    pub exp: i64,
    /// Revocation handle.
    pub nonce: String,
}

impl TokenClaims {
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.sub.clone())
    }
}

struct PendingChallenge {
    bytes: [u8; 32],
    issued_at: Instant,
}

/// Issues, verifies, and revokes bearer tokens.
pub struct AuthManager {
    secret: Vec<u8>,
    config: AuthConfig,
    trust: Mutex<HashMap<String, VerifyingKey>>,
    challenges: Mutex<HashMap<String, PendingChallenge>>,
    blacklist: Mutex<HashMap<String, i64>>,
    archive: Arc<SecureArchive>,
    metrics: MetricsState,
}

impl AuthManager {
    /// Build the manager from archive-held material: the fabric trust key
    /// (`certs/fabric_secret`), the trust bundle, and the persisted
    /// blacklist.
    pub fn new(archive: Arc<SecureArchive>, config: AuthConfig) -> FabricResult<Self> {
        let secret = match archive.read_cert("fabric_secret") {
            Some(bytes) => bytes,
            None => {
                // First start on a fresh archive: mint the trust key.
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                archive
                    .write_cert("fabric_secret", &bytes)
                    .map_err(|e| FabricError::internal(format!("persisting fabric secret: {e}")))?;
                bytes
            }
        };

        let manager = Self {
            secret,
            config,
            trust: Mutex::new(HashMap::new()),
            challenges: Mutex::new(HashMap::new()),
            blacklist: Mutex::new(HashMap::new()),
            archive,
            metrics: MetricsState::new("auth"),
        };
        manager.load_trust_bundle();
        manager.load_blacklist();
        Ok(manager)
    }

    pub fn metrics(&self) -> &MetricsState {
        &self.metrics
    }

    fn load_trust_bundle(&self) {
        let Some(raw) = self.archive.read_cert(TRUST_BUNDLE_CERT) else {
            debug!("No trust bundle present in archive");
            return;
        };
        let Ok(bundle) = serde_json::from_slice::<HashMap<String, String>>(&raw) else {
            warn!("Trust bundle is not a node_id -> hex key map, ignoring");
            return;
        };

        let mut trust = self.trust.lock();
        for (node_id, hex_key) in bundle {
            match hex::decode(&hex_key)
                .ok()
                .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
                .and_then(|b| VerifyingKey::from_bytes(&b).ok())
            {
                Some(key) => {
                    trust.insert(node_id, key);
                }
                None => warn!("Invalid verifying key for {} in trust bundle", node_id),
            }
        }
        info!("Loaded {} trusted node keys", trust.len());
    }

    fn load_blacklist(&self) {
        if let Some(blob) = self.archive.load_state(BLACKLIST_BLOB) {
            if let Some(entries) = blob.get("entries").and_then(Value::as_object) {
                let mut blacklist = self.blacklist.lock();
                for (nonce, exp) in entries {
                    if let Some(exp) = exp.as_i64() {
                        blacklist.insert(nonce.clone(), exp);
                    }
                }
                info!("Loaded {} blacklisted token nonces", blacklist.len());
            }
        }
    }

    fn persist_blacklist(&self) {
        let entries: serde_json::Map<String, Value> = self
            .blacklist
            .lock()
            .iter()
            .map(|(nonce, exp)| (nonce.clone(), Value::from(*exp)))
            .collect();
        self.archive
            .put_state(BLACKLIST_BLOB, json!({ "entries": entries }));
    }

    /// Register a trusted node key (tests and dynamic enrollment).
    pub fn register_trust(&self, node_id: &NodeId, key: VerifyingKey) {
        self.trust.lock().insert(node_id.to_string(), key);
    }

    /// Phase one of the handshake: hand the client a nonce to sign.
    pub fn begin_handshake(&self, node_id: &NodeId) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        self.challenges.lock().insert(
            node_id.to_string(),
            PendingChallenge { bytes, issued_at: Instant::now() },
        );
        hex::encode(bytes)
    }

    /// Phase two: verify the signed challenge and mint a token.
    pub fn complete_handshake(
        &self,
        node_id: &NodeId,
        role: NodeRole,
        signature_hex: &str,
    ) -> FabricResult<String> {
        let challenge = self
            .challenges
            .lock()
            .remove(node_id.as_str())
            .ok_or_else(|| FabricError::AuthInvalid(format!("no pending challenge for {node_id}")))?;

        if challenge.issued_at.elapsed() > Duration::from_secs(120) {
            return Err(FabricError::AuthExpired("handshake challenge expired".into()));
        }

        let key = self
            .trust
            .lock()
            .get(node_id.as_str())
            .copied()
            .ok_or_else(|| FabricError::AuthInvalid(format!("{node_id} not in trust bundle")))?;

        let signature = hex::decode(signature_hex)
            .ok()
            .and_then(|b| Signature::from_slice(&b).ok())
            .ok_or_else(|| FabricError::AuthInvalid("malformed challenge signature".into()))?;

        key.verify(&challenge.bytes, &signature)
            .map_err(|_| FabricError::AuthInvalid(format!("bad challenge signature from {node_id}")))?;

        let token = self.issue_token(node_id, role)?;
        info!("Handshake complete, token issued to {} ({})", node_id, role);
        self.metrics.increment("tokens_issued", 1.0);
        Ok(token)
    }

    /// Mint a bearer token for an authenticated identity.
    pub fn issue_token(&self, node_id: &NodeId, role: NodeRole) -> FabricResult<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            sub: node_id.to_string(),
            role,
            iat: now,
            exp: now + self.config.token_ttl_secs as i64,
            nonce: Uuid::new_v4().to_string(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| FabricError::internal(format!("token encoding: {e}")))
    }

    /// Full verification pipeline: signature, expiry with skew, blacklist.
    pub fn verify_token(&self, token: &str) -> FabricResult<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.config.clock_skew_secs;

        let data = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(|err| match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                FabricError::AuthExpired("token past expiry".into())
            }
            _ => FabricError::AuthInvalid(format!("token rejected: {err}")),
        })?;

        if self.blacklist.lock().contains_key(&data.claims.nonce) {
            self.metrics.increment("auth_revoked_denials", 1.0);
            return Err(FabricError::AuthRevoked("token nonce blacklisted".into()));
        }

        Ok(data.claims)
    }

    /// Enforce the role capability of a method.
    pub fn authorize(&self, claims: &TokenClaims, coordinator_only: bool) -> FabricResult<()> {
        if coordinator_only && claims.role != NodeRole::Coordinator {
            return Err(FabricError::AuthForbidden(format!(
                "method requires coordinator role, token is {}",
                claims.role
            )));
        }
        Ok(())
    }

    /// Revoke a token: record its nonce until the token would have expired
    /// anyway.
    pub fn revoke(&self, claims: &TokenClaims) {
        self.blacklist.lock().insert(claims.nonce.clone(), claims.exp);
        self.persist_blacklist();
        self.metrics.increment("tokens_revoked", 1.0);
        info!("Revoked token for {} (nonce {})", claims.sub, claims.nonce);
    }

    /// Drop blacklist entries whose tokens have expired on their own.
    pub fn sweep_blacklist(&self) {
        let now = chrono::Utc::now().timestamp();
        let skew = self.config.clock_skew_secs as i64;
        let removed = {
            let mut blacklist = self.blacklist.lock();
            let before = blacklist.len();
            blacklist.retain(|_, exp| *exp + skew >= now);
            before - blacklist.len()
        };
        if removed > 0 {
            debug!("Swept {} expired blacklist entries", removed);
            self.persist_blacklist();
        }
        // Stale handshakes never completed.
        self.challenges
            .lock()
            .retain(|_, c| c.issued_at.elapsed() < Duration::from_secs(300));
    }

    /// Spawn the background blacklist sweep.
    pub fn spawn_sweep(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let auth = Arc::clone(self);
        let interval_secs = auth.config.blacklist_sweep_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => auth.sweep_blacklist(),
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
