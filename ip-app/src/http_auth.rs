//! Request signature verification for the agent endpoint.
//!
//! Signed requests carry a key identifier and a base64 DER ECDSA signature
//! over the raw body. Keys are P-256 SPKI PEM documents published by the
//! platform and cached here by identifier.

use crate::error::AgentError;
use crate::request::{header_value, parse_bearer_token};
use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

const KEY_ID_HEADERS: [&str; 2] = [
    "github-public-key-identifier",
    "x-github-public-key-identifier",
];
const SIGNATURE_HEADERS: [&str; 2] = [
    "github-public-key-signature",
    "x-github-public-key-signature",
];

/// Minimum spacing between key document fetches triggered by unknown ids.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("request body unreadable: {0}")]
    Body(String),

    #[error("signature encoding invalid: {0}")]
    Encoding(String),

    #[error("unknown public key identifier {0:?}")]
    UnknownKey(String),

    #[error("public key fetch failed: {0}")]
    KeyFetch(String),

    #[error("signature does not match request body")]
    Mismatch,
}

#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// `token` is the caller's credential, used when the key source requires
    /// authentication.
    async fn verify(
        &self,
        body: &[u8],
        key_id: &str,
        signature: &str,
        token: Option<&str>,
    ) -> Result<(), SignatureError>;
}

#[derive(Debug, Deserialize)]
struct PublicKeysDocument {
    #[serde(default)]
    public_keys: Vec<PublicKeyEntry>,
}

#[derive(Debug, Deserialize)]
struct PublicKeyEntry {
    key_identifier: String,
    key: String,
    #[serde(default)]
    is_current: bool,
}

pub struct GithubKeyVerifier {
    http: reqwest::Client,
    keys_url: String,
    user_agent: String,
    keys: DashMap<String, VerifyingKey>,
    min_refresh_interval: Duration,
    /// Held for the whole fetch so concurrent misses share one request.
    last_refresh: Mutex<Option<Instant>>,
}

impl GithubKeyVerifier {
    pub fn new(http: reqwest::Client, keys_url: &str, user_agent: &str) -> Self {
        Self {
            http,
            keys_url: keys_url.trim().to_string(),
            user_agent: user_agent.to_string(),
            keys: DashMap::new(),
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            last_refresh: Mutex::new(None),
        }
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    pub fn cached_keys(&self) -> usize {
        self.keys.len()
    }

    fn cached(&self, key_id: &str) -> Option<VerifyingKey> {
        self.keys.get(key_id).map(|entry| entry.value().clone())
    }

    /// Looks `key_id` up after a cache miss, fetching the key document at most
    /// once per refresh interval no matter how many ids miss.
    async fn load_missing(
        &self,
        key_id: &str,
        token: Option<&str>,
    ) -> Result<Option<VerifyingKey>, SignatureError> {
        let mut last_refresh = self.last_refresh.lock().await;
        if let Some(key) = self.cached(key_id) {
            return Ok(Some(key));
        }
        if let Some(at) = *last_refresh {
            if at.elapsed() < self.min_refresh_interval {
                tracing::debug!(
                    key_identifier = %key_id,
                    since_refresh_ms = at.elapsed().as_millis() as u64,
                    "public key refresh throttled"
                );
                return Ok(None);
            }
        }
        let refreshed = self.refresh(token).await;
        *last_refresh = Some(Instant::now());
        refreshed?;
        Ok(self.cached(key_id))
    }

    /// Replaces the cache with the published set. Ids no longer published are
    /// dropped; a document with no usable keys leaves the cache untouched.
    #[tracing::instrument(level = "debug", skip_all)]
    async fn refresh(&self, token: Option<&str>) -> Result<usize, SignatureError> {
        let mut request = self
            .http
            .get(&self.keys_url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SignatureError::KeyFetch(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SignatureError::KeyFetch(format!("public key endpoint returned {status}")));
        }
        let document: PublicKeysDocument = response
            .json()
            .await
            .map_err(|e| SignatureError::KeyFetch(e.to_string()))?;

        let mut published = HashMap::with_capacity(document.public_keys.len());
        for entry in document.public_keys {
            match VerifyingKey::from_public_key_pem(entry.key.trim()) {
                Ok(key) => {
                    published.insert(entry.key_identifier, key);
                }
                Err(e) => {
                    tracing::warn!(
                        key_identifier = %entry.key_identifier,
                        is_current = entry.is_current,
                        error = %e,
                        "skipping unparseable public key"
                    );
                }
            }
        }
        if published.is_empty() {
            tracing::warn!(
                cached = self.cached_keys(),
                "public key document has no usable keys; keeping cache"
            );
            return Ok(0);
        }

        let loaded = published.len();
        let before = self.cached_keys();
        self.keys.retain(|id, _| published.contains_key(id));
        let dropped = before.saturating_sub(self.cached_keys());
        for (id, key) in published {
            self.keys.insert(id, key);
        }
        tracing::info!(loaded, dropped, cached = self.cached_keys(), "public keys refreshed");
        Ok(loaded)
    }
}

#[async_trait]
impl SignatureVerifier for GithubKeyVerifier {
    async fn verify(
        &self,
        body: &[u8],
        key_id: &str,
        signature: &str,
        token: Option<&str>,
    ) -> Result<(), SignatureError> {
        let signature = decode_signature(signature)?;
        let key = match self.cached(key_id) {
            Some(key) => key,
            None => self
                .load_missing(key_id, token)
                .await?
                .ok_or_else(|| SignatureError::UnknownKey(key_id.to_string()))?,
        };
        key.verify(body, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

fn decode_signature(raw: &str) -> Result<Signature, SignatureError> {
    let der = STANDARD
        .decode(raw.trim())
        .map_err(|e| SignatureError::Encoding(e.to_string()))?;
    Signature::from_der(&der).map_err(|e| SignatureError::Encoding(e.to_string()))
}

fn first_header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| header_value(headers, name))
}

#[derive(Clone)]
pub struct SignaturePolicy {
    pub verifier: Arc<dyn SignatureVerifier>,
    pub max_body_bytes: usize,
}

#[derive(Clone)]
pub struct SignaturePolicyExt(pub SignaturePolicy);

fn reject(err: SignatureError) -> Response {
    AgentError::SignatureInvalid(err.to_string()).into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_signature(req: Request<Body>, next: Next) -> Response {
    let Some(SignaturePolicyExt(policy)) = req.extensions().get::<SignaturePolicyExt>().cloned()
    else {
        return AgentError::Internal("signature policy is not configured".to_string())
            .into_response();
    };

    let headers = req.headers();
    let key_id = first_header(headers, &KEY_ID_HEADERS);
    let signature = first_header(headers, &SIGNATURE_HEADERS);
    let token = parse_bearer_token(headers).or_else(|| header_value(headers, "x-github-token"));

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, policy.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => return reject(SignatureError::Body(e.to_string())),
    };
    let Some(key_id) = key_id else {
        return reject(SignatureError::MissingHeader(KEY_ID_HEADERS[0]));
    };
    let Some(signature) = signature else {
        return reject(SignatureError::MissingHeader(SIGNATURE_HEADERS[0]));
    };

    if let Err(e) = policy
        .verifier
        .verify(&bytes, &key_id, &signature, token.as_deref())
        .await
    {
        return reject(e);
    }
    tracing::debug!(
        key_identifier = %key_id,
        body_bytes = bytes.len(),
        "request signature verified"
    );
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}
