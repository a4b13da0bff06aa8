//! Password hashing strategies.
//!
//! The strategy is chosen once when the directory is built. The remote strategy
//! asks an external password service over a request/reply channel and never falls
//! back to local hashing: the directory stores a single hash format.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::password::{is_supported_hash, CredentialHasher, PasswordError};

pub const GENERATE_PASSWORD_SUBJECT: &str = "auth.generate-password";
pub const DEFAULT_DELEGATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("password service timed out")]
    Timeout,
    #[error("password service returned an empty reply")]
    EmptyReply,
    #[error("password service reply is malformed: {0}")]
    MalformedReply(String),
    #[error("password service request failed: {0}")]
    Transport(String),
    #[error(transparent)]
    Hash(#[from] PasswordError),
}

/// Payload sent to the password service. Carries the plaintext, so it is never logged.
#[derive(Serialize)]
pub struct GeneratePasswordRequest<'a> {
    pub username: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub age: i32,
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Deserialize)]
struct GeneratePasswordReply {
    #[serde(default)]
    password: String,
}

/// A request/reply transport: one request on `subject`, one reply back.
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    async fn request(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<Bytes>;
}

/// Request/reply over HTTP: the subject becomes the last path segment.
#[derive(Clone)]
pub struct HttpReplyChannel {
    client: Client,
    base_url: String,
}

impl HttpReplyChannel {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build password service client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ReplyChannel for HttpReplyChannel {
    async fn request(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<Bytes> {
        let url = format!("{}/{}", self.base_url, subject);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .with_context(|| format!("send request to {url}"))?
            .error_for_status()
            .with_context(|| format!("non-success reply from {url}"))?;
        response.bytes().await.context("read reply body")
    }
}

pub struct RemotePasswordClient {
    channel: Arc<dyn ReplyChannel>,
    timeout: Duration,
}

impl RemotePasswordClient {
    pub fn new(channel: Arc<dyn ReplyChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    async fn generate(&self, req: &GeneratePasswordRequest<'_>) -> Result<String, DelegateError> {
        let payload =
            serde_json::to_vec(req).map_err(|e| DelegateError::Transport(e.to_string()))?;

        let reply = tokio::time::timeout(
            self.timeout,
            self.channel.request(GENERATE_PASSWORD_SUBJECT, payload),
        )
        .await
        .map_err(|_| {
            warn!(username = %req.username, timeout = ?self.timeout, "password service timed out");
            DelegateError::Timeout
        })?
        .map_err(|e| {
            error!(error = %e, username = %req.username, "password service request failed");
            DelegateError::Transport(e.to_string())
        })?;

        if reply.is_empty() {
            return Err(DelegateError::EmptyReply);
        }
        let parsed: GeneratePasswordReply = serde_json::from_slice(&reply)
            .map_err(|e| DelegateError::MalformedReply(e.to_string()))?;
        if parsed.password.is_empty() {
            return Err(DelegateError::EmptyReply);
        }
        if !is_supported_hash(&parsed.password) {
            return Err(DelegateError::MalformedReply(
                "password is not an argon2id hash".into(),
            ));
        }
        Ok(parsed.password)
    }
}

/// How new password hashes are produced.
pub enum PasswordDelegate {
    Local(CredentialHasher),
    Remote(RemotePasswordClient),
}

impl PasswordDelegate {
    pub fn kind(&self) -> &'static str {
        match self {
            PasswordDelegate::Local(_) => "local",
            PasswordDelegate::Remote(_) => "remote",
        }
    }

    pub async fn hash_password(
        &self,
        req: &GeneratePasswordRequest<'_>,
    ) -> Result<String, DelegateError> {
        if req.password.is_empty() {
            return Err(PasswordError::EmptyInput.into());
        }
        let hash = match self {
            PasswordDelegate::Local(hasher) => {
                let hasher = hasher.clone();
                let plain = req.password.to_owned();
                tokio::task::spawn_blocking(move || hasher.hash(&plain))
                    .await
                    .map_err(|e| PasswordError::Hash(e.to_string()))??
            }
            PasswordDelegate::Remote(client) => client.generate(req).await?,
        };
        debug!(username = %req.username, strategy = self.kind(), "password hashed");
        Ok(hash)
    }
}
