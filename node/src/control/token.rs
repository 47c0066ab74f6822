//! Bearer tokens.
//!
//! The control plane issues short-lived tokens in exchange for a signed
//! challenge:
//!
//! 1. `GET /openbmclapi-agent/challenge?clusterId=` returns a challenge.
//! 2. The node signs it with `hex(HMAC-SHA256(secret, challenge))`.
//! 3. `POST /openbmclapi-agent/token` with the signature returns a token
//!    and its lifetime in milliseconds.
//!
//! A token is renewed by posting it back to the same endpoint before it
//! expires. If renewal fails, the challenge is solved again.

use std::sync::Arc;
use std::time::Duration;

use derivative::Derivative;
use hmac::{Hmac, Mac};
use reqwest::{Client as HttpClient, Url};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::watch;
use tokio::time;

use super::{ApiError, REQUEST_TIMEOUT};
use crate::error::{NodeError, NodeResult};
use crate::task::TaskGroup;

type HmacSha256 = Hmac<Sha256>;

/// How long before expiry a token is renewed.
const REFRESH_MARGIN: Duration = Duration::from_secs(600);

/// Delay before retrying after a failed token request.
const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Manages the bearer token of one cluster.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TokenManager {
    cluster_id: String,

    #[derivative(Debug = "ignore")]
    secret: String,

    endpoint: Url,

    #[derivative(Debug = "ignore")]
    client: HttpClient,

    /// Timeout of each token request.
    request_timeout: Duration,

    #[derivative(Debug = "ignore")]
    token: watch::Sender<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    challenge: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    cluster_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

/// A token and its lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,

    /// Lifetime in milliseconds.
    pub ttl: u64,
}

impl TokenManager {
    pub fn new(cluster_id: String, secret: String, endpoint: Url, client: HttpClient) -> Self {
        Self {
            cluster_id,
            secret,
            endpoint,
            client,
            request_timeout: REQUEST_TIMEOUT,
            token: watch::Sender::new(None),
        }
    }

    /// Overrides the timeout of token requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Returns the current token, waiting for the first one if needed.
    pub async fn get_token(&self) -> String {
        let mut rx = self.token.subscribe();

        loop {
            if let Some(token) = rx.borrow_and_update().clone() {
                return token;
            }

            // The sender lives in `self`
            if rx.changed().await.is_err() {
                return String::new();
            }
        }
    }

    /// Returns the current token without waiting.
    pub fn current_token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    /// Obtains a token by solving a challenge.
    pub async fn fetch_token(&self) -> NodeResult<TokenResponse> {
        let mut endpoint = self
            .endpoint
            .join("openbmclapi-agent/challenge")
            .map_err(NodeError::request_error)?;
        endpoint
            .query_pairs_mut()
            .append_pair("clusterId", &self.cluster_id);

        let res = self
            .client
            .get(endpoint)
            .timeout(self.request_timeout)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(ApiError::try_from_response(res).await?.into());
        }
        let challenge: ChallengeResponse = res.json().await?;

        let signature = sign_challenge(&self.secret, &challenge.challenge);

        self.post_token(&TokenRequest {
            cluster_id: &self.cluster_id,
            challenge: Some(&challenge.challenge),
            signature: Some(&signature),
            token: None,
        })
        .await
    }

    /// Renews a token.
    pub async fn refresh_token(&self, token: &str) -> NodeResult<TokenResponse> {
        self.post_token(&TokenRequest {
            cluster_id: &self.cluster_id,
            challenge: None,
            signature: None,
            token: Some(token),
        })
        .await
    }

    async fn post_token(&self, request: &TokenRequest<'_>) -> NodeResult<TokenResponse> {
        let endpoint = self
            .endpoint
            .join("openbmclapi-agent/token")
            .map_err(NodeError::request_error)?;

        let res = self
            .client
            .post(endpoint)
            .json(request)
            .timeout(self.request_timeout)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(ApiError::try_from_response(res).await?.into());
        }

        let token: TokenResponse = res.json().await?;
        self.set_token(token.token.clone());

        Ok(token)
    }

    /// Replaces the current token.
    pub(crate) fn set_token(&self, token: String) {
        self.token.send_replace(Some(token));
    }

    /// Keeps the token fresh until the group shuts down.
    pub fn setup(self: &Arc<Self>, group: &TaskGroup) {
        let manager = self.clone();
        group.spawn(async move { manager.run().await });
    }

    async fn run(&self) {
        let mut current: Option<TokenResponse> = None;

        loop {
            let result = match &current {
                Some(token) => match self.refresh_token(&token.token).await {
                    Ok(token) => Ok(token),
                    Err(e) => {
                        tracing::warn!(cluster = %self.cluster_id, "Failed to refresh token, solving a new challenge: {}", e);
                        self.fetch_token().await
                    }
                },
                None => self.fetch_token().await,
            };

            let delay = match result {
                Ok(token) => {
                    let ttl = Duration::from_millis(token.ttl);
                    let delay = refresh_delay(ttl);
                    tracing::info!(
                        cluster = %self.cluster_id,
                        "Obtained token valid for {}, refreshing in {}",
                        humantime::format_duration(ttl),
                        humantime::format_duration(delay)
                    );
                    current = Some(token);
                    delay
                }
                Err(e) => {
                    tracing::error!(cluster = %self.cluster_id, "Failed to obtain token: {}", e);
                    current = None;
                    RETRY_DELAY
                }
            };

            time::sleep(delay).await;
        }
    }
}

/// Signs a challenge with the cluster secret.
pub fn sign_challenge(secret: &str, challenge: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Returns when a token with lifetime `ttl` should be renewed.
///
/// This is `ttl - 10min`, but never earlier than half of the lifetime.
pub fn refresh_delay(ttl: Duration) -> Duration {
    ttl.saturating_sub(REFRESH_MARGIN).max(ttl / 2)
}
