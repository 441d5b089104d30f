// SPDX-License-Identifier: Apache-2.0
//! The batched HTTP fallback port and its reqwest implementation.
//!
//! The server's status contract: `200` ACK body, `429` + `Retry-After`,
//! `409` + CONFLICT body, `503` + `{leaderAddr}` redirect hint.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use tally_proto::{ConflictNotice, NotLeaderBody, PullResponse, PushRequest, PushResponse};

/// Non-transport outcomes of a push, mapped from the HTTP status contract.
#[derive(Debug)]
pub enum PushOutcome {
    /// `200`: the batch was committed.
    Ack(PushResponse),
    /// `429`: rate limited; retry no earlier than the given delay.
    RateLimited {
        /// Server-supplied `Retry-After`.
        retry_after: Duration,
    },
    /// `409`: the submission conflicts with server history.
    Conflict(ConflictNotice),
    /// `503`: this node is not the leader; redirect once.
    NotLeader(NotLeaderBody),
}

/// Transport-level push failures (retried with backoff).
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection/timeout/protocol failure.
    #[error("sync api transport: {0}")]
    Transport(String),
    /// The server answered with an unexpected status or body.
    #[error("sync api protocol: {0}")]
    Protocol(String),
}

/// The HTTP sync API as the session consumes it.
pub trait ApiClient: Send + Sync + 'static {
    /// POST a batch to `/api/sync/push` on `base` (`host:port`).
    fn push(
        &self,
        base: &str,
        request: &PushRequest,
    ) -> impl Future<Output = Result<PushOutcome, ApiError>> + Send;

    /// GET `/api/sync/pull` for cold catch-up.
    fn pull(
        &self,
        base: &str,
        game_id: &str,
        since: Option<&str>,
    ) -> impl Future<Output = Result<PullResponse, ApiError>> + Send;
}

/// reqwest-backed client.
pub struct HttpApiClient {
    client: reqwest::Client,
}

impl HttpApiClient {
    /// Build with sane timeouts for a scoring client.
    ///
    /// # Errors
    ///
    /// TLS/backend initialization failures from reqwest.
    pub fn new() -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        Ok(Self { client })
    }
}

impl ApiClient for HttpApiClient {
    async fn push(&self, base: &str, request: &PushRequest) -> Result<PushOutcome, ApiError> {
        let url = format!("http://{base}/api/sync/push");
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let status = response.status();
        match status.as_u16() {
            200 => {
                let body: PushResponse = response
                    .json()
                    .await
                    .map_err(|err| ApiError::Protocol(err.to_string()))?;
                Ok(PushOutcome::Ack(body))
            }
            429 => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(1));
                Ok(PushOutcome::RateLimited { retry_after })
            }
            409 => {
                let body: ConflictNotice = response
                    .json()
                    .await
                    .map_err(|err| ApiError::Protocol(err.to_string()))?;
                Ok(PushOutcome::Conflict(body))
            }
            503 => {
                let body: NotLeaderBody = response.json().await.unwrap_or(NotLeaderBody {
                    leader_id: None,
                    leader_addr: None,
                });
                Ok(PushOutcome::NotLeader(body))
            }
            other => Err(ApiError::Protocol(format!(
                "unexpected push status {other}"
            ))),
        }
    }

    async fn pull(
        &self,
        base: &str,
        game_id: &str,
        since: Option<&str>,
    ) -> Result<PullResponse, ApiError> {
        let mut url = format!("http://{base}/api/sync/pull?gameId={game_id}");
        if let Some(since) = since {
            url.push_str("&since=");
            url.push_str(since);
        }
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiError::Protocol(format!(
                "unexpected pull status {}",
                response.status().as_u16()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| ApiError::Protocol(err.to_string()))
    }
}
