//! HTTP client implementing `PeerTransport`.
//!
//! `HttpTransport` issues `GET http://{peer}{path}` and splits the body
//! into lines. One pooled `reqwest::Client` serves every peer.

use datsync_common::Peer;
use datsync_peer::{PeerRequest, PeerTransport, TalkError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TalkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TalkError::Failed(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn url(peer: &Peer, request: &PeerRequest) -> String {
        format!("http://{}{}", peer, request.path())
    }
}

fn talk_error(e: reqwest::Error) -> TalkError {
    if e.is_timeout() {
        TalkError::Timeout
    } else {
        TalkError::Failed(e.to_string())
    }
}

/// Non-empty lines of a response body.
pub fn split_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait::async_trait]
impl PeerTransport for HttpTransport {
    async fn talk(&self, peer: &Peer, request: &PeerRequest) -> Result<Vec<String>, TalkError> {
        let url = Self::url(peer, request);
        let resp = self.client.get(&url).send().await.map_err(talk_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TalkError::Status(status.as_u16()));
        }

        let body = resp.text().await.map_err(talk_error)?;
        Ok(split_lines(&body))
    }
}
