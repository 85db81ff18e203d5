use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client as HttpClient, StatusCode};
use thiserror::Error;

use crate::protocol::{AgentQueryRequest, AgentQueryResponse};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

pub type ChunkStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// HTTP client for the agent endpoints of the routing backend.
#[derive(Clone)]
pub struct AgentClient {
    http: HttpClient,
    base_url: String,
}

impl AgentClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Non-streaming fallback: one question, one synchronous answer.
    pub async fn query(&self, request: &AgentQueryRequest) -> Result<AgentQueryResponse, TransportError> {
        let response = self
            .http
            .post(format!("{}/api/agent/query", self.base_url))
            .json(request)
            .send()
            .await?;
        let response = require_success(response).await?;
        Ok(response.json().await?)
    }

    /// Opens the event stream for one question. The caller owns reading the
    /// chunks; a non-2xx status is reported here, before any chunk is seen.
    pub async fn open_stream(&self, request: &AgentQueryRequest) -> Result<ChunkStream, TransportError> {
        let response = self
            .http
            .post(format!("{}/api/agent/query/stream", self.base_url))
            .json(request)
            .send()
            .await?;
        let response = require_success(response).await?;
        Ok(response
            .bytes_stream()
            .map_err(TransportError::from)
            .boxed())
    }
}

async fn require_success(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status { status, body })
}
