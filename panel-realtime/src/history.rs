//! Historical console lines over the panel HTTP API.

use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use shared_types::HistoricalLine;

use crate::collaborators::AuthProvider;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum HistoryError {
    #[error("History request failed: {0}")]
    Http(String),

    #[error("History endpoint answered {0}")]
    Status(u16),

    #[error("History response could not be decoded: {0}")]
    Decode(String),

    #[error("History request timed out after {0:?}")]
    Timeout(Duration),

    #[error("No credential available for the history request")]
    NotAuthenticated,
}

/// Fetches the most recent console lines for a server, oldest first.
#[async_trait(?Send)]
pub trait HistorySource {
    async fn fetch_recent_lines(
        &self,
        server_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoricalLine>, HistoryError>;
}

/// The endpoint answers either `{"lines": [...]}` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryBody {
    Wrapped { lines: Vec<HistoricalLine> },
    Bare(Vec<HistoricalLine>),
}

impl HistoryBody {
    fn into_lines(self) -> Vec<HistoricalLine> {
        match self {
            HistoryBody::Wrapped { lines } | HistoryBody::Bare(lines) => lines,
        }
    }
}

pub fn parse_history_body(body: &str) -> Result<Vec<HistoricalLine>, HistoryError> {
    serde_json::from_str::<HistoryBody>(body)
        .map(HistoryBody::into_lines)
        .map_err(|e| HistoryError::Decode(e.to_string()))
}

pub fn history_url(api_url: &str, server_id: &str, limit: usize) -> Result<url::Url, HistoryError> {
    let mut url = url::Url::parse(api_url.trim_end_matches('/'))
        .map_err(|e| HistoryError::Http(format!("invalid API URL: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| HistoryError::Http("API URL cannot be a base".to_string()))?
        .pop_if_empty()
        .extend(["api", "servers", server_id, "console", "history"]);
    url.query_pairs_mut().append_pair("limit", &limit.to_string());
    Ok(url)
}

pub struct HttpHistorySource {
    client: reqwest::Client,
    api_url: String,
    auth: Rc<dyn AuthProvider>,
}

impl HttpHistorySource {
    pub fn new(api_url: impl Into<String>, auth: Rc<dyn AuthProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            auth,
        }
    }
}

#[async_trait(?Send)]
impl HistorySource for HttpHistorySource {
    async fn fetch_recent_lines(
        &self,
        server_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoricalLine>, HistoryError> {
        let credential = self.auth.credential().ok_or(HistoryError::NotAuthenticated)?;
        let url = history_url(&self.api_url, server_id, limit)?;

        let response = self
            .client
            .get(url)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| HistoryError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| HistoryError::Http(e.to_string()))?;
        let lines = parse_history_body(&body)?;
        tracing::debug!(server_id, count = lines.len(), "fetched console history");
        Ok(lines)
    }
}
