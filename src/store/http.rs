use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;

use super::{FetchPage, MessageStore, StoreError};
use crate::config::StoreConfig;
use crate::message::types::{Source, decode_rows};

/// REST client for the CRM message store.
///
/// - `GET {base}/messages[?since=<ts>]` returns a JSON array of rows
/// - `POST {base}/messages/{id}/read` marks a row read, 404 if unknown
pub struct HttpStore {
    base_url: Url,
    api_token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid store URL: {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Store URL cannot take a path: {}", config.base_url);
        }

        Ok(Self {
            base_url,
            api_token: config.api_token.clone(),
            http_client,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Append path segments to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn messages_url(&self) -> Url {
        self.endpoint(&["messages"])
    }

    fn mark_read_url(&self, id: &str) -> Url {
        self.endpoint(&["messages", id, "read"])
    }
}

#[async_trait]
impl MessageStore for HttpStore {
    async fn fetch(&self, since: Option<i64>) -> Result<FetchPage, StoreError> {
        let mut request = self.http_client.get(self.messages_url());
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let response = self.authorize(request).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Transient(format!(
                "fetch returned {}",
                response.status()
            )));
        }

        let rows: Vec<serde_json::Value> = response.json().await?;
        let (mut messages, dropped) = decode_rows(rows);
        for message in &mut messages {
            message.source = Source::Poll;
        }
        tracing::debug!(
            "Fetched {} messages, {} undecodable (since {:?})",
            messages.len(),
            dropped,
            since
        );
        Ok(FetchPage { messages, dropped })
    }

    async fn mark_read(&self, id: &str) -> Result<(), StoreError> {
        let request = self.http_client.post(self.mark_read_url(id));
        let response = self.authorize(request).send().await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(StoreError::NotFound(id.to_string())),
            status => Err(StoreError::Transient(format!("mark-read returned {}", status))),
        }
    }
}
