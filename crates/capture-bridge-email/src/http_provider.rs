//! `reqwest`-backed [`GmailProvider`] talking to the three Gmail REST
//! endpoints the core consumes (spec §6). `base_url` is overridable so
//! tests can point this at a local `tiny_http` fixture instead of the
//! real API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::provider::{GmailProvider, HistoryPage, ProviderError, RawMessage};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/gmail/v1";

pub struct HttpGmailProvider {
    client: Client,
    base_url: String,
    access_token: String,
}

impl HttpGmailProvider {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::with_base_url(access_token, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(access_token: impl Into<String>, base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            access_token: access_token.into(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.access_token)
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    ProviderError {
        status: err.status().map(|s| s.as_u16()),
        retry_after_secs: None,
        message: err.to_string(),
    }
}

async fn non_success_error(resp: reqwest::Response) -> ProviderError {
    let status = resp.status();
    let retry_after_secs = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let message = resp.text().await.unwrap_or_default();
    ProviderError {
        status: Some(status.as_u16()),
        retry_after_secs,
        message,
    }
}

#[derive(Deserialize)]
struct ProfileResponse {
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Deserialize)]
struct HistoryMessageRef {
    id: String,
}

#[derive(Deserialize, Default)]
struct HistoryRecord {
    #[serde(rename = "messagesAdded", default)]
    messages_added: Vec<HistoryMessageAdded>,
}

#[derive(Deserialize)]
struct HistoryMessageAdded {
    message: HistoryMessageRef,
}

#[derive(Deserialize)]
struct HistoryListResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "historyId")]
    history_id: String,
}

#[async_trait]
impl GmailProvider for HttpGmailProvider {
    async fn bootstrap_history_id(&self) -> Result<String, ProviderError> {
        let resp = self
            .get("/users/me/profile")
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(non_success_error(resp).await);
        }
        let body: ProfileResponse = resp.json().await.map_err(transport_error)?;
        Ok(body.history_id)
    }

    async fn history_list(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<HistoryPage, ProviderError> {
        let mut query = vec![
            ("startHistoryId".to_string(), start_history_id.to_string()),
            ("maxResults".to_string(), max_results.to_string()),
            ("historyTypes".to_string(), "messageAdded".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken".to_string(), token.to_string()));
        }
        let resp = self
            .get("/users/me/history")
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(non_success_error(resp).await);
        }
        let body: HistoryListResponse = resp.json().await.map_err(transport_error)?;
        let message_ids = body
            .history
            .into_iter()
            .flat_map(|record| record.messages_added.into_iter().map(|m| m.message.id))
            .collect();
        Ok(HistoryPage {
            message_ids,
            next_page_token: body.next_page_token,
            history_id: body.history_id,
        })
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, ProviderError> {
        let resp = self
            .get(&format!("/users/me/messages/{id}"))
            .query(&[("format", "full")])
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(non_success_error(resp).await);
        }
        resp.json().await.map_err(transport_error)
    }
}
