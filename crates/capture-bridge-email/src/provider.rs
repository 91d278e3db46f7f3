//! The mail-provider boundary (spec §6, §9: an explicit, injectable
//! dependency so a test harness can drive it deterministically).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An outbound call's outcome when it did not return a usable page or
/// message. Distinguishes retryable provider trouble from a permanent
/// cursor invalidation.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub status: Option<u16>,
    pub retry_after_secs: Option<u64>,
    pub message: String,
}

impl ProviderError {
    pub fn is_cursor_invalid(&self) -> bool {
        self.status == Some(404)
    }

    /// 429 or 5xx are transient (spec §4.7).
    pub fn is_transient(&self) -> bool {
        matches!(self.status, Some(429)) || matches!(self.status, Some(s) if (500..600).contains(&s))
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub message_ids: Vec<String>,
    pub next_page_token: Option<String>,
    /// The history id to adopt as the next cursor if this is the final page.
    pub history_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawMessageBody {
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawMessagePart {
    #[serde(default, rename = "mimeType")]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<RawHeader>,
    #[serde(default)]
    pub body: RawMessageBody,
    #[serde(default)]
    pub parts: Vec<RawMessagePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    #[serde(default, rename = "internalDate")]
    pub internal_date: Option<String>,
    pub payload: Option<RawMessagePart>,
}

/// The three mail-provider endpoints the core consumes (spec §6). All
/// other endpoints are out of scope.
#[async_trait]
pub trait GmailProvider: Send + Sync {
    /// `users.messages.list` — bootstrap only, returns the server's
    /// current history id.
    async fn bootstrap_history_id(&self) -> Result<String, ProviderError>;

    /// `users.history.list(userId, startHistoryId, pageToken?, maxResults)`.
    async fn history_list(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<HistoryPage, ProviderError>;

    /// `users.messages.get(userId, id)`.
    async fn get_message(&self, id: &str) -> Result<RawMessage, ProviderError>;
}
