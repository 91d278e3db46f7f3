//! The email ingestion pipeline: the Gmail provider boundary, the poller
//! state machine that drives it, the message fetcher/metadata extractor,
//! and the stager that turns an extracted message into a `captures` row.

pub mod auth;
pub mod fetcher;
pub mod http_provider;
pub mod poller;
pub mod provider;
pub mod stager;

pub use auth::{ensure_fresh_token, refresh_access_token};
pub use fetcher::{decode_base64url, extract_metadata, fetch_message};
pub use http_provider::HttpGmailProvider;
pub use poller::{EmailPoller, PollOutcome, PollerConfig, Sleeper, TokenBucket, TokioSleeper};
pub use provider::{GmailProvider, HistoryPage, ProviderError, RawMessage, RawMessagePart};
pub use stager::{stage, stage_safe, StagedCapture};
