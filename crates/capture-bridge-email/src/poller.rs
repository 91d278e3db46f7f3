//! Email Poller (spec §4.7): the IDLE→LOCK_ACQUIRED→BOOTSTRAP/PAGINATE→
//! STAGE→COMMIT→DONE state machine, with sequential execution, an
//! injectable rate limiter, and backoff/circuit-breaker integration.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use capture_bridge_hashing::UlidGenerator;
use capture_bridge_ledger::LedgerStore;
use capture_bridge_retry::{next_delay, BackoffConfig, CircuitBreaker, CircuitState};
use capture_bridge_types::{sync_keys, CoreError, ErrorCode, MetricsSink, NoopMetricsSink};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::fetcher::{extract_metadata, fetch_message};
use crate::provider::GmailProvider;
use crate::stager;

/// Injectable sleep primitive so tests never actually wait out a backoff
/// delay (spec §9: clock/sleep/RNG are explicit dependencies).
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Token bucket consumed once per outbound provider request. Optional:
/// a poller with no limiter configured never throttles.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: AsyncMutex<(f64, Instant)>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: AsyncMutex::new((capacity, Instant::now())),
        }
    }

    pub async fn acquire(&self, sleeper: &dyn Sleeper) {
        loop {
            let wait = {
                let mut guard = self.state.lock().await;
                let (tokens, last) = &mut *guard;
                let elapsed = last.elapsed().as_secs_f64();
                *tokens = (*tokens + elapsed * self.refill_per_sec).min(self.capacity);
                *last = Instant::now();
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - *tokens) / self.refill_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => sleeper.sleep(d).await,
            }
        }
    }
}

/// Configuration for a single poll cycle.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub max_results: u32,
    pub max_attempts_per_call: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_results: 100,
            max_attempts_per_call: 5,
        }
    }
}

/// What a single `poll_once` invocation accomplished.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Bootstrapped { history_id: String },
    CursorReset { history_id: String },
    Polled {
        staged: usize,
        pages: u32,
        history_id: String,
    },
}

pub struct EmailPoller {
    provider: Arc<dyn GmailProvider>,
    ledger: LedgerStore,
    metrics: Arc<dyn MetricsSink>,
    sleeper: Arc<dyn Sleeper>,
    backoff: BackoffConfig,
    circuit: AsyncMutex<CircuitBreaker>,
    rate_limiter: Option<TokenBucket>,
    lock: AsyncMutex<()>,
    config: PollerConfig,
    /// Unix seconds of the last successful cursor advance; 0 until the
    /// first one (spec `gmail_cursor_age_seconds`).
    last_cursor_update: AtomicI64,
}

impl EmailPoller {
    pub fn new(
        provider: Arc<dyn GmailProvider>,
        ledger: LedgerStore,
        config: PollerConfig,
    ) -> Self {
        Self {
            provider,
            ledger,
            metrics: Arc::new(NoopMetricsSink),
            sleeper: Arc::new(TokioSleeper),
            backoff: BackoffConfig::default(),
            circuit: AsyncMutex::new(CircuitBreaker::default()),
            rate_limiter: None,
            lock: AsyncMutex::new(()),
            config,
            last_cursor_update: AtomicI64::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_circuit_breaker(self, breaker: CircuitBreaker) -> Self {
        Self {
            circuit: AsyncMutex::new(breaker),
            ..self
        }
    }

    pub fn with_rate_limiter(mut self, limiter: TokenBucket) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit.lock().await.state()
    }

    /// Drive one full poll cycle. `now` is injected for deterministic
    /// timestamps; the circuit breaker's own clock is the real one since
    /// its cool-off window is independently unit-tested in
    /// `capture-bridge-retry`.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollOutcome, CoreError> {
        let _sequential = self.lock.lock().await;

        if !self.circuit.lock().await.allow_attempt(Instant::now()) {
            self.metrics
                .record_gauge("gmail_circuit_state", CircuitState::Open as u8 as f64);
            return Err(CoreError::new(
                ErrorCode::ApiRateLimited,
                "Circuit breaker is open",
                true,
            ));
        }

        let started = Instant::now();
        let outcome = self.poll_once_inner(now).await;

        {
            let mut breaker = self.circuit.lock().await;
            match &outcome {
                Ok(_) => breaker.on_success(),
                Err(_) => breaker.on_failure(Instant::now()),
            }
            self.metrics
                .record_gauge("gmail_circuit_state", breaker.state() as u8 as f64);
        }
        self.metrics.record_histogram(
            "gmail_poll_once_duration_ms",
            started.elapsed().as_secs_f64() * 1000.0,
        );
        outcome
    }

    async fn poll_once_inner(&self, now: DateTime<Utc>) -> Result<PollOutcome, CoreError> {
        let cursor = self.ledger.get_sync_state(sync_keys::GMAIL_HISTORY_ID).await?;

        let Some(cursor) = cursor else {
            let history_id = self.bootstrap_and_settle(now).await?;
            return Ok(PollOutcome::Bootstrapped { history_id });
        };

        let anchor = self.last_cursor_update.load(Ordering::SeqCst);
        let age_seconds = if anchor == 0 {
            0.0
        } else {
            (now.timestamp() - anchor).max(0) as f64
        };
        self.metrics
            .record_gauge("gmail_cursor_age_seconds", age_seconds);

        match self.paginate(&cursor).await {
            Ok((message_ids, final_history_id, pages)) => {
                let staged = self.commit(&message_ids, &final_history_id, now).await?;
                self.last_cursor_update.store(now.timestamp(), Ordering::SeqCst);
                self.metrics
                    .record_counter("gmail_messages_added_total", staged as u64);
                self.metrics
                    .record_counter("gmail_history_pages_processed", pages as u64);
                Ok(PollOutcome::Polled {
                    staged,
                    pages,
                    history_id: final_history_id,
                })
            }
            Err(e) if e.is_cursor_invalid() => {
                let history_id = self.bootstrap_and_settle(now).await?;
                Ok(PollOutcome::CursorReset { history_id })
            }
            Err(e) => {
                let transient = e.is_transient();
                Err(CoreError::new(ErrorCode::ApiRateLimited, e.message, transient))
            }
        }
    }

    async fn bootstrap(&self) -> Result<String, CoreError> {
        self.call_with_retry(|| {
            let provider = self.provider.clone();
            async move { provider.bootstrap_history_id().await }
        })
        .await
        .map_err(|e| {
            let transient = e.is_transient();
            CoreError::new(ErrorCode::ApiRateLimited, e.message, transient)
        })
    }

    /// Bootstrap the cursor, then immediately run one `history.list` page
    /// starting at the bootstrapped id and commit it like any other poll
    /// (spec §4.7: "proceed with an empty history page on this
    /// invocation"). Whatever that page returns — normally nothing, since
    /// it starts from the id just obtained — is staged, and the cursor
    /// ends at that page's final history id, not the bootstrap id itself.
    async fn bootstrap_and_settle(&self, now: DateTime<Utc>) -> Result<String, CoreError> {
        let bootstrap_id = self.bootstrap().await?;
        let (message_ids, final_history_id, _pages) = self.paginate(&bootstrap_id).await.map_err(|e| {
            let transient = e.is_transient();
            CoreError::new(ErrorCode::ApiRateLimited, e.message, transient)
        })?;
        self.commit(&message_ids, &final_history_id, now).await?;
        self.last_cursor_update.store(now.timestamp(), Ordering::SeqCst);
        Ok(final_history_id)
    }

    /// Sequentially page through `history.list` starting at `cursor`,
    /// returning every message id in order, the final page's history id,
    /// and the number of pages walked.
    async fn paginate(
        &self,
        cursor: &str,
    ) -> Result<(Vec<String>, String, u32), crate::provider::ProviderError> {
        let mut message_ids = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;
        let mut final_history_id;

        loop {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire(self.sleeper.as_ref()).await;
            }
            let cursor = cursor.to_string();
            let token = page_token.clone();
            let max_results = self.config.max_results;
            let page = self
                .call_with_retry(|| {
                    let provider = self.provider.clone();
                    let cursor = cursor.clone();
                    let token = token.clone();
                    async move { provider.history_list(&cursor, token.as_deref(), max_results).await }
                })
                .await?;

            pages += 1;
            message_ids.extend(page.message_ids);
            final_history_id = page.history_id;
            match page.next_page_token {
                Some(tok) => page_token = Some(tok),
                None => break,
            }
        }

        Ok((message_ids, final_history_id, pages))
    }

    /// Fetch and extract every message outside any transaction (the
    /// ledger's connection pool may be as small as one connection), then
    /// stage them all plus the cursor advance in a single transaction.
    async fn commit(
        &self,
        message_ids: &[String],
        final_history_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError> {
        let mut prepared = Vec::with_capacity(message_ids.len());
        for id in message_ids {
            let raw = fetch_message(self.provider.as_ref(), &self.ledger, id).await?;
            let (metadata, body) = extract_metadata(&raw, Some(final_history_id))?;
            prepared.push((metadata, body));
        }

        let count = prepared.len();
        let history_id = final_history_id.to_string();
        let metrics = self.metrics.clone();
        self.ledger
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let mut generator = UlidGenerator::new();
                    for (metadata, body) in &prepared {
                        stager::stage(tx, &mut generator, metrics.as_ref(), metadata, body, now)
                            .await?;
                    }
                    LedgerStore::set_sync_state(tx, sync_keys::GMAIL_HISTORY_ID, &history_id, now)
                        .await
                })
            })
            .await?;
        Ok(count)
    }

    /// Retry a single provider call up to `max_attempts_per_call` times,
    /// honoring `Retry-After` and the exponential/jitter backoff for
    /// 429/5xx. A cursor-invalid (404) error is never retried.
    async fn call_with_retry<T, Fut, F>(&self, mut f: F) -> Result<T, crate::provider::ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, crate::provider::ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_cursor_invalid() => return Err(e),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts_per_call => {
                    if e.status == Some(429) {
                        self.metrics.record_counter("gmail_429_total", 1);
                    }
                    let delay = next_delay(&self.backoff, attempt, e.retry_after_secs);
                    self.metrics
                        .record_histogram("gmail_backoff_wait_ms", delay.as_millis() as f64);
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{HistoryPage, ProviderError, RawHeader, RawMessage, RawMessageBody, RawMessagePart};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as TMutex;

    struct NoopSleeper;
    #[async_trait]
    impl Sleeper for NoopSleeper {
        async fn sleep(&self, _duration: Duration) {}
    }

    struct ScriptedProvider {
        bootstrap: TMutex<Vec<Result<String, ProviderError>>>,
        history: TMutex<Vec<Result<HistoryPage, ProviderError>>>,
        messages: HashMap<String, RawMessage>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                bootstrap: TMutex::new(Vec::new()),
                history: TMutex::new(Vec::new()),
                messages: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    async fn next_scripted<T: Clone>(v: &TMutex<Vec<T>>) -> T {
        let mut guard = v.lock().await;
        assert!(!guard.is_empty(), "scripted response exhausted");
        if guard.len() == 1 {
            guard[0].clone()
        } else {
            guard.remove(0)
        }
    }

    #[async_trait]
    impl GmailProvider for ScriptedProvider {
        async fn bootstrap_history_id(&self) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            next_scripted(&self.bootstrap).await
        }

        async fn history_list(
            &self,
            _start_history_id: &str,
            _page_token: Option<&str>,
            _max_results: u32,
        ) -> Result<HistoryPage, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            next_scripted(&self.history).await
        }

        async fn get_message(&self, id: &str) -> Result<RawMessage, ProviderError> {
            self.messages.get(id).cloned().ok_or_else(|| ProviderError {
                status: Some(404),
                retry_after_secs: None,
                message: format!("no such message: {id}"),
            })
        }
    }

    fn message(id: &str, message_id: &str) -> RawMessage {
        RawMessage {
            id: id.to_string(),
            internal_date: Some("1751364000000".to_string()),
            payload: Some(RawMessagePart {
                mime_type: "text/plain".to_string(),
                headers: vec![
                    RawHeader {
                        name: "Message-ID".to_string(),
                        value: format!("<{message_id}>"),
                    },
                    RawHeader {
                        name: "From".to_string(),
                        value: "sender@example.com".to_string(),
                    },
                ],
                body: RawMessageBody {
                    data: Some(base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        "hello",
                    )),
                },
                parts: Vec::new(),
            }),
        }
    }

    fn poller(provider: ScriptedProvider, ledger: LedgerStore) -> EmailPoller {
        EmailPoller::new(Arc::new(provider), ledger, PollerConfig::default())
            .with_sleeper(Arc::new(NoopSleeper))
    }

    #[tokio::test]
    async fn bootstraps_when_no_cursor_present() {
        let mut provider = ScriptedProvider::new();
        provider.bootstrap = TMutex::new(vec![Ok("100".to_string())]);
        provider.history = TMutex::new(vec![Ok(HistoryPage {
            message_ids: Vec::new(),
            next_page_token: None,
            history_id: "101".to_string(),
        })]);
        let ledger = LedgerStore::open_in_memory().await.unwrap();
        let p = poller(provider, ledger.clone());

        let outcome = p.poll_once(Utc::now()).await.unwrap();
        match outcome {
            PollOutcome::Bootstrapped { history_id } => assert_eq!(history_id, "101"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            ledger.get_sync_state(sync_keys::GMAIL_HISTORY_ID).await.unwrap(),
            Some("101".to_string())
        );
    }

    #[tokio::test]
    async fn paginates_and_stages_then_advances_cursor() {
        let mut provider = ScriptedProvider::new();
        provider.history = TMutex::new(vec![
            Ok(HistoryPage {
                message_ids: vec!["m1".to_string()],
                next_page_token: Some("page2".to_string()),
                history_id: "101".to_string(),
            }),
            Ok(HistoryPage {
                message_ids: vec!["m2".to_string()],
                next_page_token: None,
                history_id: "102".to_string(),
            }),
        ]);
        provider.messages.insert("m1".to_string(), message("m1", "a@example.com"));
        provider.messages.insert("m2".to_string(), message("m2", "b@example.com"));

        let ledger = LedgerStore::open_in_memory().await.unwrap();
        ledger
            .with_transaction(|tx| {
                Box::pin(async move {
                    LedgerStore::set_sync_state(tx, sync_keys::GMAIL_HISTORY_ID, "100", Utc::now()).await
                })
            })
            .await
            .unwrap();

        let p = poller(provider, ledger.clone());
        let outcome = p.poll_once(Utc::now()).await.unwrap();
        match outcome {
            PollOutcome::Polled { staged, pages, history_id } => {
                assert_eq!(staged, 2);
                assert_eq!(pages, 2);
                assert_eq!(history_id, "102");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            ledger.get_sync_state(sync_keys::GMAIL_HISTORY_ID).await.unwrap(),
            Some("102".to_string())
        );
    }

    #[tokio::test]
    async fn staging_failure_leaves_cursor_unchanged() {
        let mut provider = ScriptedProvider::new();
        provider.history = TMutex::new(vec![Ok(HistoryPage {
            message_ids: vec!["bad".to_string()],
            next_page_token: None,
            history_id: "200".to_string(),
        })]);
        // No entry registered for "bad" -> get_message returns 404, which
        // is not cursor-invalidating in this context since it originates
        // from messages.get rather than history.list.
        let ledger = LedgerStore::open_in_memory().await.unwrap();
        ledger
            .with_transaction(|tx| {
                Box::pin(async move {
                    LedgerStore::set_sync_state(tx, sync_keys::GMAIL_HISTORY_ID, "100", Utc::now()).await
                })
            })
            .await
            .unwrap();

        let p = poller(provider, ledger.clone());
        let err = p.poll_once(Utc::now()).await;
        assert!(err.is_err());
        assert_eq!(
            ledger.get_sync_state(sync_keys::GMAIL_HISTORY_ID).await.unwrap(),
            Some("100".to_string())
        );
    }

    #[tokio::test]
    async fn cursor_invalid_triggers_reset_and_rebootstrap() {
        let mut provider = ScriptedProvider::new();
        provider.history = TMutex::new(vec![
            Err(ProviderError {
                status: Some(404),
                retry_after_secs: None,
                message: "history id too old".to_string(),
            }),
            Ok(HistoryPage {
                message_ids: Vec::new(),
                next_page_token: None,
                history_id: "501".to_string(),
            }),
        ]);
        provider.bootstrap = TMutex::new(vec![Ok("500".to_string())]);

        let ledger = LedgerStore::open_in_memory().await.unwrap();
        ledger
            .with_transaction(|tx| {
                Box::pin(async move {
                    LedgerStore::set_sync_state(tx, sync_keys::GMAIL_HISTORY_ID, "1", Utc::now()).await
                })
            })
            .await
            .unwrap();

        let p = poller(provider, ledger.clone());
        let outcome = p.poll_once(Utc::now()).await.unwrap();
        match outcome {
            PollOutcome::CursorReset { history_id } => assert_eq!(history_id, "501"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_five_consecutive_failures_and_blocks_the_sixth() {
        let mut provider = ScriptedProvider::new();
        provider.history = TMutex::new(vec![Err(ProviderError {
            status: Some(500),
            retry_after_secs: None,
            message: "server error".to_string(),
        })]);
        let ledger = LedgerStore::open_in_memory().await.unwrap();
        ledger
            .with_transaction(|tx| {
                Box::pin(async move {
                    LedgerStore::set_sync_state(tx, sync_keys::GMAIL_HISTORY_ID, "1", Utc::now()).await
                })
            })
            .await
            .unwrap();

        let config = PollerConfig {
            max_results: 100,
            max_attempts_per_call: 1,
        };
        let provider = Arc::new(provider);
        let p = EmailPoller::new(provider.clone(), ledger, config).with_sleeper(Arc::new(NoopSleeper));

        for _ in 0..5 {
            let _ = p.poll_once(Utc::now()).await;
        }
        assert_eq!(p.circuit_state().await, CircuitState::Open);

        let calls_before = provider.calls.load(Ordering::SeqCst);
        let err = p.poll_once(Utc::now()).await.unwrap_err();
        assert_eq!(err.message, "Circuit breaker is open");
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn token_bucket_throttles_to_its_capacity_then_refills() {
        let bucket = TokenBucket::new(1.0, 1000.0);
        let sleeper = NoopSleeper;
        bucket.acquire(&sleeper).await;
        bucket.acquire(&sleeper).await;
    }
}
