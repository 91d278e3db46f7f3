//! Token refresh (spec §6): the OAuth *authorization* user flow is out
//! of scope, but refreshing an expiring access token against the
//! provider's `token_uri` is not — the core must keep polling without a
//! human re-authorizing every hour.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use capture_bridge_ledger::LedgerStore;
use capture_bridge_types::{sync_keys, CoreError, ErrorCode, GmailCredentials, TokenFile};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

const AUTH_FAILURE_LIMIT: i64 = 5;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    scope: String,
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// POST a refresh-token grant to `credentials.installed.token_uri`.
/// Preserves the existing `refresh_token` unless the provider issues a
/// new one.
pub async fn refresh_access_token(
    client: &Client,
    credentials: &GmailCredentials,
    token: &TokenFile,
    now: DateTime<Utc>,
) -> Result<TokenFile, CoreError> {
    let inner = &credentials.installed;
    let resp = client
        .post(&inner.token_uri)
        .form(&[
            ("client_id", inner.client_id.as_str()),
            ("client_secret", inner.client_secret.as_str()),
            ("refresh_token", token.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await
        .map_err(|e| CoreError::new(ErrorCode::Enetdown, e.to_string(), true))?;

    if !resp.status().is_success() {
        let status = resp.status();
        return Err(CoreError::new(
            ErrorCode::AuthInvalidGrant,
            format!("token refresh rejected with status {status}"),
            false,
        ));
    }

    let body: TokenResponse = resp
        .json()
        .await
        .map_err(|e| CoreError::new(ErrorCode::FileParseError, e.to_string(), false))?;

    let refreshed = TokenFile {
        access_token: body.access_token,
        refresh_token: body.refresh_token.unwrap_or_else(|| token.refresh_token.clone()),
        expiry_date: now.timestamp_millis() + body.expires_in * 1000,
        scope: body.scope,
        token_type: body.token_type,
    };

    if !refreshed.has_readonly_scope() {
        return Err(CoreError::new(
            ErrorCode::AuthInvalidGrant,
            "refreshed token dropped the gmail.readonly scope",
            false,
        ));
    }

    Ok(refreshed)
}

/// Temp-then-rename write with mode `0600`, mirroring
/// `capture_bridge_vault::write_atomic` for a file that lives outside
/// the vault tree.
fn write_token_file(path: &Path, token: &TokenFile) -> Result<(), CoreError> {
    let payload = serde_json::to_vec_pretty(token)
        .map_err(|e| CoreError::new(ErrorCode::FileParseError, e.to_string(), false))?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| CoreError::new(ErrorCode::Eacces, e.to_string(), true))?;

    let temp_path = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("token"),
        std::process::id()
    ));

    let write_result = (|| -> Result<(), CoreError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .map_err(|e| CoreError::new(ErrorCode::Eacces, e.to_string(), true))?;
        file.write_all(&payload)
            .map_err(|e| CoreError::new(ErrorCode::Eacces, e.to_string(), true))?;
        file.sync_all().map_err(|e| CoreError::new(ErrorCode::Eacces, e.to_string(), true))
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        CoreError::new(ErrorCode::Eacces, e.to_string(), true)
    })?;

    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Load the cached token, refreshing it against the provider if it's
/// within 300s of expiry. Tracks `sync_state['gmail_auth_failures']`
/// (spec §6): a successful refresh resets it to 0, a failure increments
/// it, and at >= 5 this refuses to even attempt a refresh.
pub async fn ensure_fresh_token(
    client: &Client,
    ledger: &LedgerStore,
    credentials_path: &Path,
    token_path: &Path,
    now: DateTime<Utc>,
) -> Result<TokenFile, CoreError> {
    let raw = fs::read_to_string(token_path)
        .map_err(|e| CoreError::new(ErrorCode::FilePermissionError, e.to_string(), true))?;
    let token: TokenFile = serde_json::from_str(&raw)
        .map_err(|e| CoreError::new(ErrorCode::FileParseError, e.to_string(), false))?;

    if !token.is_expired(now.timestamp_millis()) {
        return Ok(token);
    }

    let failures: i64 = ledger
        .get_sync_state(sync_keys::GMAIL_AUTH_FAILURES)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if failures >= AUTH_FAILURE_LIMIT {
        return Err(CoreError::new(
            ErrorCode::AuthMaxFailures,
            "gmail auth has failed repeatedly; run diagnostics before retrying",
            false,
        ));
    }

    let creds_raw = fs::read_to_string(credentials_path)
        .map_err(|e| CoreError::new(ErrorCode::FilePermissionError, e.to_string(), true))?;
    let credentials = GmailCredentials::parse(&creds_raw)?;

    match refresh_access_token(client, &credentials, &token, now).await {
        Ok(refreshed) => {
            write_token_file(token_path, &refreshed)?;
            let now_copy = now;
            ledger
                .with_transaction(move |tx| {
                    Box::pin(async move {
                        LedgerStore::set_sync_state(tx, sync_keys::GMAIL_AUTH_FAILURES, "0", now_copy).await?;
                        LedgerStore::set_sync_state(
                            tx,
                            sync_keys::LAST_GMAIL_AUTH,
                            &now_copy.to_rfc3339(),
                            now_copy,
                        )
                        .await
                    })
                })
                .await?;
            Ok(refreshed)
        }
        Err(err) => {
            let next = failures + 1;
            let now_copy = now;
            ledger
                .with_transaction(move |tx| {
                    Box::pin(async move {
                        LedgerStore::set_sync_state(
                            tx,
                            sync_keys::GMAIL_AUTH_FAILURES,
                            &next.to_string(),
                            now_copy,
                        )
                        .await
                    })
                })
                .await?;
            ledger
                .log_error("gmail_auth", None, &err.message, Some("token refresh"))
                .await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sample_credentials() -> GmailCredentials {
        GmailCredentials::parse(
            r#"{"installed":{"client_id":"id","client_secret":"secret","redirect_uris":["urn:ietf:wg:oauth:2.0:oob"],"auth_uri":"https://accounts.google.com/o/oauth2/auth","token_uri":"http://PLACEHOLDER/token"}}"#,
        )
        .unwrap()
    }

    fn sample_token(expiry_date: i64, scope: &str) -> TokenFile {
        TokenFile {
            access_token: "old-access".to_string(),
            refresh_token: "refresh-tok".to_string(),
            expiry_date,
            scope: scope.to_string(),
            token_type: "Bearer".to_string(),
        }
    }

    fn run_fixture(response_body: &'static str, status: u16) -> (String, thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_string();
        let handle = thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let response = tiny_http::Response::from_string(response_body)
                    .with_status_code(status)
                    .with_header(
                        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
                    );
                let _ = request.respond(response);
            }
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn refresh_parses_new_access_token_and_keeps_refresh_token() {
        let (base_url, handle) = run_fixture(
            r#"{"access_token":"new-access","expires_in":3600,"scope":"gmail.readonly","token_type":"Bearer"}"#,
            200,
        );
        let mut credentials = sample_credentials();
        credentials.installed.token_uri = format!("{base_url}/token");
        let token = sample_token(0, "gmail.readonly");
        let client = Client::new();
        let now = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z").unwrap().with_timezone(&Utc);

        let refreshed = refresh_access_token(&client, &credentials, &token, now).await.unwrap();

        assert_eq!(refreshed.access_token, "new-access");
        assert_eq!(refreshed.refresh_token, "refresh-tok");
        assert_eq!(refreshed.expiry_date, now.timestamp_millis() + 3_600_000);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn refresh_without_readonly_scope_is_rejected() {
        let (base_url, handle) = run_fixture(
            r#"{"access_token":"new-access","expires_in":3600,"scope":"https://www.googleapis.com/auth/other","token_type":"Bearer"}"#,
            200,
        );
        let mut credentials = sample_credentials();
        credentials.installed.token_uri = format!("{base_url}/token");
        let token = sample_token(0, "gmail.readonly");
        let client = Client::new();
        let now = Utc::now();

        let err = refresh_access_token(&client, &credentials, &token, now).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthInvalidGrant);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn non_success_status_becomes_invalid_grant() {
        let (base_url, handle) = run_fixture(r#"{"error":"invalid_grant"}"#, 400);
        let mut credentials = sample_credentials();
        credentials.installed.token_uri = format!("{base_url}/token");
        let token = sample_token(0, "gmail.readonly");
        let client = Client::new();

        let err = refresh_access_token(&client, &credentials, &token, Utc::now()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthInvalidGrant);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn ensure_fresh_token_returns_unexpired_token_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token.json");
        let far_future = Utc::now().timestamp_millis() + 3_600_000;
        let token = sample_token(far_future, "gmail.readonly");
        std::fs::write(&token_path, serde_json::to_string(&token).unwrap()).unwrap();

        let ledger = LedgerStore::open_in_memory().await.unwrap();
        let client = Client::new();

        let result = ensure_fresh_token(
            &client,
            &ledger,
            &dir.path().join("credentials.json"),
            &token_path,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(result.access_token, "old-access");
    }

    #[tokio::test]
    async fn ensure_fresh_token_refuses_after_five_failures() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token.json");
        let expired = sample_token(0, "gmail.readonly");
        std::fs::write(&token_path, serde_json::to_string(&expired).unwrap()).unwrap();
        std::fs::write(dir.path().join("credentials.json"), "{}").unwrap();

        let ledger = LedgerStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        ledger
            .with_transaction(move |tx| {
                Box::pin(async move {
                    LedgerStore::set_sync_state(tx, sync_keys::GMAIL_AUTH_FAILURES, "5", now).await
                })
            })
            .await
            .unwrap();

        let client = Client::new();
        let err = ensure_fresh_token(
            &client,
            &ledger,
            &dir.path().join("credentials.json"),
            &token_path,
            now,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthMaxFailures);
    }
}
