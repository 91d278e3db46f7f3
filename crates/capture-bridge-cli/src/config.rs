//! `CoreConfig` (spec §10.4): loaded from a TOML file, then overridden
//! by `CAPTURE_BRIDGE_*` environment variables — the same two-layer
//! shape `shipper-config` uses for `.shipper.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file name, analogous to `shipper-config`'s
/// `.shipper.toml`.
pub const CONFIG_FILE: &str = ".capture-bridge.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub root: PathBuf,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./vault"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./vault/.capture-bridge/ledger.sqlite"),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_results() -> u32 {
    100
}

fn default_rate_limit_capacity() -> f64 {
    10.0
}

fn default_rate_limit_refill_per_sec() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: f64,
    #[serde(default = "default_rate_limit_refill_per_sec")]
    pub rate_limit_refill_per_sec: f64,
    pub credentials_path: Option<PathBuf>,
    pub token_path: Option<PathBuf>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: default_poll_interval(),
            max_results: default_max_results(),
            rate_limit_capacity: default_rate_limit_capacity(),
            rate_limit_refill_per_sec: default_rate_limit_refill_per_sec(),
            credentials_path: None,
            token_path: None,
        }
    }
}

fn default_backup_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_retention() -> usize {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(with = "humantime_serde", default = "default_backup_interval")]
    pub interval: Duration,
    #[serde(default = "default_retention")]
    pub daily_retention: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval: default_backup_interval(),
            daily_retention: default_retention(),
        }
    }
}

/// Load from `path` if it exists, falling back to defaults, then apply
/// `CAPTURE_BRIDGE_*` environment overrides.
pub fn load(path: &Path) -> Result<CoreConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
        CoreConfig::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut CoreConfig) {
    if let Ok(v) = std::env::var("CAPTURE_BRIDGE_VAULT_ROOT") {
        config.vault.root = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("CAPTURE_BRIDGE_LEDGER_PATH") {
        config.ledger.path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("CAPTURE_BRIDGE_EMAIL_ENABLED") {
        config.email.enabled = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Ok(v) = std::env::var("CAPTURE_BRIDGE_EMAIL_POLL_INTERVAL") {
        if let Ok(d) = humantime::parse_duration(&v) {
            config.email.poll_interval = d;
        }
    }
    if let Ok(v) = std::env::var("CAPTURE_BRIDGE_EMAIL_CREDENTIALS_PATH") {
        config.email.credentials_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("CAPTURE_BRIDGE_EMAIL_TOKEN_PATH") {
        config.email.token_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("CAPTURE_BRIDGE_BACKUP_INTERVAL") {
        if let Ok(d) = humantime::parse_duration(&v) {
            config.backup.interval = d;
        }
    }
    if let Ok(v) = std::env::var("CAPTURE_BRIDGE_BACKUP_DAILY_RETENTION") {
        if let Ok(n) = v.parse() {
            config.backup.daily_retention = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "CAPTURE_BRIDGE_VAULT_ROOT",
            "CAPTURE_BRIDGE_LEDGER_PATH",
            "CAPTURE_BRIDGE_EMAIL_ENABLED",
            "CAPTURE_BRIDGE_EMAIL_POLL_INTERVAL",
            "CAPTURE_BRIDGE_EMAIL_CREDENTIALS_PATH",
            "CAPTURE_BRIDGE_EMAIL_TOKEN_PATH",
            "CAPTURE_BRIDGE_BACKUP_INTERVAL",
            "CAPTURE_BRIDGE_BACKUP_DAILY_RETENTION",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn missing_file_yields_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.email.max_results, 100);
        assert!(!config.email.enabled);
    }

    #[test]
    #[serial]
    fn toml_file_is_parsed() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[vault]
root = "/srv/vault"

[email]
enabled = true
poll_interval = "30s"
max_results = 25
credentials_path = "/etc/capture-bridge/credentials.json"
token_path = "/etc/capture-bridge/token.json"

[backup]
interval = "2h"
daily_retention = 14
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.vault.root, PathBuf::from("/srv/vault"));
        assert!(config.email.enabled);
        assert_eq!(config.email.poll_interval, Duration::from_secs(30));
        assert_eq!(config.email.max_results, 25);
        assert_eq!(config.backup.interval, Duration::from_secs(2 * 3600));
        assert_eq!(config.backup.daily_retention, 14);
    }

    #[test]
    #[serial]
    fn env_overrides_take_precedence_over_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[vault]\nroot = \"/from/file\"\n").unwrap();
        std::env::set_var("CAPTURE_BRIDGE_VAULT_ROOT", "/from/env");

        let config = load(&path).unwrap();
        assert_eq!(config.vault.root, PathBuf::from("/from/env"));
        clear_env();
    }
}
