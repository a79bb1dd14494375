use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "pool_config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown share validation policy '{0}' (expected 'legacy' or 'hardened')")]
    UnknownValidation(String),

    #[error("invalid version rolling mask '{0}'")]
    InvalidMask(String),

    #[error("work field `{field}` is not valid hex: {value}")]
    InvalidWorkHex { field: &'static str, value: String },

    #[error("work field `{field}` must be {expected} bytes, got {actual}")]
    InvalidWorkLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// How `mining.submit` is judged once a session is authorized.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShareValidation {
    /// Accept every well-formed submission.
    #[default]
    Legacy,
    /// Reject stale jobs, duplicates and shares below the session target.
    Hardened,
}

impl FromStr for ShareValidation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "legacy" => Ok(ShareValidation::Legacy),
            "hardened" | "strict" => Ok(ShareValidation::Hardened),
            other => Err(ConfigError::UnknownValidation(other.to_string())),
        }
    }
}

/// Static block header parts handed out in every job.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct WorkConfig {
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branch: Vec<String>,
    pub version: String,
    pub bits: String,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            prev_hash: "4d16b6f85af6e2198f44ae2c6de6f97683df4f0e6154a6fcdc75e47b14501234".to_string(),
            coinbase1: "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff2503233708184d696e656420627920416e74506f6f6c373946205b8160a4256b0000946e0100ffffffff".to_string(),
            coinbase2: "02f90295814a000000001976a914389ffce9cd9ae88dcc0631e88a821ffdbe9bfe2615884c000000001976a9147c154ed1dc59609e3d26abb2df2ea3d587cd8c4188ac00000000".to_string(),
            merkle_branch: vec![
                "c91c2c30137006ea66c3d0b8104a51cc8cd36fb8e7e26bb918bf2d214c2424ac".to_string(),
                "0e3e2357e806b6cdb1f70b54c3a3a17b6714ee1f0e68bebb44a74b1efd512098".to_string(),
            ],
            version: "20000000".to_string(),
            bits: "1703a30c".to_string(),
        }
    }
}

impl WorkConfig {
    /// Reject header parts that could never produce a valid 80-byte header.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_hex("prev_hash", &self.prev_hash, Some(32))?;
        check_hex("coinbase1", &self.coinbase1, None)?;
        check_hex("coinbase2", &self.coinbase2, None)?;
        for branch in &self.merkle_branch {
            check_hex("merkle_branch", branch, Some(32))?;
        }
        check_hex("version", &self.version, Some(4))?;
        check_hex("bits", &self.bits, Some(4))?;
        Ok(())
    }
}

fn check_hex(field: &'static str, value: &str, len: Option<usize>) -> Result<(), ConfigError> {
    let bytes = hex::decode(value).map_err(|_| ConfigError::InvalidWorkHex {
        field,
        value: value.to_string(),
    })?;
    match len {
        Some(expected) if bytes.len() != expected => Err(ConfigError::InvalidWorkLength {
            field,
            expected,
            actual: bytes.len(),
        }),
        _ => Ok(()),
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    /// Operator HTTP API (`/health`, `/metrics`, `/stats`). Empty disables it.
    pub api_listen: String,
    pub difficulty: f64,
    /// Seconds between periodic job rotations.
    pub notify_secs: u64,
    /// Drop connections that send nothing for this long. 0 disables.
    pub idle_timeout_secs: u64,
    pub max_connections: usize,
    pub extranonce2_size: usize,
    pub version_rolling_mask: String,
    pub share_validation: ShareValidation,
    /// Number of recent jobs that still accept submissions.
    pub job_history: usize,
    pub work: WorkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3333".to_string(),
            api_listen: "0.0.0.0:8080".to_string(),
            difficulty: 1.0,
            notify_secs: 30,
            idle_timeout_secs: 600,
            max_connections: 10_000,
            extranonce2_size: 8,
            version_rolling_mask: "ffffffff".to_string(),
            share_validation: ShareValidation::Legacy,
            job_history: 64,
            work: WorkConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then `pool_config.json` (or `SYNC_POOL_CONFIG`), then env overrides.
    pub fn load() -> Self {
        let path = std::env::var("SYNC_POOL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let mut cfg = if Path::new(&path).exists() {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!("Loaded pool config from {}", path);
                    cfg
                }
                Err(e) => {
                    tracing::warn!("Ignoring {}: {:#}", path, e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        cfg.apply_env();
        cfg.normalize();
        cfg
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let txt = std::fs::read_to_string(path.as_ref())?;
        let cfg: Config = serde_json::from_str(&txt)?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(l) = std::env::var("SYNC_POOL_LISTEN") { self.listen = l; }
        if let Ok(a) = std::env::var("SYNC_POOL_API") { self.api_listen = a; }
        if let Some(d) = env_parse("SYNC_POOL_DIFFICULTY") { self.difficulty = d; }
        if let Some(n) = env_parse("SYNC_NOTIFY_SECS") { self.notify_secs = n; }
        if let Some(t) = env_parse("SYNC_IDLE_TIMEOUT") { self.idle_timeout_secs = t; }
        if let Some(m) = env_parse("SYNC_MAX_CONNECTIONS") { self.max_connections = m; }
        if let Some(s) = env_parse("SYNC_EXTRANONCE2_SIZE") { self.extranonce2_size = s; }
        if let Ok(m) = std::env::var("SYNC_VERSION_ROLLING_MASK") { self.version_rolling_mask = m; }
        if let Some(v) = env_parse("SYNC_SHARE_VALIDATION") { self.share_validation = v; }
    }

    fn normalize(&mut self) {
        if !self.difficulty.is_finite() || self.difficulty <= 0.0 {
            tracing::warn!("difficulty {} is not usable, falling back to 1", self.difficulty);
            self.difficulty = 1.0;
        }
        if self.notify_secs == 0 {
            self.notify_secs = 30;
        }
        if self.max_connections == 0 {
            self.max_connections = 10_000;
        }
        if !(1..=16).contains(&self.extranonce2_size) {
            tracing::warn!("extranonce2_size {} out of range, using 8", self.extranonce2_size);
            self.extranonce2_size = 8;
        }
        if self.job_history == 0 {
            self.job_history = 64;
        }
        if parse_mask(&self.version_rolling_mask).is_err() {
            tracing::warn!("version_rolling_mask '{}' is not hex, using ffffffff", self.version_rolling_mask);
            self.version_rolling_mask = "ffffffff".to_string();
        }
    }

    pub fn version_rolling_mask(&self) -> u32 {
        parse_mask(&self.version_rolling_mask).unwrap_or(u32::MAX)
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_secs(self.notify_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

pub fn parse_mask(mask: &str) -> Result<u32, ConfigError> {
    let trimmed = mask.trim().trim_start_matches("0x");
    if trimmed.is_empty() || trimmed.len() > 8 {
        return Err(ConfigError::InvalidMask(mask.to_string()));
    }
    u32::from_str_radix(trimmed, 16).map_err(|_| ConfigError::InvalidMask(mask.to_string()))
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring {}={} (unparseable)", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.listen, "0.0.0.0:3333");
        assert_eq!(cfg.difficulty, 1.0);
        assert_eq!(cfg.notify_secs, 30);
        assert_eq!(cfg.extranonce2_size, 8);
        assert_eq!(cfg.share_validation, ShareValidation::Legacy);
        assert_eq!(cfg.version_rolling_mask(), 0xffff_ffff);
        assert!(cfg.work.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"listen": "127.0.0.1:4444", "share_validation": "hardened", "work": {"bits": "1d00ffff"}}"#,
        )
        .unwrap();

        assert_eq!(cfg.listen, "127.0.0.1:4444");
        assert_eq!(cfg.share_validation, ShareValidation::Hardened);
        assert_eq!(cfg.work.bits, "1d00ffff");
        assert_eq!(cfg.work.version, "20000000");
        assert_eq!(cfg.notify_secs, 30);
    }

    #[test]
    fn test_share_validation_parsing() {
        assert_eq!("legacy".parse::<ShareValidation>().unwrap(), ShareValidation::Legacy);
        assert_eq!("Hardened".parse::<ShareValidation>().unwrap(), ShareValidation::Hardened);
        assert!("paranoid".parse::<ShareValidation>().is_err());
    }

    #[test]
    fn test_normalize_repairs_bad_values() {
        let mut cfg = Config {
            difficulty: -3.0,
            notify_secs: 0,
            extranonce2_size: 0,
            version_rolling_mask: "zz".to_string(),
            ..Config::default()
        };
        cfg.normalize();

        assert_eq!(cfg.difficulty, 1.0);
        assert_eq!(cfg.notify_secs, 30);
        assert_eq!(cfg.extranonce2_size, 8);
        assert_eq!(cfg.version_rolling_mask(), u32::MAX);
    }

    #[test]
    fn test_mask_parsing() {
        assert_eq!(parse_mask("1fffe000").unwrap(), 0x1fff_e000);
        assert_eq!(parse_mask("0x1fffe000").unwrap(), 0x1fff_e000);
        assert!(parse_mask("").is_err());
        assert!(parse_mask("123456789").is_err());
    }

    #[test]
    fn test_work_validation_rejects_short_prev_hash() {
        let work = WorkConfig {
            prev_hash: "abcd".to_string(),
            ..WorkConfig::default()
        };
        assert!(matches!(
            work.validate(),
            Err(ConfigError::InvalidWorkLength { field: "prev_hash", .. })
        ));
    }
}
