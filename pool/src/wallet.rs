/// Device address helper
///
/// Deterministic addresses for mining devices and a small JSON wallet file
/// that records them. The Stratum engine never calls into this module; miners
/// simply present the address as their worker name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_DEVICE: &str = "Bitaxe001";
pub const DEFAULT_NETWORK: &str = "testnet";
const WALLET_DIR: &str = ".sync-testnet";
const WALLET_FILE: &str = "wallet.json";

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wallet file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not determine home directory")]
    NoHomeDir,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletEntry {
    pub address: String,
    pub balance: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub multiplier: f64,
}

impl WalletEntry {
    pub fn bitaxe(address: &str) -> Self {
        Self { address: address.to_string(), balance: 0, kind: "bitaxe".to_string(), multiplier: 2.0 }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WalletFile {
    #[serde(default)]
    pub addresses: BTreeMap<String, WalletEntry>,
    /// Anything else already in the file is written back untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `sha256("SYNC:BITAXE:{device}:{network}")`, first 16 hex digits, network prefix.
pub fn generate_address(device_label: &str, network: &str) -> String {
    let seed = format!("SYNC:BITAXE:{}:{}", device_label, network);
    let digest = hex::encode(Sha256::digest(seed.as_bytes()));
    let prefix = if network == "testnet" { "tsync1q" } else { "sync1q" };
    format!("{}{}", prefix, &digest[..16])
}

/// `~/.sync-testnet`
pub fn default_wallet_dir() -> Result<PathBuf, WalletError> {
    dirs::home_dir().map(|home| home.join(WALLET_DIR)).ok_or(WalletError::NoHomeDir)
}

/// Upsert `device_label` into `dir/wallet.json`, creating both if needed.
pub fn persist_address(dir: &Path, device_label: &str, address: &str) -> Result<PathBuf, WalletError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(WALLET_FILE);

    let mut wallet: WalletFile = if path.exists() {
        serde_json::from_str(&std::fs::read_to_string(&path)?)?
    } else {
        WalletFile::default()
    };

    wallet.addresses.insert(device_label.to_string(), WalletEntry::bitaxe(address));
    std::fs::write(&path, serde_json::to_string_pretty(&wallet)?)?;

    tracing::debug!("Saved {} for {} to {}", address, device_label, path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_address() {
        assert_eq!(generate_address("Bitaxe001", "testnet"), "tsync1q823e23e56e270960");
        assert_eq!(generate_address("Bitaxe001", "mainnet"), "sync1q4cd796eb4f1af801");
        assert_eq!(generate_address("Bitaxe001", "testnet"), generate_address("Bitaxe001", "testnet"));
        assert_ne!(generate_address("Bitaxe002", "testnet"), generate_address("Bitaxe001", "testnet"));
    }

    #[test]
    fn test_persist_creates_and_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let wallet_dir = dir.path().join("nested");

        let path = persist_address(&wallet_dir, "Bitaxe001", "tsync1qaaaa").unwrap();
        assert_eq!(path, wallet_dir.join("wallet.json"));

        persist_address(&wallet_dir, "Bitaxe002", "tsync1qbbbb").unwrap();
        persist_address(&wallet_dir, "Bitaxe001", "tsync1qcccc").unwrap();

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let addresses = saved["addresses"].as_object().unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(
            saved["addresses"]["Bitaxe001"],
            serde_json::json!({"address": "tsync1qcccc", "balance": 0, "type": "bitaxe", "multiplier": 2.0})
        );
    }

    #[test]
    fn test_persist_keeps_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wallet.json"), r#"{"addresses": {}, "label": "lab"}"#).unwrap();

        let path = persist_address(dir.path(), "Bitaxe001", "tsync1qaaaa").unwrap();
        let saved: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(saved["label"], "lab");
        assert_eq!(saved["addresses"]["Bitaxe001"]["address"], "tsync1qaaaa");
    }

    #[test]
    fn test_persist_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wallet.json"), "not json").unwrap();
        assert!(matches!(
            persist_address(dir.path(), "Bitaxe001", "tsync1qaaaa"),
            Err(WalletError::Json(_))
        ));
    }
}
