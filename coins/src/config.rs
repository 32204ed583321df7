//! # Configuration & Constants
//!
//! Fixed limits of the coin model live here as constants. The denomination
//! chain itself is data: a JSON document loaded at startup and turned into a
//! validated [`DenominationTable`].
//!
//! ```json
//! {
//!   "coin_types": {
//!     "copper": { "enabled": true, "value": 1, "item_id": "Coin_Copper", "display_name": "Copper" },
//!     "iron":   { "enabled": true, "value": 10 }
//!   }
//! }
//! ```
//!
//! Tier values must not be renumbered while wallets hold coins of those
//! tiers; the loader cannot detect that, only the chain rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::denomination::{Denomination, DenominationTable, TableError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Largest quantity a single slot may hold.
pub const MAX_STACK: u32 = 999;

/// Upper bound on the number of destination coins a single exchange may
/// produce. Anything larger is treated as a pathological request.
pub const EXCHANGE_RESULT_CEILING: u64 = 10_000_000;

/// How often idle identity locks are swept.
pub const LOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long terminal transaction records are kept before eviction.
pub const RECORD_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Entries kept in the in-memory ledger's audit journal; older ones are
/// dropped first.
pub const LEDGER_JOURNAL_LIMIT: usize = 10_000;

/// File name used when a host is pointed at a directory.
pub const DEFAULT_CONFIG_FILE: &str = "coins.json";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from loading or saving the coin config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the file failed.
    #[error("config io error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid config JSON.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The enabled tiers do not form a valid chain.
    #[error("invalid denomination chain: {0}")]
    Table(#[from] TableError),
}

// ---------------------------------------------------------------------------
// CoinConfig
// ---------------------------------------------------------------------------

/// One entry under `coin_types`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinTypeConfig {
    /// Disabled tiers are ignored entirely.
    pub enabled: bool,
    /// Worth in base units.
    pub value: u64,
    /// Item id; defaults to `Coin_<Name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Player-facing name; defaults to the capitalized key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl CoinTypeConfig {
    fn standard(value: u64, item_id: &str, display_name: &str) -> Self {
        Self {
            enabled: true,
            value,
            item_id: Some(item_id.to_string()),
            display_name: Some(display_name.to_string()),
        }
    }
}

/// The on-disk coin configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinConfig {
    /// Tiers keyed by lowercase name.
    pub coin_types: BTreeMap<String, CoinTypeConfig>,
}

impl Default for CoinConfig {
    fn default() -> Self {
        let mut coin_types = BTreeMap::new();
        coin_types.insert("copper".into(), CoinTypeConfig::standard(1, "Coin_Copper", "Copper"));
        coin_types.insert("iron".into(), CoinTypeConfig::standard(10, "Coin_Iron", "Iron"));
        coin_types.insert("cobalt".into(), CoinTypeConfig::standard(100, "Coin_Cobalt", "Cobalt"));
        coin_types.insert("gold".into(), CoinTypeConfig::standard(1_000, "Coin_Gold", "Gold"));
        coin_types.insert(
            "mithril".into(),
            CoinTypeConfig::standard(10_000, "Coin_Mithril", "Mithril"),
        );
        coin_types.insert(
            "adamantite".into(),
            CoinTypeConfig::standard(100_000, "Coin_Adamantite", "Adamantite"),
        );
        Self { coin_types }
    }
}

impl CoinConfig {
    /// Parses a config document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Pretty-printed JSON for writing to disk.
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reads the config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), tiers = config.coin_types.len(), "coin config loaded");
        Ok(config)
    }

    /// Reads the config at `path`, writing the default first if the file
    /// does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        tracing::info!(path = %path.display(), "created default coin config");
        Ok(config)
    }

    /// Writes the config to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, self.to_json_pretty()?).map_err(io_err)
    }

    /// Builds the validated table from the enabled tiers.
    pub fn table(&self) -> Result<DenominationTable, ConfigError> {
        let tiers = self
            .coin_types
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(name, c)| {
                let display = c.display_name.clone().unwrap_or_else(|| capitalize(name));
                let item_id = c
                    .item_id
                    .clone()
                    .unwrap_or_else(|| format!("Coin_{}", capitalize(name)));
                Denomination::new(item_id, name.to_lowercase(), c.value, display)
            })
            .collect();
        Ok(DenominationTable::new(tiers)?)
    }
}

fn capitalize(s: &str) -> String {
    let lower = s.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
