// Copyright (c) 2024 The Botho Foundation

//! Bridge configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    chains::{Chain, ChainAddress, TransferDirection},
    error::BridgeError,
};

/// Main bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Zilliqa connection configuration
    pub zilliqa: ChainConfig,

    /// Ethereum connection configuration
    pub ethereum: ChainConfig,

    /// TradeHub (relay chain) connection configuration
    pub tradehub: ChainConfig,

    /// Relay-chain custody settings
    pub relay: RelaySettings,

    /// Bridge-specific settings
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// Assets that may be bridged
    #[serde(default = "default_assets")]
    pub assets: Vec<AssetConfig>,
}

/// Connection and policy settings for one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC URL of the chain's bridge gateway
    pub rpc_url: String,

    /// Account the bridge broadcasts withdrawals from
    pub operator_address: String,

    /// Number of confirmations required before a leg counts as final
    pub confirmations_required: u64,

    /// How often to poll for confirmations
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Gas price in the chain's smallest unit
    #[serde(default)]
    pub gas_price: u64,

    /// Gas limit per transaction
    #[serde(default)]
    pub gas_limit: u64,
}

impl ChainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Custody and fee accounts on the relay chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Address holding bridged value on TradeHub
    pub custody_address: String,

    /// Address collecting bridge fees on TradeHub
    pub fee_address: String,
}

/// Bridge-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Path to SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Bridge fee in basis points (100 = 1%)
    #[serde(default = "default_fee_bps")]
    pub fee_bps: u32,

    /// Minimum bridge fee in base units
    #[serde(default)]
    pub min_fee: u64,

    /// Transfers without forward progress for this long are expired
    #[serde(default = "default_expiry")]
    pub expiry_minutes: i64,

    /// Consecutive adapter failures before a leg is reported degraded
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timeout applied to every adapter call
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// How long to look for an ambiguous submission before resubmitting
    #[serde(default = "default_submission_grace")]
    pub submission_grace_secs: u64,

    /// Interval of the expiry/resume sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// First retry delay after an adapter error
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    /// Upper bound on the retry delay
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
}

/// An asset that may be bridged and the directions it supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Asset symbol, matched case-insensitively
    pub symbol: String,

    /// Directions this asset may move in
    pub directions: Vec<TransferDirection>,

    /// Smallest accepted amount in base units
    #[serde(default = "default_min_amount")]
    pub min_amount: u64,
}

fn default_poll_interval_ms() -> u64 {
    15_000
}

fn default_db_path() -> String {
    "bridge.db".to_string()
}

fn default_fee_bps() -> u32 {
    10 // 0.1%
}

fn default_expiry() -> i64 {
    24 * 60
}

fn default_max_retries() -> u32 {
    5
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_submission_grace() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_backoff_initial() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    120
}

/// Longest accepted expiry window: one year.
const MAX_EXPIRY_MINUTES: i64 = 365 * 24 * 60;

/// Longest accepted submission grace: one week.
const MAX_SUBMISSION_GRACE_SECS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted timeout, sweep or retry interval: one day.
const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

fn default_min_amount() -> u64 {
    1
}

fn default_assets() -> Vec<AssetConfig> {
    let both = vec![TransferDirection::ZilToEth, TransferDirection::EthToZil];
    ["ZIL", "ETH", "ZWAP", "USDT"]
        .into_iter()
        .map(|symbol| AssetConfig {
            symbol: symbol.to_string(),
            directions: both.clone(),
            min_amount: default_min_amount(),
        })
        .collect()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            fee_bps: default_fee_bps(),
            min_fee: 0,
            expiry_minutes: default_expiry(),
            max_retries: default_max_retries(),
            rpc_timeout_secs: default_rpc_timeout(),
            submission_grace_secs: default_submission_grace(),
            sweep_interval_secs: default_sweep_interval(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_secs: default_backoff_max(),
        }
    }
}

impl BridgeSettings {
    pub fn expiry_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.expiry_minutes.clamp(0, MAX_EXPIRY_MINUTES))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn submission_grace(&self) -> chrono::Duration {
        let secs = self.submission_grace_secs.min(MAX_SUBMISSION_GRACE_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

impl BridgeSettings {
    /// Reject zero intervals and windows too large to represent.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.expiry_minutes <= 0 || self.expiry_minutes > MAX_EXPIRY_MINUTES {
            return Err(BridgeError::Config(format!(
                "expiry_minutes must be between 1 and {}",
                MAX_EXPIRY_MINUTES
            )));
        }
        if self.submission_grace_secs == 0
            || self.submission_grace_secs > MAX_SUBMISSION_GRACE_SECS
        {
            return Err(BridgeError::Config(format!(
                "submission_grace_secs must be between 1 and {}",
                MAX_SUBMISSION_GRACE_SECS
            )));
        }

        for (name, value, max) in [
            ("rpc_timeout_secs", self.rpc_timeout_secs, MAX_INTERVAL_SECS),
            ("sweep_interval_secs", self.sweep_interval_secs, MAX_INTERVAL_SECS),
            ("backoff_initial_ms", self.backoff_initial_ms, MAX_INTERVAL_SECS * 1_000),
            ("backoff_max_secs", self.backoff_max_secs, MAX_INTERVAL_SECS),
        ] {
            if value == 0 || value > max {
                return Err(BridgeError::Config(format!(
                    "{} must be between 1 and {}",
                    name, max
                )));
            }
        }
        if self.max_retries == 0 {
            return Err(BridgeError::Config(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.backoff_initial() > self.backoff_max() {
            return Err(BridgeError::Config(
                "backoff_initial_ms must not exceed backoff_max_secs".to_string(),
            ));
        }

        Ok(())
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("Failed to read config: {}", e)))?;
        let config: BridgeConfig = toml::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check addresses and thresholds.
    pub fn validate(&self) -> Result<(), BridgeError> {
        for chain in Chain::ALL {
            let chain_config = self.chain(chain);
            if chain_config.confirmations_required == 0 {
                return Err(BridgeError::Config(format!(
                    "{}: confirmations_required must be at least 1",
                    chain
                )));
            }
            if chain_config.poll_interval_ms == 0 {
                return Err(BridgeError::Config(format!(
                    "{}: poll_interval_ms must be positive",
                    chain
                )));
            }
            ChainAddress::new(chain, chain_config.operator_address.as_str())
                .validate()
                .map_err(|e| BridgeError::Config(format!("{} operator: {}", chain, e)))?;
        }

        for (name, address) in [
            ("custody_address", &self.relay.custody_address),
            ("fee_address", &self.relay.fee_address),
        ] {
            ChainAddress::new(Chain::TradeHub, address.as_str())
                .validate()
                .map_err(|e| BridgeError::Config(format!("relay {}: {}", name, e)))?;
        }

        self.bridge.validate()
    }

    /// Settings for a chain.
    pub fn chain(&self, chain: Chain) -> &ChainConfig {
        match chain {
            Chain::Zilliqa => &self.zilliqa,
            Chain::Ethereum => &self.ethereum,
            Chain::TradeHub => &self.tradehub,
        }
    }

    /// Look up an asset supported for the given direction.
    pub fn asset(&self, symbol: &str, direction: TransferDirection) -> Option<&AssetConfig> {
        self.assets
            .iter()
            .find(|a| a.symbol.eq_ignore_ascii_case(symbol) && a.directions.contains(&direction))
    }

    /// Calculate the bridge fee for an amount.
    pub fn calculate_fee(&self, amount: u128) -> u128 {
        let percentage_fee = amount.saturating_mul(self.bridge.fee_bps as u128) / 10_000;
        percentage_fee.max(self.bridge.min_fee as u128)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            zilliqa: ChainConfig {
                rpc_url: "http://localhost:4201".to_string(),
                operator_address: "zil1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr".to_string(),
                confirmations_required: 3,
                poll_interval_ms: 30_000,
                gas_price: 2_000_000_000,
                gas_limit: 25_000,
            },
            ethereum: ChainConfig {
                rpc_url: "http://localhost:8545".to_string(),
                operator_address: "0x0000000000000000000000000000000000000000".to_string(),
                confirmations_required: 12,
                poll_interval_ms: default_poll_interval_ms(),
                gas_price: 20_000_000_000,
                gas_limit: 250_000,
            },
            tradehub: ChainConfig {
                rpc_url: "http://localhost:5001".to_string(),
                operator_address: "swth1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr".to_string(),
                confirmations_required: 1,
                poll_interval_ms: 5_000,
                gas_price: 0,
                gas_limit: 0,
            },
            relay: RelaySettings {
                custody_address: "swth1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr".to_string(),
                fee_address: "swth1prv0t8j8tqcdngdmjlt59pwy6dxxmtqgycy2h7".to_string(),
            },
            bridge: BridgeSettings::default(),
            assets: default_assets(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_calculation() {
        let mut config = BridgeConfig::default();

        // 0.1% of 1_000_000
        assert_eq!(config.calculate_fee(1_000_000), 1_000);

        config.bridge.min_fee = 5_000;
        assert_eq!(config.calculate_fee(1_000_000), 5_000);
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bridge.fee_bps, 10);
        assert_eq!(config.zilliqa.gas_price, 2_000_000_000);
        assert_eq!(config.zilliqa.gas_limit, 25_000);
    }

    #[test]
    fn test_asset_lookup() {
        let mut config = BridgeConfig::default();
        config.assets.push(AssetConfig {
            symbol: "XSGD".to_string(),
            directions: vec![TransferDirection::EthToZil],
            min_amount: 100,
        });

        assert!(config.asset("zil", TransferDirection::ZilToEth).is_some());
        assert!(config.asset("XSGD", TransferDirection::EthToZil).is_some());
        assert!(config.asset("XSGD", TransferDirection::ZilToEth).is_none());
        assert!(config.asset("DOGE", TransferDirection::ZilToEth).is_none());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = BridgeConfig::default();
        config.tradehub.confirmations_required = 0;
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));

        let mut config = BridgeConfig::default();
        config.relay.custody_address = "0xnot-a-swth-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_and_unbounded_timing() {
        let zeroed: [fn(&mut BridgeSettings); 6] = [
            |b| b.sweep_interval_secs = 0,
            |b| b.rpc_timeout_secs = 0,
            |b| b.backoff_initial_ms = 0,
            |b| b.backoff_max_secs = 0,
            |b| b.submission_grace_secs = 0,
            |b| b.max_retries = 0,
        ];
        for zero in zeroed {
            let mut config = BridgeConfig::default();
            zero(&mut config.bridge);
            assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
        }

        let mut config = BridgeConfig::default();
        config.bridge.submission_grace_secs = u64::MAX;
        assert!(config.validate().is_err());
        // Accessors stay total on settings that were never validated
        assert_eq!(
            config.bridge.submission_grace(),
            chrono::Duration::seconds(MAX_SUBMISSION_GRACE_SECS as i64)
        );

        let mut config = BridgeConfig::default();
        config.bridge.expiry_minutes = i64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(
            config.bridge.expiry_window(),
            chrono::Duration::minutes(MAX_EXPIRY_MINUTES)
        );

        let mut config = BridgeConfig::default();
        config.bridge.sweep_interval_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.bridge.backoff_initial_ms = 600_000;
        config.bridge.backoff_max_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(
            &path,
            r#"
            [zilliqa]
            rpc_url = "https://zil.example"
            operator_address = "0x1234567890abcdef1234567890abcdef12345678"
            confirmations_required = 2

            [ethereum]
            rpc_url = "https://eth.example"
            operator_address = "0x1234567890abcdef1234567890abcdef12345678"
            confirmations_required = 12
            poll_interval_ms = 12000

            [tradehub]
            rpc_url = "https://swth.example"
            operator_address = "swth1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr"
            confirmations_required = 1

            [relay]
            custody_address = "swth1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr"
            fee_address = "swth1prv0t8j8tqcdngdmjlt59pwy6dxxmtqgycy2h7"

            [bridge]
            expiry_minutes = 90
            "#,
        )
        .unwrap();

        let config = BridgeConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.zilliqa.confirmations_required, 2);
        assert_eq!(config.zilliqa.poll_interval_ms, 15_000);
        assert_eq!(config.ethereum.poll_interval(), Duration::from_secs(12));
        assert_eq!(config.bridge.expiry_minutes, 90);
        assert_eq!(config.bridge.max_retries, 5);
        assert_eq!(config.assets.len(), 4);
    }
}
