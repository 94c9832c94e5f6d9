// Copyright (c) 2024 The Botho Foundation

//! Chain, direction and leg types.

use serde::{Deserialize, Serialize};

/// Characters allowed in the data part of a bech32 string.
const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Supported blockchain networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Zilliqa mainnet or testnet
    Zilliqa,
    /// Ethereum mainnet or testnet
    Ethereum,
    /// Switcheo TradeHub, the custody/relay chain
    TradeHub,
}

impl Chain {
    pub const ALL: [Chain; 3] = [Chain::Zilliqa, Chain::Ethereum, Chain::TradeHub];
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Chain::Zilliqa => write!(f, "zilliqa"),
            Chain::Ethereum => write!(f, "ethereum"),
            Chain::TradeHub => write!(f, "tradehub"),
        }
    }
}

impl std::str::FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zil" | "zilliqa" => Ok(Chain::Zilliqa),
            "eth" | "ethereum" => Ok(Chain::Ethereum),
            "swth" | "tradehub" => Ok(Chain::TradeHub),
            _ => Err(format!("Unknown chain: {}", s)),
        }
    }
}

/// The two chain pairs a transfer can move along. Both are relayed through
/// TradeHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Zilliqa -> TradeHub -> Ethereum
    ZilToEth,
    /// Ethereum -> TradeHub -> Zilliqa
    EthToZil,
}

impl TransferDirection {
    pub fn source_chain(&self) -> Chain {
        match self {
            TransferDirection::ZilToEth => Chain::Zilliqa,
            TransferDirection::EthToZil => Chain::Ethereum,
        }
    }

    pub fn dest_chain(&self) -> Chain {
        match self {
            TransferDirection::ZilToEth => Chain::Ethereum,
            TransferDirection::EthToZil => Chain::Zilliqa,
        }
    }

    /// The chain a given leg of this transfer executes on.
    pub fn chain_for(&self, leg: Leg) -> Chain {
        match leg {
            Leg::Deposit => self.source_chain(),
            Leg::Relay => Chain::TradeHub,
            Leg::Withdraw => self.dest_chain(),
        }
    }
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::ZilToEth => write!(f, "zil_to_eth"),
            TransferDirection::EthToZil => write!(f, "eth_to_zil"),
        }
    }
}

impl std::str::FromStr for TransferDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "zil_to_eth" => Ok(TransferDirection::ZilToEth),
            "eth_to_zil" => Ok(TransferDirection::EthToZil),
            _ => Err(format!("Unknown transfer direction: {}", s)),
        }
    }
}

/// One chain-interaction phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    /// User deposit on the source chain
    Deposit,
    /// Custody action on the relay chain
    Relay,
    /// Withdrawal to the recipient on the destination chain
    Withdraw,
}

impl Leg {
    pub const ALL: [Leg; 3] = [Leg::Deposit, Leg::Relay, Leg::Withdraw];

    /// The leg submitted once this one is confirmed.
    pub fn next(&self) -> Option<Leg> {
        match self {
            Leg::Deposit => Some(Leg::Relay),
            Leg::Relay => Some(Leg::Withdraw),
            Leg::Withdraw => None,
        }
    }
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leg::Deposit => write!(f, "deposit"),
            Leg::Relay => write!(f, "relay"),
            Leg::Withdraw => write!(f, "withdraw"),
        }
    }
}

impl std::str::FromStr for Leg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Leg::Deposit),
            "relay" => Ok(Leg::Relay),
            "withdraw" => Ok(Leg::Withdraw),
            _ => Err(format!("Unknown leg: {}", s)),
        }
    }
}

/// A chain-specific address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAddress {
    pub chain: Chain,
    pub address: String,
}

impl ChainAddress {
    pub fn new(chain: Chain, address: impl Into<String>) -> Self {
        Self {
            chain,
            address: address.into(),
        }
    }

    /// Validate the address format for the chain.
    ///
    /// Bech32 checksums are not verified here; the chain rejects a bad
    /// checksum at submission time.
    pub fn validate(&self) -> Result<(), String> {
        match self.chain {
            Chain::Zilliqa => {
                // Either bech32 (zil1...) or base16 with 0x prefix
                if self.address.starts_with("zil1") {
                    validate_bech32(&self.address, &["zil"])
                } else {
                    validate_hex_address(&self.address, "Zilliqa")
                }
            }
            Chain::Ethereum => validate_hex_address(&self.address, "Ethereum"),
            Chain::TradeHub => validate_bech32(&self.address, &["swth", "tswth"]),
        }
    }
}

impl std::fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain, self.address)
    }
}

fn validate_hex_address(address: &str, name: &str) -> Result<(), String> {
    let Some(body) = address.strip_prefix("0x") else {
        return Err(format!("{} address must start with 0x", name));
    };
    if address.len() != 42 {
        return Err(format!(
            "{} address must be 42 characters, got {}",
            name,
            address.len()
        ));
    }
    hex::decode(body).map_err(|_| format!("{} address must be valid hex", name))?;
    Ok(())
}

fn validate_bech32(address: &str, prefixes: &[&str]) -> Result<(), String> {
    let (hrp, data) = address
        .rsplit_once('1')
        .ok_or_else(|| format!("Address {} is not bech32", address))?;
    if !prefixes.contains(&hrp) {
        return Err(format!(
            "Address prefix must be one of {:?}, got {}",
            prefixes, hrp
        ));
    }
    // 20-byte account plus 6-character checksum
    if data.len() != 38 {
        return Err(format!(
            "Bech32 data part must be 38 characters, got {}",
            data.len()
        ));
    }
    if !data.chars().all(|c| BECH32_CHARSET.contains(c)) {
        return Err("Address contains characters outside the bech32 charset".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_parsing() {
        assert_eq!("zil".parse::<Chain>().unwrap(), Chain::Zilliqa);
        assert_eq!("ethereum".parse::<Chain>().unwrap(), Chain::Ethereum);
        assert_eq!("swth".parse::<Chain>().unwrap(), Chain::TradeHub);
        assert!("solana".parse::<Chain>().is_err());
    }

    #[test]
    fn test_direction_legs() {
        let dir = TransferDirection::ZilToEth;
        assert_eq!(dir.chain_for(Leg::Deposit), Chain::Zilliqa);
        assert_eq!(dir.chain_for(Leg::Relay), Chain::TradeHub);
        assert_eq!(dir.chain_for(Leg::Withdraw), Chain::Ethereum);

        let back = TransferDirection::EthToZil;
        assert_eq!(back.chain_for(Leg::Deposit), Chain::Ethereum);
        assert_eq!(back.chain_for(Leg::Withdraw), Chain::Zilliqa);

        assert_eq!("eth-to-zil".parse::<TransferDirection>().unwrap(), back);
        assert_eq!(Leg::Relay.next(), Some(Leg::Withdraw));
        assert_eq!(Leg::Withdraw.next(), None);
    }

    #[test]
    fn test_eth_address_validation() {
        let valid = ChainAddress::new(
            Chain::Ethereum,
            "0x1234567890abcdef1234567890abcdef12345678",
        );
        assert!(valid.validate().is_ok());

        let no_prefix =
            ChainAddress::new(Chain::Ethereum, "1234567890abcdef1234567890abcdef12345678");
        assert!(no_prefix.validate().is_err());

        let too_short = ChainAddress::new(Chain::Ethereum, "0x1234");
        assert!(too_short.validate().is_err());

        let not_hex = ChainAddress::new(
            Chain::Ethereum,
            "0x1234567890abcdef1234567890abcdef1234567z",
        );
        assert!(not_hex.validate().is_err());
    }

    #[test]
    fn test_bech32_address_validation() {
        let custody = ChainAddress::new(
            Chain::TradeHub,
            "swth1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr",
        );
        assert!(custody.validate().is_ok());

        let wrong_prefix = ChainAddress::new(
            Chain::TradeHub,
            "zil1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr",
        );
        assert!(wrong_prefix.validate().is_err());

        let zil = ChainAddress::new(
            Chain::Zilliqa,
            "zil1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr",
        );
        assert!(zil.validate().is_ok());

        let bad_char = ChainAddress::new(
            Chain::Zilliqa,
            "zil1bpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr",
        );
        assert!(bad_char.validate().is_err());
    }
}
