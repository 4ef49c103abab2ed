//! Chain descriptors and transfer direction

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Ethereum,
    Polkadot,
    Kusama,
}

impl Network {
    /// Relay-chain based consensus (Polkadot or Kusama)
    pub fn is_polkadot_family(&self) -> bool {
        matches!(self, Network::Polkadot | Network::Kusama)
    }
}

/// Endpoint of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    /// Stable chain key, e.g. `polkadot-assethub`
    pub uid: String,
    pub name: String,
    pub network: Network,
    /// Parachain id used to route XCM messages
    #[serde(default)]
    pub routing_id: Option<u32>,
    #[serde(default)]
    pub evm_chain_id: Option<u64>,
    /// Parachain with an EVM execution layer whose events carry the EVM tx hash
    #[serde(default)]
    pub supports_evm_tx_hash: bool,
}

impl Chain {
    /// Block explorer page for a transaction submitted on this chain
    pub fn explorer_tx_url(&self, tx_hash: &str) -> Option<String> {
        match self.network {
            Network::Ethereum => match self.evm_chain_id {
                Some(1) | None => Some(format!("https://etherscan.io/tx/{tx_hash}")),
                Some(11155111) => Some(format!("https://sepolia.etherscan.io/tx/{tx_hash}")),
                Some(_) => None,
            },
            Network::Polkadot | Network::Kusama => {
                let slug: String = self
                    .name
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .to_ascii_lowercase();
                if slug.is_empty() {
                    return None;
                }
                Some(format!("https://{slug}.subscan.io/extrinsic/{tx_hash}"))
            }
        }
    }
}

/// Routing classification of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToEthereum,
    ToPolkadot,
    WithinPolkadot,
    WithinEthereum,
}

impl Direction {
    pub fn resolve(source: &Chain, destination: &Chain) -> Self {
        match (
            source.network.is_polkadot_family(),
            destination.network.is_polkadot_family(),
        ) {
            (false, true) => Direction::ToPolkadot,
            (true, false) => Direction::ToEthereum,
            (true, true) => Direction::WithinPolkadot,
            (false, false) => Direction::WithinEthereum,
        }
    }

    /// Crosses the Ethereum <> Polkadot bridge
    pub fn is_bridge(&self) -> bool {
        matches!(self, Direction::ToEthereum | Direction::ToPolkadot)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToEthereum => "to_ethereum",
            Direction::ToPolkadot => "to_polkadot",
            Direction::WithinPolkadot => "within_polkadot",
            Direction::WithinEthereum => "within_ethereum",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::fixtures::*;

    #[test]
    fn direction_from_chain_pair() {
        assert_eq!(Direction::resolve(&ethereum(), &asset_hub()), Direction::ToPolkadot);
        assert_eq!(Direction::resolve(&asset_hub(), &ethereum()), Direction::ToEthereum);
        assert_eq!(Direction::resolve(&hydration(), &moonbeam()), Direction::WithinPolkadot);
        assert_eq!(Direction::resolve(&ethereum(), &ethereum()), Direction::WithinEthereum);
        assert!(Direction::ToEthereum.is_bridge());
        assert!(!Direction::WithinPolkadot.is_bridge());
    }

    #[test]
    fn subscan_link_uses_chain_name() {
        assert_eq!(
            asset_hub().explorer_tx_url("0x01").as_deref(),
            Some("https://assethub.subscan.io/extrinsic/0x01")
        );
    }
}
