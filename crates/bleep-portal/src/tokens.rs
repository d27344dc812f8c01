/// TOKEN & CHAIN IDENTIFIERS
///
/// Portal tokens (pBTC, pETH, ...) are backed by custodian collateral.
/// Collateral is the native coin plus a configured set of third-party tokens
/// held in an external vault.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Shard identifier of the carrying transaction
pub type ShardId = u8;

/// Asset identifier used across the exchange-rate table and ledgers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        TokenId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TokenId {
    fn from(id: &str) -> Self {
        TokenId(id.to_string())
    }
}

/// External chain whose proofs the portal accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExternalChain {
    Bitcoin,
    Ethereum,
}

impl ExternalChain {
    /// Chain name mixed into external transaction identifiers
    pub fn name(&self) -> &'static str {
        match self {
            ExternalChain::Bitcoin => "BTC",
            ExternalChain::Ethereum => "ETH",
        }
    }
}

/// Which collateral balance an action touches
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CollateralKind {
    /// The chain's own coin
    Native,
    /// A third-party collateral token held in the external vault
    Token(TokenId),
}

impl fmt::Display for CollateralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollateralKind::Native => f.write_str("native"),
            CollateralKind::Token(id) => write!(f, "token:{}", id),
        }
    }
}
