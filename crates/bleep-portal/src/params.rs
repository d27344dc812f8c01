/// PORTAL PARAMETERS
///
/// Consensus parameters of the portal. Every node must run with identical
/// values; they are loaded once at start-up and validated before the engine
/// accepts them.

use crate::tokens::{ExternalChain, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Portal token served by the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalTokenConfig {
    /// Chain the underlying asset lives on
    pub chain: ExternalChain,
    pub symbol: String,
}

/// Third-party collateral token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralTokenConfig {
    /// Chain hosting the collateral vault
    pub chain: ExternalChain,
    /// Vault address topup deposits must be paid to
    pub vault_address: String,
    pub symbol: String,
}

/// Order in which custodians are offered a porting request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustodianSelection {
    /// Largest free collateral value first, ties by address
    LargestFreeCollateral,
    /// Plain address order
    Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalParams {
    /// Native collateral coin
    pub native_token: TokenId,
    pub portal_tokens: BTreeMap<TokenId, PortalTokenConfig>,
    pub collateral_tokens: BTreeMap<TokenId, CollateralTokenConfig>,
    /// Minimum porting fee, basis points of the ported value
    pub porting_fee_bps: u64,
    /// Minimum redeem fee, basis points of the redeemed value
    pub redeem_fee_bps: u64,
    /// Collateral locked per unit of ported value (percent)
    pub required_collateral_percent: u64,
    /// Ratio under which a custodian is liquidated (percent)
    pub liquidation_threshold_percent: u64,
    /// Ratio a rate liquidation restores (percent)
    pub liquidation_target_percent: u64,
    /// Collateral value seized per unit of liquidated value (percent)
    pub rate_liquidation_seize_percent: u64,
    /// Collateral value seized per unit of unpaid redeem value (percent)
    pub run_away_premium_percent: u64,
    /// Shard blocks a porting request may wait for its deposit proof
    pub porting_timeout: u64,
    /// Shard blocks a redeem may wait for custodians to match it
    pub redeem_waiting_timeout: u64,
    /// Shard blocks custodians have to pay out a matched redeem
    pub redeem_return_timeout: u64,
    /// Native reward minted per beacon block for custodians
    pub block_reward: u64,
    /// Upper bound for any amount carried by an action
    pub max_request_amount: u64,
    pub custodian_selection: CustodianSelection,
}

impl Default for PortalParams {
    fn default() -> Self {
        let mut portal_tokens = BTreeMap::new();
        portal_tokens.insert(
            TokenId::from("pbtc"),
            PortalTokenConfig {
                chain: ExternalChain::Bitcoin,
                symbol: "pBTC".to_string(),
            },
        );
        portal_tokens.insert(
            TokenId::from("peth"),
            PortalTokenConfig {
                chain: ExternalChain::Ethereum,
                symbol: "pETH".to_string(),
            },
        );

        let mut collateral_tokens = BTreeMap::new();
        collateral_tokens.insert(
            TokenId::from("usdt"),
            CollateralTokenConfig {
                chain: ExternalChain::Ethereum,
                vault_address: "0x0000000000000000000000000000000000ba17".to_string(),
                symbol: "USDT".to_string(),
            },
        );
        collateral_tokens.insert(
            TokenId::from("dai"),
            CollateralTokenConfig {
                chain: ExternalChain::Ethereum,
                vault_address: "0x0000000000000000000000000000000000ba17".to_string(),
                symbol: "DAI".to_string(),
            },
        );

        PortalParams {
            native_token: TokenId::from("prv"),
            portal_tokens,
            collateral_tokens,
            porting_fee_bps: 1,
            redeem_fee_bps: 1,
            required_collateral_percent: 150,
            liquidation_threshold_percent: 130,
            liquidation_target_percent: 150,
            rate_liquidation_seize_percent: 105,
            run_away_premium_percent: 105,
            porting_timeout: 100,
            redeem_waiting_timeout: 50,
            redeem_return_timeout: 200,
            block_reward: 1_000,
            max_request_amount: 1_000_000_000_000_000_000,
            custodian_selection: CustodianSelection::LargestFreeCollateral,
        }
    }
}

impl PortalParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.native_token.as_str().is_empty() {
            return Err(ParamsError::Invalid("native_token must be set".to_string()));
        }
        if self.portal_tokens.is_empty() {
            return Err(ParamsError::Invalid("at least one portal token".to_string()));
        }
        if self.portal_tokens.contains_key(&self.native_token)
            || self.collateral_tokens.contains_key(&self.native_token)
        {
            return Err(ParamsError::Invalid(
                "native token cannot double as portal or collateral token".to_string(),
            ));
        }
        if let Some(id) = self
            .collateral_tokens
            .keys()
            .find(|id| self.portal_tokens.contains_key(*id))
        {
            return Err(ParamsError::Invalid(format!(
                "{} is both portal and collateral token",
                id
            )));
        }
        if self.porting_fee_bps > 10_000 || self.redeem_fee_bps > 10_000 {
            return Err(ParamsError::Invalid("fee bps cannot exceed 10000".to_string()));
        }
        if self.rate_liquidation_seize_percent < 100 || self.run_away_premium_percent < 100 {
            return Err(ParamsError::Invalid(
                "seize and premium rates must be at least 100%".to_string(),
            ));
        }
        if self.liquidation_threshold_percent <= self.rate_liquidation_seize_percent {
            return Err(ParamsError::Invalid(
                "liquidation threshold must exceed the seize rate".to_string(),
            ));
        }
        if self.liquidation_target_percent < self.liquidation_threshold_percent {
            return Err(ParamsError::Invalid(
                "liquidation target below threshold".to_string(),
            ));
        }
        if self.required_collateral_percent < self.liquidation_threshold_percent {
            return Err(ParamsError::Invalid(
                "porting would open positions that are already liquidatable".to_string(),
            ));
        }
        if self.porting_timeout == 0 || self.redeem_waiting_timeout == 0 {
            return Err(ParamsError::Invalid("timeouts must be > 0".to_string()));
        }
        if self.redeem_return_timeout <= self.redeem_waiting_timeout {
            return Err(ParamsError::Invalid(
                "redeem_return_timeout must exceed redeem_waiting_timeout".to_string(),
            ));
        }
        if self.max_request_amount == 0 {
            return Err(ParamsError::Invalid("max_request_amount must be > 0".to_string()));
        }
        Ok(())
    }

    /// Load parameters from a TOML/YAML/JSON file, with `PORTAL__*`
    /// environment variables overriding file values.
    pub fn from_file(path: &Path) -> Result<Self, ParamsError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("PORTAL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ParamsError::Load(e.to_string()))?;

        let params: PortalParams = settings
            .try_deserialize()
            .map_err(|e| ParamsError::Load(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn portal_token(&self, token: &TokenId) -> Option<&PortalTokenConfig> {
        self.portal_tokens.get(token)
    }

    pub fn collateral_token(&self, token: &TokenId) -> Option<&CollateralTokenConfig> {
        self.collateral_tokens.get(token)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamsError {
    #[error("invalid portal params: {0}")]
    Invalid(String),
    #[error("cannot load portal params: {0}")]
    Load(String),
}
