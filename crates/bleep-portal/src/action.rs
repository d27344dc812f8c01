/// USER ACTION SCHEMA
///
/// Typed, versioned envelope for the user actions forwarded by the shards.
/// `validate_schema` is the boundary check: anything that passes is
/// well-formed, and anything that fails becomes a rejected instruction.

use crate::error::RejectReason;
use crate::instruction::InstructionKind;
use crate::params::PortalParams;
use crate::proof::ExternalProof;
use crate::tokens::{CollateralKind, ShardId, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ACTION_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub version: u8,
    /// Hash of the carrying shard transaction
    pub tx_id: String,
    pub shard_id: ShardId,
    /// Shard height the transaction was included at
    pub shard_height: u64,
    pub action: PortalAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PortalAction {
    CustodianDeposit {
        custodian: String,
        amount: u64,
        #[serde(default)]
        remote_addresses: BTreeMap<TokenId, String>,
    },
    CustodianTopup {
        custodian: String,
        collateral: CollateralKind,
        amount: u64,
        #[serde(default)]
        proof: Option<ExternalProof>,
    },
    PortingRequest {
        porting_id: String,
        token_id: TokenId,
        amount: u64,
        requester: String,
        fee: u64,
    },
    RequestPTokens {
        porting_id: String,
        token_id: TokenId,
        amount: u64,
        requester: String,
        proof: ExternalProof,
    },
    RedeemRequest {
        redeem_id: String,
        token_id: TokenId,
        amount: u64,
        redeemer: String,
        remote_address: String,
        fee: u64,
    },
    RequestMatchingRedeem {
        redeem_id: String,
        custodian: String,
    },
    RequestUnlockCollateral {
        redeem_id: String,
        token_id: TokenId,
        custodian: String,
        amount: u64,
        proof: ExternalProof,
    },
    WithdrawCollateral {
        custodian: String,
        collateral: CollateralKind,
        amount: u64,
        #[serde(default)]
        external_address: Option<String>,
    },
    ClaimLiquidationCompensation {
        redeem_id: String,
        redeemer: String,
    },
    RedeemFromLiquidationPool {
        token_id: TokenId,
        amount: u64,
        redeemer: String,
    },
    WithdrawReward {
        custodian: String,
    },
}

impl PortalAction {
    pub fn kind(&self) -> InstructionKind {
        match self {
            PortalAction::CustodianDeposit { .. } => InstructionKind::CustodianDeposit,
            PortalAction::CustodianTopup { .. } => InstructionKind::CustodianTopup,
            PortalAction::PortingRequest { .. } => InstructionKind::PortingRequest,
            PortalAction::RequestPTokens { .. } => InstructionKind::RequestPTokens,
            PortalAction::RedeemRequest { .. } => InstructionKind::RedeemRequest,
            PortalAction::RequestMatchingRedeem { .. } => InstructionKind::RequestMatchingRedeem,
            PortalAction::RequestUnlockCollateral { .. } => InstructionKind::RequestUnlockCollateral,
            PortalAction::WithdrawCollateral { .. } => InstructionKind::WithdrawCollateral,
            PortalAction::ClaimLiquidationCompensation { .. } => {
                InstructionKind::ClaimLiquidationCompensation
            }
            PortalAction::RedeemFromLiquidationPool { .. } => InstructionKind::RedeemFromLiquidationPool,
            PortalAction::WithdrawReward { .. } => InstructionKind::WithdrawReward,
        }
    }
}

impl ActionEnvelope {
    pub fn new(tx_id: impl Into<String>, shard_id: ShardId, shard_height: u64, action: PortalAction) -> Self {
        ActionEnvelope {
            version: ACTION_SCHEMA_VERSION,
            tx_id: tx_id.into(),
            shard_id,
            shard_height,
            action,
        }
    }

    pub fn kind(&self) -> InstructionKind {
        self.action.kind()
    }

    /// Build order: kind, then shard, then tx ID
    pub fn sort_key(&self) -> (usize, ShardId, &str) {
        (self.kind().rank(), self.shard_id, self.tx_id.as_str())
    }

    pub fn validate_schema(&self, params: &PortalParams) -> Result<(), RejectReason> {
        if self.version != ACTION_SCHEMA_VERSION {
            return Err(RejectReason::UnsupportedVersion(self.version));
        }
        non_empty("tx_id", &self.tx_id)?;

        match &self.action {
            PortalAction::CustodianDeposit {
                custodian,
                amount,
                remote_addresses,
            } => {
                non_empty("custodian", custodian)?;
                bounded(params, *amount)?;
                for (token, address) in remote_addresses {
                    portal_token(params, token)?;
                    non_empty("remote_address", address)?;
                }
            }
            PortalAction::CustodianTopup {
                custodian,
                collateral,
                amount,
                ..
            } => {
                non_empty("custodian", custodian)?;
                collateral_kind(params, collateral)?;
                bounded(params, *amount)?;
            }
            PortalAction::PortingRequest {
                porting_id,
                token_id,
                amount,
                requester,
                ..
            } => {
                non_empty("porting_id", porting_id)?;
                portal_token(params, token_id)?;
                bounded(params, *amount)?;
                non_empty("requester", requester)?;
            }
            PortalAction::RequestPTokens {
                porting_id,
                token_id,
                amount,
                requester,
                ..
            } => {
                non_empty("porting_id", porting_id)?;
                portal_token(params, token_id)?;
                bounded(params, *amount)?;
                non_empty("requester", requester)?;
            }
            PortalAction::RedeemRequest {
                redeem_id,
                token_id,
                amount,
                redeemer,
                remote_address,
                ..
            } => {
                non_empty("redeem_id", redeem_id)?;
                portal_token(params, token_id)?;
                bounded(params, *amount)?;
                non_empty("redeemer", redeemer)?;
                non_empty("remote_address", remote_address)?;
            }
            PortalAction::RequestMatchingRedeem { redeem_id, custodian } => {
                non_empty("redeem_id", redeem_id)?;
                non_empty("custodian", custodian)?;
            }
            PortalAction::RequestUnlockCollateral {
                redeem_id,
                token_id,
                custodian,
                amount,
                ..
            } => {
                non_empty("redeem_id", redeem_id)?;
                portal_token(params, token_id)?;
                non_empty("custodian", custodian)?;
                bounded(params, *amount)?;
            }
            PortalAction::WithdrawCollateral {
                custodian,
                collateral,
                amount,
                external_address,
            } => {
                non_empty("custodian", custodian)?;
                collateral_kind(params, collateral)?;
                bounded(params, *amount)?;
                if let CollateralKind::Token(_) = collateral {
                    non_empty("external_address", external_address.as_deref().unwrap_or(""))?;
                }
            }
            PortalAction::ClaimLiquidationCompensation { redeem_id, redeemer } => {
                non_empty("redeem_id", redeem_id)?;
                non_empty("redeemer", redeemer)?;
            }
            PortalAction::RedeemFromLiquidationPool {
                token_id,
                amount,
                redeemer,
            } => {
                portal_token(params, token_id)?;
                bounded(params, *amount)?;
                non_empty("redeemer", redeemer)?;
            }
            PortalAction::WithdrawReward { custodian } => {
                non_empty("custodian", custodian)?;
            }
        }
        Ok(())
    }
}

fn non_empty(field: &'static str, value: &str) -> Result<(), RejectReason> {
    if value.trim().is_empty() {
        return Err(RejectReason::EmptyField(field));
    }
    Ok(())
}

fn bounded(params: &PortalParams, amount: u64) -> Result<(), RejectReason> {
    if amount == 0 || amount > params.max_request_amount {
        return Err(RejectReason::InvalidAmount {
            amount,
            max: params.max_request_amount,
        });
    }
    Ok(())
}

fn portal_token(params: &PortalParams, token: &TokenId) -> Result<(), RejectReason> {
    match params.portal_token(token) {
        Some(_) => Ok(()),
        None => Err(RejectReason::UnsupportedToken(token.clone())),
    }
}

fn collateral_kind(params: &PortalParams, kind: &CollateralKind) -> Result<(), RejectReason> {
    match kind {
        CollateralKind::Native => Ok(()),
        CollateralKind::Token(token) if params.collateral_token(token).is_some() => Ok(()),
        CollateralKind::Token(token) => Err(RejectReason::UnsupportedCollateral(token.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn porting(amount: u64) -> ActionEnvelope {
        ActionEnvelope::new(
            "tx1",
            0,
            10,
            PortalAction::PortingRequest {
                porting_id: "p1".to_string(),
                token_id: TokenId::from("pbtc"),
                amount,
                requester: "user".to_string(),
                fee: 1,
            },
        )
    }

    #[test]
    fn test_valid_action_passes() {
        assert_eq!(porting(100).validate_schema(&PortalParams::default()), Ok(()));
    }

    #[test]
    fn test_zero_and_oversized_amounts() {
        let params = PortalParams::default();
        assert!(matches!(
            porting(0).validate_schema(&params),
            Err(RejectReason::InvalidAmount { .. })
        ));
        let small = PortalParams {
            max_request_amount: 10,
            ..PortalParams::default()
        };
        assert!(porting(11).validate_schema(&small).is_err());
    }

    #[test]
    fn test_version_and_token_checks() {
        let params = PortalParams::default();
        let mut envelope = porting(1);
        envelope.version = 2;
        assert_eq!(
            envelope.validate_schema(&params),
            Err(RejectReason::UnsupportedVersion(2))
        );

        let topup = ActionEnvelope::new(
            "tx2",
            0,
            10,
            PortalAction::CustodianTopup {
                custodian: "c1".to_string(),
                collateral: CollateralKind::Token(TokenId::from("doge")),
                amount: 5,
                proof: None,
            },
        );
        assert_eq!(
            topup.validate_schema(&params),
            Err(RejectReason::UnsupportedCollateral(TokenId::from("doge")))
        );
    }

    #[test]
    fn test_token_withdraw_needs_external_address() {
        let withdraw = ActionEnvelope::new(
            "tx3",
            1,
            4,
            PortalAction::WithdrawCollateral {
                custodian: "c1".to_string(),
                collateral: CollateralKind::Token(TokenId::from("usdt")),
                amount: 5,
                external_address: None,
            },
        );
        assert_eq!(
            withdraw.validate_schema(&PortalParams::default()),
            Err(RejectReason::EmptyField("external_address"))
        );
    }

    #[test]
    fn test_json_shape_is_tagged() {
        let json = serde_json::to_value(&porting(5)).unwrap();
        assert_eq!(json["action"]["type"], "porting-request");
        let back: ActionEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, porting(5));
    }

    #[test]
    fn test_sort_key_orders_by_kind_first() {
        let deposit = ActionEnvelope::new(
            "zzz",
            3,
            1,
            PortalAction::CustodianDeposit {
                custodian: "c1".to_string(),
                amount: 1,
                remote_addresses: BTreeMap::new(),
            },
        );
        assert!(deposit.sort_key() < porting(1).sort_key());
    }
}
