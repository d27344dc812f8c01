/// PORTAL INSTRUCTIONS
///
/// The 4-field record handed to the block layer:
/// `[kind code, shard id, status, JSON content]`. Auto-generated
/// instructions carry shard `-1`.

use crate::error::PortalError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shard placeholder of instructions without an originating transaction
pub const AUTO_SHARD_ID: i32 = -1;

/// Every instruction kind the portal produces. Closed set; the order of
/// `ALL` is the order user actions of different kinds are built in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstructionKind {
    CustodianDeposit,
    CustodianTopup,
    PortingRequest,
    RequestPTokens,
    RedeemRequest,
    RequestMatchingRedeem,
    RequestUnlockCollateral,
    WithdrawCollateral,
    ConfirmWithdraw,
    ClaimLiquidationCompensation,
    RedeemFromLiquidationPool,
    WithdrawReward,
    LiquidateRunAway,
    ExpiredPorting,
    PickMoreCustodian,
    LiquidateByRates,
    Reward,
}

impl InstructionKind {
    pub const ALL: [InstructionKind; 17] = [
        InstructionKind::CustodianDeposit,
        InstructionKind::CustodianTopup,
        InstructionKind::PortingRequest,
        InstructionKind::RequestPTokens,
        InstructionKind::RedeemRequest,
        InstructionKind::RequestMatchingRedeem,
        InstructionKind::RequestUnlockCollateral,
        InstructionKind::WithdrawCollateral,
        InstructionKind::ConfirmWithdraw,
        InstructionKind::ClaimLiquidationCompensation,
        InstructionKind::RedeemFromLiquidationPool,
        InstructionKind::WithdrawReward,
        InstructionKind::LiquidateRunAway,
        InstructionKind::ExpiredPorting,
        InstructionKind::PickMoreCustodian,
        InstructionKind::LiquidateByRates,
        InstructionKind::Reward,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            InstructionKind::CustodianDeposit => "portal-custodian-deposit",
            InstructionKind::CustodianTopup => "portal-custodian-topup",
            InstructionKind::PortingRequest => "portal-porting-request",
            InstructionKind::RequestPTokens => "portal-request-ptokens",
            InstructionKind::RedeemRequest => "portal-redeem-request",
            InstructionKind::RequestMatchingRedeem => "portal-request-matching-redeem",
            InstructionKind::RequestUnlockCollateral => "portal-request-unlock-collateral",
            InstructionKind::WithdrawCollateral => "portal-withdraw-collateral",
            InstructionKind::ConfirmWithdraw => "portal-confirm-withdraw",
            InstructionKind::ClaimLiquidationCompensation => "portal-claim-liquidation-compensation",
            InstructionKind::RedeemFromLiquidationPool => "portal-redeem-from-liquidation-pool",
            InstructionKind::WithdrawReward => "portal-withdraw-reward",
            InstructionKind::LiquidateRunAway => "portal-liquidate-run-away",
            InstructionKind::ExpiredPorting => "portal-expired-porting",
            InstructionKind::PickMoreCustodian => "portal-pick-more-custodian",
            InstructionKind::LiquidateByRates => "portal-liquidate-by-rates",
            InstructionKind::Reward => "portal-reward",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, PortalError> {
        InstructionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.code() == code)
            .ok_or_else(|| PortalError::UnknownInstructionKind(code.to_string()))
    }

    /// Position in `ALL`, used as the primary sort key of user actions
    pub fn rank(&self) -> usize {
        InstructionKind::ALL
            .iter()
            .position(|kind| kind == self)
            .unwrap_or(InstructionKind::ALL.len())
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstructionStatus {
    Accepted,
    Rejected,
    Waiting,
    Matched,
    Liquidated,
    Expired,
}

impl InstructionStatus {
    pub const ALL: [InstructionStatus; 6] = [
        InstructionStatus::Accepted,
        InstructionStatus::Rejected,
        InstructionStatus::Waiting,
        InstructionStatus::Matched,
        InstructionStatus::Liquidated,
        InstructionStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionStatus::Accepted => "accepted",
            InstructionStatus::Rejected => "rejected",
            InstructionStatus::Waiting => "waiting",
            InstructionStatus::Matched => "matched",
            InstructionStatus::Liquidated => "liquidated",
            InstructionStatus::Expired => "expired",
        }
    }

    pub fn from_str_token(token: &str) -> Result<Self, PortalError> {
        InstructionStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == token)
            .ok_or_else(|| PortalError::MalformedInstruction(format!("unknown status {}", token)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub shard_id: i32,
    pub status: InstructionStatus,
    /// Kind-specific payload, JSON
    pub content: String,
}

impl Instruction {
    pub fn new<T: Serialize>(
        kind: InstructionKind,
        shard_id: i32,
        status: InstructionStatus,
        content: &T,
    ) -> Result<Self, PortalError> {
        let content = serde_json::to_string(content)
            .map_err(|e| PortalError::MalformedInstruction(e.to_string()))?;
        Ok(Instruction {
            kind,
            shard_id,
            status,
            content,
        })
    }

    pub fn auto<T: Serialize>(
        kind: InstructionKind,
        status: InstructionStatus,
        content: &T,
    ) -> Result<Self, PortalError> {
        Instruction::new(kind, AUTO_SHARD_ID, status, content)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PortalError> {
        serde_json::from_str(&self.content).map_err(|e| {
            PortalError::MalformedInstruction(format!("{} content: {}", self.kind, e))
        })
    }

    pub fn to_record(&self) -> [String; 4] {
        [
            self.kind.code().to_string(),
            self.shard_id.to_string(),
            self.status.as_str().to_string(),
            self.content.clone(),
        ]
    }

    pub fn from_record(record: &[String; 4]) -> Result<Self, PortalError> {
        let shard_id = record[1]
            .parse::<i32>()
            .map_err(|e| PortalError::MalformedInstruction(format!("shard id: {}", e)))?;
        Ok(Instruction {
            kind: InstructionKind::from_code(&record[0])?,
            shard_id,
            status: InstructionStatus::from_str_token(&record[2])?,
            content: record[3].clone(),
        })
    }
}
