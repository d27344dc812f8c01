use super::{accept_tx, accepted, emit, expect_action, BuildEnv, ProcessEnv};
use crate::action::ActionEnvelope;
use crate::collateral::CollateralBundle;
use crate::error::{BuildError, PortalError, RejectReason};
use crate::instruction::Instruction;
use crate::tokens::TokenId;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCompensationContent {
    pub tx_id: String,
    pub redeem_id: String,
    pub redeemer: String,
    pub token_id: TokenId,
    pub collateral: CollateralBundle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRedeemContent {
    pub tx_id: String,
    pub token_id: TokenId,
    /// pTokens burned against the pool
    pub amount: u64,
    pub redeemer: String,
    pub payout: CollateralBundle,
}

pub fn build_claim(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let (redeem_id, redeemer) =
        expect_action!(envelope, ClaimLiquidationCompensation { redeem_id, redeemer });

    let claim = env
        .ctx
        .state
        .liquidation_pool
        .claims
        .get(redeem_id)
        .ok_or_else(|| RejectReason::RequestNotFound(redeem_id.clone()))?;
    if &claim.redeemer != redeemer {
        return Err(RejectReason::Mismatch {
            field: "redeemer",
            expected: claim.redeemer.clone(),
            actual: redeemer.clone(),
        }
        .into());
    }

    let content = ClaimCompensationContent {
        tx_id: envelope.tx_id.clone(),
        redeem_id: redeem_id.clone(),
        redeemer: redeemer.clone(),
        token_id: claim.token_id.clone(),
        collateral: claim.collateral.clone(),
    };
    emit(env, accepted(envelope, &content)?, out)?;
    Ok(())
}

pub fn process_claim(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: ClaimCompensationContent = inst.decode()?;
    let claim = env
        .state
        .liquidation_pool
        .take_claim(&content.redeem_id)
        .ok_or_else(|| PortalError::mismatch(inst.kind, format!("no claim for redeem {}", content.redeem_id)))?;
    if claim.redeemer != content.redeemer
        || claim.token_id != content.token_id
        || claim.collateral != content.collateral
    {
        return Err(PortalError::mismatch(inst.kind, "claim differs"));
    }
    info!(
        "[Portal] Redeemer {} compensated for redeem {}: {:?}",
        content.redeemer, content.redeem_id, content.collateral
    );
    accept_tx(env, &content.tx_id, inst)
}

pub fn build_redeem(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let (token_id, amount, redeemer) =
        expect_action!(envelope, RedeemFromLiquidationPool { token_id, amount, redeemer });

    let pool = &env.ctx.state.liquidation_pool;
    let available = pool.entry(token_id).map(|e| e.public_token_amount).unwrap_or(0);
    if *amount > available {
        return Err(RejectReason::InvalidAmount {
            amount: *amount,
            max: available,
        }
        .into());
    }
    let payout = pool.redeem_share(token_id, *amount)?;
    if payout.is_empty() {
        return Err(RejectReason::NothingToPay.into());
    }

    let content = PoolRedeemContent {
        tx_id: envelope.tx_id.clone(),
        token_id: token_id.clone(),
        amount: *amount,
        redeemer: redeemer.clone(),
        payout,
    };
    emit(env, accepted(envelope, &content)?, out)?;
    Ok(())
}

pub fn process_redeem(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: PoolRedeemContent = inst.decode()?;
    let pool = &mut env.state.liquidation_pool;
    let expected = pool.redeem_share(&content.token_id, content.amount)?;
    if expected != content.payout || content.payout.is_empty() {
        return Err(PortalError::mismatch(inst.kind, "pool payout differs"));
    }
    pool.withdraw(&content.token_id, content.amount, &content.payout)?;
    info!(
        "[Portal] {} redeemed {} {} from the liquidation pool for {:?}",
        content.redeemer, content.amount, content.token_id, content.payout
    );
    accept_tx(env, &content.tx_id, inst)
}
