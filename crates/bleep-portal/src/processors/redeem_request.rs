use super::{accept_tx, accepted, emit, expect_action, BuildEnv, ProcessEnv};
use crate::action::ActionEnvelope;
use crate::collateral::checked_add;
use crate::error::{BuildError, PortalError, RejectReason};
use crate::instruction::Instruction;
use crate::redeem::{available_holding, redeem_fee, RedeemRequest};
use crate::status::{read_status, write_status, RequestStatus, StatusScope};
use crate::tokens::{ShardId, TokenId};
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemRequestContent {
    pub tx_id: String,
    pub redeem_id: String,
    pub token_id: TokenId,
    pub amount: u64,
    pub redeemer: String,
    pub remote_address: String,
    pub fee: u64,
    pub shard_id: ShardId,
    pub shard_height: u64,
}

pub fn build(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let (redeem_id, token_id, amount, redeemer, remote_address, fee) = expect_action!(
        envelope,
        RedeemRequest { redeem_id, token_id, amount, redeemer, remote_address, fee }
    );

    if env.ctx.state.is_redeem_pending(redeem_id)
        || read_status(&*env.ctx.store, StatusScope::Redeem, redeem_id)?.is_some()
    {
        return Err(RejectReason::DuplicateRequestId(redeem_id.clone()).into());
    }

    let required = redeem_fee(env.ctx.params, env.ctx.rates, token_id, *amount)?;
    if *fee < required {
        return Err(RejectReason::InsufficientFee {
            paid: *fee,
            required,
        }
        .into());
    }

    let available = available_holding(
        &env.ctx.state.custodians,
        &env.ctx.state.waiting_redeems,
        token_id,
    )?;
    if available < *amount {
        return Err(RejectReason::InsufficientHolding(*amount).into());
    }

    let content = RedeemRequestContent {
        tx_id: envelope.tx_id.clone(),
        redeem_id: redeem_id.clone(),
        token_id: token_id.clone(),
        amount: *amount,
        redeemer: redeemer.clone(),
        remote_address: remote_address.clone(),
        fee: *fee,
        shard_id: envelope.shard_id,
        shard_height: envelope.shard_height,
    };
    emit(env, accepted(envelope, &content)?, out)?;
    Ok(())
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: RedeemRequestContent = inst.decode()?;
    if env.state.is_redeem_pending(&content.redeem_id) {
        return Err(PortalError::Replay(format!("redeem {}", content.redeem_id)));
    }
    env.state.meta.fee_pool = checked_add(env.state.meta.fee_pool, content.fee, "fee pool")?;
    env.state.waiting_redeems.insert(
        content.redeem_id.clone(),
        RedeemRequest {
            redeem_id: content.redeem_id.clone(),
            token_id: content.token_id.clone(),
            amount: content.amount,
            redeemer: content.redeemer.clone(),
            redeemer_remote_address: content.remote_address.clone(),
            fee: content.fee,
            custodians: Vec::new(),
            shard_id: content.shard_id,
            shard_height: content.shard_height,
            beacon_height: env.block.beacon_height,
            cancelled_by_liquidation: false,
        },
    );
    write_status(
        env.store,
        StatusScope::Redeem,
        &content.redeem_id,
        RequestStatus::Waiting,
        env.block.beacon_height,
        &inst.content,
    )?;
    info!(
        "[Portal] Redeem {} waiting for custodians: {} {}",
        content.redeem_id, content.amount, content.token_id
    );
    accept_tx(env, &content.tx_id, inst)
}
