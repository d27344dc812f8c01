use super::{accept_tx, accepted, emit, expect_action, BuildEnv, ProcessEnv};
use crate::action::ActionEnvelope;
use crate::collateral::checked_add;
use crate::error::{BuildError, PortalError, RejectReason};
use crate::instruction::Instruction;
use crate::porting::{porting_fee, select_porting_custodians, MatchingPortingCustodian, WaitingPortingRequest};
use crate::status::{read_status, write_status, RequestStatus, StatusScope};
use crate::tokens::{ShardId, TokenId};
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortingRequestContent {
    pub tx_id: String,
    pub porting_id: String,
    pub token_id: TokenId,
    pub amount: u64,
    pub requester: String,
    pub fee: u64,
    pub custodians: Vec<MatchingPortingCustodian>,
    pub shard_id: ShardId,
    pub shard_height: u64,
}

pub fn build(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let (porting_id, token_id, amount, requester, fee) =
        expect_action!(envelope, PortingRequest { porting_id, token_id, amount, requester, fee });

    if env.ctx.state.is_porting_pending(porting_id)
        || read_status(&*env.ctx.store, StatusScope::Porting, porting_id)?.is_some()
    {
        return Err(RejectReason::DuplicateRequestId(porting_id.clone()).into());
    }

    let required = porting_fee(env.ctx.params, env.ctx.rates, token_id, *amount)?;
    if *fee < required {
        return Err(RejectReason::InsufficientFee {
            paid: *fee,
            required,
        }
        .into());
    }

    let custodians = select_porting_custodians(
        env.ctx.params,
        env.ctx.rates,
        &env.ctx.state.custodians,
        token_id,
        *amount,
    )?
    .ok_or(RejectReason::InsufficientCollateral(*amount))?;

    let content = PortingRequestContent {
        tx_id: envelope.tx_id.clone(),
        porting_id: porting_id.clone(),
        token_id: token_id.clone(),
        amount: *amount,
        requester: requester.clone(),
        fee: *fee,
        custodians,
        shard_id: envelope.shard_id,
        shard_height: envelope.shard_height,
    };
    emit(env, accepted(envelope, &content)?, out)?;
    Ok(())
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: PortingRequestContent = inst.decode()?;
    if env.state.is_porting_pending(&content.porting_id) {
        return Err(PortalError::Replay(format!("porting {}", content.porting_id)));
    }
    let allocated = content
        .custodians
        .iter()
        .try_fold(0u64, |acc, c| checked_add(acc, c.amount, "porting allocation"))?;
    if allocated != content.amount || content.custodians.is_empty() {
        return Err(PortalError::mismatch(inst.kind, "allocation does not cover the amount"));
    }
    if content.fee < porting_fee(env.params, env.rates, &content.token_id, content.amount)? {
        return Err(PortalError::mismatch(inst.kind, "fee below the porting fee"));
    }
    let selected = select_porting_custodians(
        env.params,
        env.rates,
        &env.state.custodians,
        &content.token_id,
        content.amount,
    )?;
    if selected.as_ref() != Some(&content.custodians) {
        return Err(PortalError::mismatch(inst.kind, "custodian allocation differs"));
    }

    for matched in &content.custodians {
        let custodian = env.state.custodian_mut(&matched.custodian_address)?;
        if custodian.remote_address(&content.token_id) != Some(matched.remote_address.as_str()) {
            return Err(PortalError::mismatch(inst.kind, "custodian remote address"));
        }
        custodian.lock(&content.token_id, &matched.locked_collateral)?;
    }
    env.state.meta.fee_pool = checked_add(env.state.meta.fee_pool, content.fee, "fee pool")?;

    let request = WaitingPortingRequest {
        porting_id: content.porting_id.clone(),
        token_id: content.token_id.clone(),
        amount: content.amount,
        requester: content.requester.clone(),
        fee: content.fee,
        custodians: content.custodians.clone(),
        shard_id: content.shard_id,
        shard_height: content.shard_height,
        beacon_height: env.block.beacon_height,
    };
    env.state.waiting_porting.insert(content.porting_id.clone(), request);

    write_status(
        env.store,
        StatusScope::Porting,
        &content.porting_id,
        RequestStatus::Waiting,
        env.block.beacon_height,
        &inst.content,
    )?;
    info!(
        "[Portal] Porting {} waiting: {} {} backed by {} custodian(s)",
        content.porting_id,
        content.amount,
        content.token_id,
        content.custodians.len()
    );
    accept_tx(env, &content.tx_id, inst)
}
