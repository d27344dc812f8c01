use super::{accept_tx, accepted, emit, expect_action, BuildEnv, ProcessEnv};
use crate::action::ActionEnvelope;
use crate::collateral::{checked_add, checked_sub, to_u64};
use crate::error::{BuildError, PortalError, RejectReason};
use crate::instruction::{Instruction, InstructionKind, InstructionStatus};
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianReward {
    pub custodian: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardContent {
    pub beacon_height: u64,
    pub block_reward: u64,
    pub fee_pool_before: u64,
    pub rewards: Vec<CustodianReward>,
    /// Undistributed remainder, kept for the next block
    pub fee_pool_after: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRewardContent {
    pub tx_id: String,
    pub custodian: String,
    pub amount: u64,
}

/// Split `fee_pool + block_reward` over custodians by the value of all
/// their locked collateral. Nothing is emitted while no collateral is locked
/// or there is nothing to pay.
pub fn build(env: &mut BuildEnv<'_>, out: &mut Vec<Instruction>) -> Result<(), PortalError> {
    let content = match distribution(&env.ctx) {
        Ok(Some(content)) => content,
        Ok(None) => return Ok(()),
        Err(PortalError::MissingExchangeRate(token)) => {
            warn!("[Portal] Reward distribution skipped: no rate for {}", token);
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let inst = Instruction::auto(InstructionKind::Reward, InstructionStatus::Accepted, &content)?;
    emit(env, inst, out)
}

/// The distribution due at this block, if any
fn distribution(env: &ProcessEnv<'_>) -> Result<Option<RewardContent>, PortalError> {
    let params = env.params;
    let fee_pool_before = env.state.meta.fee_pool;
    let total = checked_add(fee_pool_before, params.block_reward, "reward total")?;
    if total == 0 {
        return Ok(None);
    }

    let mut weights: Vec<(String, u128)> = Vec::with_capacity(env.state.custodians.len());
    for (address, custodian) in &env.state.custodians {
        let locked = custodian.total_locked()?;
        if locked.is_empty() {
            continue;
        }
        let weight = locked.value(env.rates, &params.native_token)?;
        if weight > 0 {
            weights.push((address.clone(), weight));
        }
    }
    let total_weight = weights
        .iter()
        .try_fold(0u128, |acc, (_, w)| acc.checked_add(*w))
        .ok_or(PortalError::ArithmeticOverflow("reward weight"))?;
    if total_weight == 0 {
        return Ok(None);
    }

    let mut rewards = Vec::with_capacity(weights.len());
    let mut distributed = 0u64;
    for (custodian, weight) in weights {
        let amount = u128::from(total)
            .checked_mul(weight)
            .ok_or(PortalError::ArithmeticOverflow("reward share"))?
            / total_weight;
        let amount = to_u64(amount, "reward share")?;
        if amount == 0 {
            continue;
        }
        distributed = checked_add(distributed, amount, "reward sum")?;
        rewards.push(CustodianReward { custodian, amount });
    }

    Ok(Some(RewardContent {
        beacon_height: env.block.beacon_height,
        block_reward: params.block_reward,
        fee_pool_before,
        rewards,
        fee_pool_after: checked_sub(total, distributed, "reward remainder")?,
    }))
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: RewardContent = inst.decode()?;
    if content.beacon_height != env.block.beacon_height
        || env
            .state
            .meta
            .last_reward_height
            .map_or(false, |last| last >= content.beacon_height)
    {
        return Err(PortalError::Replay(format!("reward at beacon height {}", content.beacon_height)));
    }
    if distribution(env)?.as_ref() != Some(&content) {
        return Err(PortalError::mismatch(inst.kind, "reward distribution differs"));
    }

    for reward in &content.rewards {
        env.state.custodian_mut(&reward.custodian)?.credit_reward(reward.amount)?;
    }
    let total = checked_add(content.fee_pool_before, content.block_reward, "reward total")?;
    env.state.meta.fee_pool = content.fee_pool_after;
    env.state.meta.last_reward_height = Some(content.beacon_height);
    info!(
        "[Portal] Distributed {} to {} custodian(s) at beacon height {}, {} carried over",
        total - content.fee_pool_after,
        content.rewards.len(),
        content.beacon_height,
        content.fee_pool_after
    );
    Ok(())
}

pub fn build_withdraw(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let custodian = expect_action!(envelope, WithdrawReward { custodian });
    let balance = env
        .ctx
        .state
        .custodian(custodian)
        .map(|c| c.reward_balance)
        .ok_or_else(|| RejectReason::CustodianNotFound(custodian.clone()))?;
    if balance == 0 {
        return Err(RejectReason::NothingToPay.into());
    }
    let content = WithdrawRewardContent {
        tx_id: envelope.tx_id.clone(),
        custodian: custodian.clone(),
        amount: balance,
    };
    emit(env, accepted(envelope, &content)?, out)?;
    Ok(())
}

pub fn process_withdraw(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: WithdrawRewardContent = inst.decode()?;
    let custodian = env.state.custodian_mut(&content.custodian)?;
    if custodian.reward_balance != content.amount || content.amount == 0 {
        return Err(PortalError::mismatch(inst.kind, "reward balance differs"));
    }
    custodian.reward_balance = 0;
    info!("[Portal] Custodian {} withdrew {} in rewards", content.custodian, content.amount);
    accept_tx(env, &content.tx_id, inst)
}
