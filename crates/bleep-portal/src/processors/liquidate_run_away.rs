use super::{emit, BuildEnv, ProcessEnv};
use crate::collateral::CollateralBundle;
use crate::error::PortalError;
use crate::instruction::{Instruction, InstructionKind, InstructionStatus};
use crate::liquidation::settle_run_away;
use crate::status::{write_status, RequestStatus, StatusScope};
use crate::tokens::TokenId;
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// One unpaid match of a matched redeem, liquidated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidateRunAwayContent {
    pub redeem_id: String,
    pub token_id: TokenId,
    pub redeemer: String,
    pub custodian: String,
    pub amount: u64,
    pub seized: CollateralBundle,
    pub released: CollateralBundle,
}

/// Matched redeems past `redeem_return_timeout` whose custodians never paid
/// out: one instruction per remaining match, in match-list order.
pub fn build(env: &mut BuildEnv<'_>, out: &mut Vec<Instruction>) -> Result<(), PortalError> {
    let timeout = env.ctx.params.redeem_return_timeout;
    let due: Vec<String> = env
        .ctx
        .state
        .matched_redeems
        .values()
        .filter(|r| r.age(env.ctx.block) > timeout)
        .map(|r| r.redeem_id.clone())
        .collect();

    for redeem_id in due {
        let request = match env.ctx.state.matched_redeems.get(&redeem_id) {
            Some(request) => request.clone(),
            None => continue,
        };
        for matched in &request.custodians {
            let custodian = &matched.custodian_address;
            let holding = env
                .ctx
                .state
                .custodian(custodian)
                .map(|c| c.holding(&request.token_id))
                .unwrap_or(0);
            let holding_locked = env.ctx.state.holding_locked(custodian, &request.token_id)?;
            let settlement = match settle_run_away(
                env.ctx.params,
                env.ctx.rates,
                &holding_locked,
                &request.token_id,
                matched.amount,
                holding,
            ) {
                Ok(settlement) => settlement,
                Err(PortalError::MissingExchangeRate(token)) => {
                    warn!(
                        "[Portal] Run-away liquidation of redeem {} deferred: no rate for {}",
                        redeem_id, token
                    );
                    break;
                }
                Err(err) => return Err(err),
            };

            let content = LiquidateRunAwayContent {
                redeem_id: redeem_id.clone(),
                token_id: request.token_id.clone(),
                redeemer: request.redeemer.clone(),
                custodian: custodian.clone(),
                amount: matched.amount,
                seized: settlement.seized,
                released: settlement.released,
            };
            let inst = Instruction::auto(
                InstructionKind::LiquidateRunAway,
                InstructionStatus::Liquidated,
                &content,
            )?;
            emit(env, inst, out)?;
        }
    }
    Ok(())
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: LiquidateRunAwayContent = inst.decode()?;
    let request = env
        .state
        .matched_redeems
        .get(&content.redeem_id)
        .ok_or_else(|| PortalError::mismatch(inst.kind, format!("no matched redeem {}", content.redeem_id)))?;
    let entry_amount = request.custodian(&content.custodian).map(|c| c.amount);
    if entry_amount != Some(content.amount)
        || request.token_id != content.token_id
        || request.redeemer != content.redeemer
    {
        return Err(PortalError::mismatch(inst.kind, "matching entry differs"));
    }
    if request.age(env.block) <= env.params.redeem_return_timeout {
        return Err(PortalError::mismatch(inst.kind, "redeem still within the return window"));
    }

    let holding = env
        .state
        .custodian(&content.custodian)
        .map(|c| c.holding(&content.token_id))
        .unwrap_or(0);
    let holding_locked = env.state.holding_locked(&content.custodian, &content.token_id)?;
    let settlement = settle_run_away(
        env.params,
        env.rates,
        &holding_locked,
        &content.token_id,
        content.amount,
        holding,
    )?;
    if settlement.seized != content.seized || settlement.released != content.released {
        return Err(PortalError::mismatch(inst.kind, "settlement differs"));
    }

    let custodian = env.state.custodian_mut(&content.custodian)?;
    custodian.seize(&content.token_id, &content.seized)?;
    custodian.release(&content.token_id, &content.released)?;
    custodian.settle_reserved(&content.token_id, content.amount)?;
    if !content.seized.is_empty() {
        env.state.liquidation_pool.credit_claim(
            &content.redeem_id,
            &content.redeemer,
            &content.token_id,
            &content.seized,
        )?;
    }

    let liquidated = match env.state.matched_redeems.get_mut(&content.redeem_id) {
        Some(request) => {
            request.remove_custodian(&content.custodian);
            request.custodians.is_empty()
        }
        None => false,
    };
    if liquidated {
        env.state.matched_redeems.remove(&content.redeem_id);
        write_status(
            env.store,
            StatusScope::Redeem,
            &content.redeem_id,
            RequestStatus::Liquidated,
            env.block.beacon_height,
            &inst.content,
        )?;
    }
    warn!(
        "[Portal] Custodian {} ran away from redeem {}: seized {:?}, released {:?}",
        content.custodian, content.redeem_id, content.seized, content.released
    );
    if liquidated {
        info!("[Portal] Redeem {} liquidated, claim opened for {}", content.redeem_id, content.redeemer);
    }
    Ok(())
}
