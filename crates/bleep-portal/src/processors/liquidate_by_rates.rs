use super::expire_porting::emit_expiry;
use super::{emit, BuildEnv, ProcessEnv};
use crate::collateral::CollateralBundle;
use crate::error::PortalError;
use crate::instruction::{Instruction, InstructionKind, InstructionStatus};
use crate::liquidation::plan_rate_liquidation;
use crate::tokens::TokenId;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// A custodian's match on a waiting redeem, dropped by its liquidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledMatch {
    pub redeem_id: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidateByRatesContent {
    pub custodian: String,
    pub token_id: TokenId,
    /// Holding before liquidation
    pub holding: u64,
    pub ratio_percent: u64,
    pub liquidated_amount: u64,
    pub seized: CollateralBundle,
    pub cancelled_matches: Vec<CancelledMatch>,
}

/// Whether the custodian's holding of `token` is below the liquidation threshold
pub(crate) fn below_threshold(env: &ProcessEnv<'_>, custodian: &str, token: &TokenId) -> Result<bool, PortalError> {
    let holding = env.state.custodian(custodian).map(|c| c.holding(token)).unwrap_or(0);
    let holding_locked = env.state.holding_locked(custodian, token)?;
    let plan = plan_rate_liquidation(env.params, env.rates, &holding_locked, token, holding, holding)?;
    Ok(plan.is_some())
}

/// The custodian's matches on waiting redeems of `token`, redeem ID order
fn matches_on_waiting(env: &ProcessEnv<'_>, custodian: &str, token: &TokenId) -> Vec<CancelledMatch> {
    env.state
        .waiting_redeems
        .values()
        .filter(|r| &r.token_id == token)
        .filter_map(|r| {
            r.custodian(custodian).map(|m| CancelledMatch {
                redeem_id: r.redeem_id.clone(),
                amount: m.amount,
            })
        })
        .collect()
}

/// Every custodian (address order) and every token it holds: below the
/// liquidation threshold, its waiting portings for the token expire, its
/// matches on waiting redeems are cancelled and enough holding is burned
/// against seized collateral to restore the target ratio.
pub fn build(env: &mut BuildEnv<'_>, out: &mut Vec<Instruction>) -> Result<(), PortalError> {
    let addresses: Vec<String> = env.ctx.state.custodians.keys().cloned().collect();
    for address in addresses {
        let tokens: Vec<(TokenId, u64)> = match env.ctx.state.custodian(&address) {
            Some(c) => c
                .holding_public_tokens
                .iter()
                .filter(|(_, holding)| **holding > 0)
                .map(|(token, holding)| (token.clone(), *holding))
                .collect(),
            None => continue,
        };
        for (token, holding) in tokens {
            liquidate_one(env, &address, &token, holding, out)?;
        }
    }
    Ok(())
}

fn liquidate_one(
    env: &mut BuildEnv<'_>,
    address: &str,
    token: &TokenId,
    holding: u64,
    out: &mut Vec<Instruction>,
) -> Result<(), PortalError> {
    let triggered = match below_threshold(&env.ctx, address, token) {
        Ok(triggered) => triggered,
        Err(PortalError::MissingExchangeRate(missing)) => {
            warn!(
                "[Portal] Ratio check of {} on {} skipped: no rate for {}",
                address, token, missing
            );
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    if !triggered {
        return Ok(());
    }

    let backed: Vec<String> = env
        .ctx
        .state
        .waiting_porting
        .values()
        .filter(|r| &r.token_id == token && r.is_backed_by(address))
        .map(|r| r.porting_id.clone())
        .collect();
    for porting_id in backed {
        emit_expiry(env, &porting_id, true, out)?;
    }

    let cancelled_matches = matches_on_waiting(&env.ctx, address, token);
    let cancelled_total = cancelled_matches.iter().map(|m| m.amount).sum::<u64>();
    let liquidatable = env
        .ctx
        .state
        .custodian(address)
        .map(|c| c.free_holding(token))
        .unwrap_or(0)
        .saturating_add(cancelled_total);

    // The earlier check already priced every asset involved.
    let holding_locked = env.ctx.state.holding_locked(address, token)?;
    let plan = match plan_rate_liquidation(
        env.ctx.params,
        env.ctx.rates,
        &holding_locked,
        token,
        holding,
        liquidatable,
    )? {
        Some(plan) => plan,
        None => return Ok(()),
    };
    if plan.liquidated_amount == 0 && cancelled_matches.is_empty() {
        warn!(
            "[Portal] Custodian {} at {}% on {} but all holding is reserved",
            address, plan.ratio_percent, token
        );
        return Ok(());
    }

    let content = LiquidateByRatesContent {
        custodian: address.to_string(),
        token_id: token.clone(),
        holding,
        ratio_percent: plan.ratio_percent,
        liquidated_amount: plan.liquidated_amount,
        seized: plan.seized,
        cancelled_matches,
    };
    let inst = Instruction::auto(
        InstructionKind::LiquidateByRates,
        InstructionStatus::Liquidated,
        &content,
    )?;
    emit(env, inst, out)
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: LiquidateByRatesContent = inst.decode()?;
    let token = &content.token_id;
    let holding = env
        .state
        .custodian(&content.custodian)
        .map(|c| c.holding(token))
        .ok_or_else(|| PortalError::mismatch(inst.kind, format!("no custodian {}", content.custodian)))?;
    if holding != content.holding || content.liquidated_amount > holding {
        return Err(PortalError::mismatch(inst.kind, "holding differs"));
    }
    if env
        .state
        .waiting_porting
        .values()
        .any(|r| &r.token_id == token && r.is_backed_by(&content.custodian))
    {
        return Err(PortalError::mismatch(inst.kind, "backed portings still waiting"));
    }
    if matches_on_waiting(env, &content.custodian, token) != content.cancelled_matches {
        return Err(PortalError::mismatch(inst.kind, "cancelled matches differ"));
    }
    let cancelled_total = content.cancelled_matches.iter().map(|m| m.amount).sum::<u64>();
    let liquidatable = env
        .state
        .custodian(&content.custodian)
        .map(|c| c.free_holding(token))
        .unwrap_or(0)
        .saturating_add(cancelled_total);
    let plan = plan_rate_liquidation(
        env.params,
        env.rates,
        &env.state.holding_locked(&content.custodian, token)?,
        token,
        holding,
        liquidatable,
    )?
    .ok_or_else(|| PortalError::mismatch(inst.kind, "custodian above the liquidation threshold"))?;
    if plan.ratio_percent != content.ratio_percent
        || plan.liquidated_amount != content.liquidated_amount
        || plan.seized != content.seized
        || (plan.liquidated_amount == 0 && content.cancelled_matches.is_empty())
    {
        return Err(PortalError::mismatch(inst.kind, "liquidation plan differs"));
    }

    for cancelled in &content.cancelled_matches {
        let request = env
            .state
            .waiting_redeems
            .get_mut(&cancelled.redeem_id)
            .ok_or_else(|| PortalError::mismatch(inst.kind, format!("no waiting redeem {}", cancelled.redeem_id)))?;
        let removed = request.remove_custodian(&content.custodian);
        if &request.token_id != token || removed.map(|m| m.amount) != Some(cancelled.amount) {
            return Err(PortalError::mismatch(inst.kind, "cancelled match differs"));
        }
        request.cancelled_by_liquidation = true;
        env.state
            .custodian_mut(&content.custodian)?
            .release_reservation(token, cancelled.amount)?;
    }

    let holding_locked = env.state.holding_locked(&content.custodian, token)?;
    if !content.seized.fits_within(&holding_locked) {
        return Err(PortalError::mismatch(inst.kind, "seizure exceeds backing collateral"));
    }
    let custodian = env.state.custodian_mut(&content.custodian)?;
    custodian.seize(token, &content.seized)?;
    custodian.reduce_free_holding(token, content.liquidated_amount)?;
    let emptied = custodian.holding(token) == 0;
    env.state
        .liquidation_pool
        .deposit(token, &content.seized, content.liquidated_amount)?;

    // Nothing left to back: the rest of the lock returns to free.
    if emptied {
        let leftover = env.state.holding_locked(&content.custodian, token)?;
        if !leftover.is_empty() {
            debug!(
                "[Portal] Custodian {} fully liquidated on {}, releasing {:?}",
                content.custodian, token, leftover
            );
            env.state
                .custodian_mut(&content.custodian)?
                .release(token, &leftover)?;
        }
    }

    warn!(
        "[Portal] Custodian {} liquidated on {} at {}%: {} burned, seized {:?}, {} match(es) cancelled",
        content.custodian,
        token,
        content.ratio_percent,
        content.liquidated_amount,
        content.seized,
        content.cancelled_matches.len()
    );
    Ok(())
}
