use super::{accept_tx, accepted, emit, expect_action, BuildEnv, ProcessEnv};
use crate::action::ActionEnvelope;
use crate::error::{BuildError, PortalError, RejectReason};
use crate::instruction::Instruction;
use crate::redeem::MatchingRedeemCustodian;
use crate::state::PortalState;
use crate::status::{write_status, RequestStatus, StatusScope};
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingRedeemContent {
    pub tx_id: String,
    pub redeem_id: String,
    pub matched: MatchingRedeemCustodian,
}

pub fn build(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let (redeem_id, custodian) = expect_action!(envelope, RequestMatchingRedeem { redeem_id, custodian });

    let state = &env.ctx.state;
    let request = state
        .waiting_redeems
        .get(redeem_id)
        .ok_or_else(|| RejectReason::RequestNotFound(redeem_id.clone()))?;
    let holder = state
        .custodian(custodian)
        .ok_or_else(|| RejectReason::CustodianNotFound(custodian.clone()))?;
    let remote_address = holder
        .remote_address(&request.token_id)
        .ok_or_else(|| RejectReason::NoRemoteAddress {
            custodian: custodian.clone(),
            token: request.token_id.clone(),
        })?;
    if request.custodian(custodian).is_some() {
        return Err(RejectReason::AlreadyMatched(custodian.clone()).into());
    }
    let remaining = request.remaining()?;
    let amount = holder.free_holding(&request.token_id).min(remaining);
    if amount == 0 {
        return Err(RejectReason::InsufficientHolding(remaining).into());
    }

    let content = MatchingRedeemContent {
        tx_id: envelope.tx_id.clone(),
        redeem_id: redeem_id.clone(),
        matched: MatchingRedeemCustodian {
            custodian_address: custodian.clone(),
            remote_address: remote_address.to_string(),
            amount,
        },
    };
    emit(env, accepted(envelope, &content)?, out)?;
    Ok(())
}

/// Reserve `matched` on its custodian and append it to a waiting redeem;
/// a redeem whose matches now cover its amount moves to the matched set.
pub(crate) fn add_match(
    state: &mut PortalState,
    redeem_id: &str,
    matched: &MatchingRedeemCustodian,
) -> Result<bool, PortalError> {
    let request = state
        .waiting_redeems
        .get_mut(redeem_id)
        .ok_or_else(|| PortalError::InvariantViolation(format!("no waiting redeem {}", redeem_id)))?;
    if request.custodian(&matched.custodian_address).is_some() {
        return Err(PortalError::Replay(format!(
            "match of {} on {}",
            matched.custodian_address, redeem_id
        )));
    }
    if matched.amount == 0 || matched.amount > request.remaining()? {
        return Err(PortalError::InvariantViolation(format!(
            "redeem {} over-matched by {}",
            redeem_id, matched.custodian_address
        )));
    }
    let token = request.token_id.clone();
    request.custodians.push(matched.clone());
    let promoted = request.is_fully_matched()?;

    state
        .custodian_mut(&matched.custodian_address)?
        .reserve(&token, matched.amount)?;

    if promoted {
        if let Some(request) = state.waiting_redeems.remove(redeem_id) {
            state.matched_redeems.insert(redeem_id.to_string(), request);
        }
    }
    Ok(promoted)
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: MatchingRedeemContent = inst.decode()?;
    let token = env
        .state
        .waiting_redeems
        .get(&content.redeem_id)
        .map(|r| r.token_id.clone())
        .ok_or_else(|| PortalError::mismatch(inst.kind, format!("no waiting redeem {}", content.redeem_id)))?;
    let registered = env
        .state
        .custodian(&content.matched.custodian_address)
        .and_then(|c| c.remote_address(&token));
    if registered != Some(content.matched.remote_address.as_str()) {
        return Err(PortalError::mismatch(inst.kind, "custodian remote address"));
    }

    if add_match(env.state, &content.redeem_id, &content.matched)? {
        write_status(
            env.store,
            StatusScope::Redeem,
            &content.redeem_id,
            RequestStatus::Matched,
            env.block.beacon_height,
            &inst.content,
        )?;
        info!("[Portal] Redeem {} fully matched", content.redeem_id);
    }
    accept_tx(env, &content.tx_id, inst)
}
