use super::matching_redeem::add_match;
use super::{emit, BuildEnv, ProcessEnv};
use crate::error::PortalError;
use crate::instruction::{Instruction, InstructionKind, InstructionStatus};
use crate::redeem::{pick_custodians, MatchingRedeemCustodian};
use crate::status::{write_status, RequestStatus, StatusScope};
use crate::tokens::TokenId;
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickMoreCustodianContent {
    pub redeem_id: String,
    pub token_id: TokenId,
    pub redeemer: String,
    pub amount: u64,
    /// Matches added to fill the request (status matched)
    pub picked: Vec<MatchingRedeemCustodian>,
    /// Matches released when the request could not be filled (status rejected)
    pub released: Vec<MatchingRedeemCustodian>,
    pub cancelled_by_liquidation: bool,
}

/// Waiting redeems past `redeem_waiting_timeout` are filled from the
/// custodians with the most free holding, or cancelled and refunded.
pub fn build(env: &mut BuildEnv<'_>, out: &mut Vec<Instruction>) -> Result<(), PortalError> {
    let timeout = env.ctx.params.redeem_waiting_timeout;
    let due: Vec<String> = env
        .ctx
        .state
        .waiting_redeems
        .values()
        .filter(|r| r.age(env.ctx.block) > timeout)
        .map(|r| r.redeem_id.clone())
        .collect();

    for redeem_id in due {
        let request = match env.ctx.state.waiting_redeems.get(&redeem_id) {
            Some(request) => request.clone(),
            None => continue,
        };
        let remaining = request.remaining()?;
        let picks = pick_custodians(&env.ctx.state.custodians, &request, remaining);
        let picked_total = picks.iter().map(|p| p.amount).sum::<u64>();

        let (status, content) = if picked_total == remaining {
            (
                InstructionStatus::Matched,
                PickMoreCustodianContent {
                    redeem_id: redeem_id.clone(),
                    token_id: request.token_id.clone(),
                    redeemer: request.redeemer.clone(),
                    amount: request.amount,
                    picked: picks,
                    released: Vec::new(),
                    cancelled_by_liquidation: request.cancelled_by_liquidation,
                },
            )
        } else {
            warn!(
                "[Portal] Redeem {} timed out with {} of {} unmatched; refunding",
                redeem_id, remaining, request.amount
            );
            (
                InstructionStatus::Rejected,
                PickMoreCustodianContent {
                    redeem_id: redeem_id.clone(),
                    token_id: request.token_id.clone(),
                    redeemer: request.redeemer.clone(),
                    amount: request.amount,
                    picked: Vec::new(),
                    released: request.custodians.clone(),
                    cancelled_by_liquidation: request.cancelled_by_liquidation,
                },
            )
        };
        let inst = Instruction::auto(InstructionKind::PickMoreCustodian, status, &content)?;
        emit(env, inst, out)?;
    }
    Ok(())
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: PickMoreCustodianContent = inst.decode()?;
    let request = env
        .state
        .waiting_redeems
        .get(&content.redeem_id)
        .cloned()
        .ok_or_else(|| PortalError::mismatch(inst.kind, format!("no waiting redeem {}", content.redeem_id)))?;
    if request.token_id != content.token_id
        || request.amount != content.amount
        || request.cancelled_by_liquidation != content.cancelled_by_liquidation
    {
        return Err(PortalError::mismatch(inst.kind, "request fields differ"));
    }
    if request.age(env.block) <= env.params.redeem_waiting_timeout {
        return Err(PortalError::mismatch(inst.kind, "redeem still within the waiting window"));
    }
    let remaining = request.remaining()?;
    let picks = pick_custodians(&env.state.custodians, &request, remaining);
    let fillable = picks.iter().map(|p| p.amount).sum::<u64>() == remaining;

    match inst.status {
        InstructionStatus::Matched => {
            if !fillable || picks != content.picked {
                return Err(PortalError::mismatch(inst.kind, "picked matches differ"));
            }
            let mut promoted = false;
            for matched in &content.picked {
                promoted = add_match(env.state, &content.redeem_id, matched)?;
            }
            if !promoted {
                return Err(PortalError::mismatch(inst.kind, "picks do not fill the request"));
            }
            write_status(
                env.store,
                StatusScope::Redeem,
                &content.redeem_id,
                RequestStatus::Matched,
                env.block.beacon_height,
                &inst.content,
            )?;
            info!(
                "[Portal] Redeem {} matched by {} more custodian(s)",
                content.redeem_id,
                content.picked.len()
            );
        }
        InstructionStatus::Rejected => {
            if fillable || request.custodians != content.released {
                return Err(PortalError::mismatch(inst.kind, "released matches differ"));
            }
            for matched in &request.custodians {
                env.state
                    .custodian_mut(&matched.custodian_address)?
                    .release_reservation(&request.token_id, matched.amount)?;
            }
            env.state.waiting_redeems.remove(&content.redeem_id);
            let status = if request.cancelled_by_liquidation {
                RequestStatus::CancelledByLiquidation
            } else {
                RequestStatus::Rejected
            };
            write_status(
                env.store,
                StatusScope::Redeem,
                &content.redeem_id,
                status,
                env.block.beacon_height,
                &inst.content,
            )?;
        }
        other => {
            return Err(PortalError::mismatch(inst.kind, format!("status {}", other.as_str())));
        }
    }
    Ok(())
}
