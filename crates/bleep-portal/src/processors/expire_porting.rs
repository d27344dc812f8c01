use super::liquidate_by_rates::below_threshold;
use super::{emit, BuildEnv, ProcessEnv};
use crate::error::PortalError;
use crate::instruction::{Instruction, InstructionKind, InstructionStatus};
use crate::porting::MatchingPortingCustodian;
use crate::status::{write_status, RequestStatus, StatusScope};
use crate::tokens::TokenId;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredPortingContent {
    pub porting_id: String,
    pub token_id: TokenId,
    /// Emitted by a rate liquidation of one of the backing custodians
    pub by_liquidation: bool,
    pub custodians: Vec<MatchingPortingCustodian>,
}

pub fn build(env: &mut BuildEnv<'_>, out: &mut Vec<Instruction>) -> Result<(), PortalError> {
    let timeout = env.ctx.params.porting_timeout;
    let due: Vec<String> = env
        .ctx
        .state
        .waiting_porting
        .values()
        .filter(|r| r.is_expired(env.ctx.block, timeout))
        .map(|r| r.porting_id.clone())
        .collect();
    for porting_id in due {
        emit_expiry(env, &porting_id, false, out)?;
    }
    Ok(())
}

/// Expire one waiting porting request, returning every lock to its custodian
pub(crate) fn emit_expiry(
    env: &mut BuildEnv<'_>,
    porting_id: &str,
    by_liquidation: bool,
    out: &mut Vec<Instruction>,
) -> Result<(), PortalError> {
    let request = match env.ctx.state.waiting_porting.get(porting_id) {
        Some(request) => request.clone(),
        None => return Ok(()),
    };
    let status = if by_liquidation {
        InstructionStatus::Liquidated
    } else {
        InstructionStatus::Expired
    };
    let content = ExpiredPortingContent {
        porting_id: request.porting_id,
        token_id: request.token_id,
        by_liquidation,
        custodians: request.custodians,
    };
    let inst = Instruction::auto(InstructionKind::ExpiredPorting, status, &content)?;
    emit(env, inst, out)
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: ExpiredPortingContent = inst.decode()?;
    let expected_status = if content.by_liquidation {
        InstructionStatus::Liquidated
    } else {
        InstructionStatus::Expired
    };
    if inst.status != expected_status {
        return Err(PortalError::mismatch(inst.kind, format!("status {}", inst.status.as_str())));
    }
    let request = env
        .state
        .waiting_porting
        .get(&content.porting_id)
        .cloned()
        .ok_or_else(|| PortalError::mismatch(inst.kind, format!("no waiting porting {}", content.porting_id)))?;
    if request.token_id != content.token_id || request.custodians != content.custodians {
        return Err(PortalError::mismatch(inst.kind, "allocation differs"));
    }
    if content.by_liquidation {
        let mut liquidating = false;
        for matched in &request.custodians {
            match below_threshold(env, &matched.custodian_address, &request.token_id) {
                Ok(true) => {
                    liquidating = true;
                    break;
                }
                Ok(false) | Err(PortalError::MissingExchangeRate(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if !liquidating {
            return Err(PortalError::mismatch(inst.kind, "no backing custodian under liquidation"));
        }
    } else if !request.is_expired(env.block, env.params.porting_timeout) {
        return Err(PortalError::mismatch(inst.kind, "porting not yet expired"));
    }
    env.state.waiting_porting.remove(&content.porting_id);

    for matched in &request.custodians {
        env.state
            .custodian_mut(&matched.custodian_address)?
            .release(&request.token_id, &matched.locked_collateral)?;
    }

    let status = if content.by_liquidation {
        RequestStatus::Liquidated
    } else {
        RequestStatus::Expired
    };
    write_status(
        env.store,
        StatusScope::Porting,
        &content.porting_id,
        status,
        env.block.beacon_height,
        &inst.content,
    )?;
    info!(
        "[Portal] Porting {} {}: {} custodian lock(s) returned",
        content.porting_id,
        status.as_str(),
        request.custodians.len()
    );
    Ok(())
}
