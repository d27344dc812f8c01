use super::{
    accept_tx, accepted, check_external_proof, consume_external_tx, emit, expect_action, BuildEnv,
    ProcessEnv,
};
use crate::action::ActionEnvelope;
use crate::collateral::CollateralBundle;
use crate::error::{BuildError, PortalError, RejectReason};
use crate::instruction::Instruction;
use crate::proof::{redeem_memo, ExpectedPayment};
use crate::state::PortalState;
use crate::status::{write_status, RequestStatus, StatusScope};
use crate::tokens::TokenId;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockCollateralContent {
    pub tx_id: String,
    pub redeem_id: String,
    pub token_id: TokenId,
    pub custodian: String,
    pub amount: u64,
    pub unlocked: CollateralBundle,
    pub external_tx_id: String,
}

/// The custodian's proportional share of the collateral backing its
/// holding; paying out the whole holding releases everything.
pub(crate) fn unlock_share(
    state: &PortalState,
    custodian: &str,
    token: &TokenId,
    amount: u64,
) -> Result<CollateralBundle, PortalError> {
    let holding = state.custodian(custodian).map(|c| c.holding(token)).unwrap_or(0);
    state.holding_locked(custodian, token)?.share(amount, holding)
}

pub fn build(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let (redeem_id, token_id, custodian, amount, proof) = expect_action!(
        envelope,
        RequestUnlockCollateral { redeem_id, token_id, custodian, amount, proof }
    );

    let request = env
        .ctx
        .state
        .matched_redeems
        .get(redeem_id)
        .cloned()
        .ok_or_else(|| RejectReason::RequestNotFound(redeem_id.clone()))?;
    if &request.token_id != token_id {
        return Err(RejectReason::Mismatch {
            field: "token_id",
            expected: request.token_id.to_string(),
            actual: token_id.to_string(),
        }
        .into());
    }
    let matched = request
        .custodian(custodian)
        .ok_or_else(|| RejectReason::CustodianNotFound(custodian.clone()))?;
    if matched.amount != *amount {
        return Err(RejectReason::Mismatch {
            field: "amount",
            expected: matched.amount.to_string(),
            actual: amount.to_string(),
        }
        .into());
    }

    let chain = env
        .ctx
        .params
        .portal_token(token_id)
        .map(|config| config.chain)
        .ok_or_else(|| RejectReason::UnsupportedToken(token_id.clone()))?;
    let external_tx_id = check_external_proof(env, proof, chain)?;
    let expected = ExpectedPayment {
        address: request.redeemer_remote_address.clone(),
        token_id: token_id.clone(),
        amount: *amount,
    };
    env.verifiers
        .verify(proof, &redeem_memo(redeem_id), std::slice::from_ref(&expected))?;

    let unlocked = unlock_share(env.ctx.state, custodian, token_id, *amount)?;
    let content = UnlockCollateralContent {
        tx_id: envelope.tx_id.clone(),
        redeem_id: redeem_id.clone(),
        token_id: token_id.clone(),
        custodian: custodian.clone(),
        amount: *amount,
        unlocked,
        external_tx_id,
    };
    emit(env, accepted(envelope, &content)?, out)?;
    Ok(())
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: UnlockCollateralContent = inst.decode()?;
    let request = env
        .state
        .matched_redeems
        .get(&content.redeem_id)
        .ok_or_else(|| PortalError::mismatch(inst.kind, format!("no matched redeem {}", content.redeem_id)))?;
    let entry_amount = request.custodian(&content.custodian).map(|c| c.amount);
    if entry_amount != Some(content.amount) || request.token_id != content.token_id {
        return Err(PortalError::mismatch(inst.kind, "matching entry differs"));
    }

    let expected = unlock_share(env.state, &content.custodian, &content.token_id, content.amount)?;
    if expected != content.unlocked {
        return Err(PortalError::mismatch(inst.kind, "unlocked collateral differs"));
    }
    consume_external_tx(env, &content.external_tx_id)?;

    let custodian = env.state.custodian_mut(&content.custodian)?;
    custodian.release(&content.token_id, &content.unlocked)?;
    custodian.settle_reserved(&content.token_id, content.amount)?;

    let fulfilled = match env.state.matched_redeems.get_mut(&content.redeem_id) {
        Some(request) => {
            request.remove_custodian(&content.custodian);
            request.custodians.is_empty()
        }
        None => false,
    };
    if fulfilled {
        env.state.matched_redeems.remove(&content.redeem_id);
        write_status(
            env.store,
            StatusScope::Redeem,
            &content.redeem_id,
            RequestStatus::Success,
            env.block.beacon_height,
            &inst.content,
        )?;
        info!("[Portal] Redeem {} fulfilled", content.redeem_id);
    }
    info!(
        "[Portal] Custodian {} paid {} {} on redeem {}, unlocked {:?}",
        content.custodian, content.amount, content.token_id, content.redeem_id, content.unlocked
    );
    accept_tx(env, &content.tx_id, inst)
}
