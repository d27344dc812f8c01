use super::{
    accept_tx, accepted, check_external_proof, consume_external_tx, emit, expect_action, BuildEnv,
    ProcessEnv,
};
use crate::action::ActionEnvelope;
use crate::error::{BuildError, PortalError, RejectReason};
use crate::instruction::Instruction;
use crate::proof::{topup_memo, ExpectedPayment};
use crate::tokens::CollateralKind;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupContent {
    pub tx_id: String,
    pub custodian: String,
    pub collateral: CollateralKind,
    pub amount: u64,
    /// Consumed external deposit, third-party collateral only
    pub external_tx_id: Option<String>,
}

pub fn build(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let (custodian, collateral, amount, proof) =
        expect_action!(envelope, CustodianTopup { custodian, collateral, amount, proof });

    if env.ctx.state.custodian(custodian).is_none() {
        return Err(RejectReason::CustodianNotFound(custodian.clone()).into());
    }

    let external_tx_id = match collateral {
        CollateralKind::Native => None,
        CollateralKind::Token(token) => {
            let config = env
                .ctx
                .params
                .collateral_token(token)
                .ok_or_else(|| RejectReason::UnsupportedCollateral(token.clone()))?;
            let proof = proof
                .as_ref()
                .ok_or_else(|| RejectReason::ProofRequired(format!("{} topup", token)))?;
            let unique_id = check_external_proof(env, proof, config.chain)?;
            let expected = ExpectedPayment {
                address: config.vault_address.clone(),
                token_id: token.clone(),
                amount: *amount,
            };
            let receipt = env
                .verifiers
                .verify(proof, &topup_memo(custodian), std::slice::from_ref(&expected))?;
            if !receipt.pays(&expected) {
                return Err(RejectReason::Mismatch {
                    field: "topup payment",
                    expected: format!("{} {} to {}", expected.amount, token, expected.address),
                    actual: format!("{:?}", receipt.payments),
                }
                .into());
            }
            Some(unique_id)
        }
    };

    let content = TopupContent {
        tx_id: envelope.tx_id.clone(),
        custodian: custodian.clone(),
        collateral: collateral.clone(),
        amount: *amount,
        external_tx_id,
    };
    emit(env, accepted(envelope, &content)?, out)?;
    Ok(())
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: TopupContent = inst.decode()?;
    match (&content.collateral, &content.external_tx_id) {
        (CollateralKind::Token(_), Some(unique_id)) => consume_external_tx(env, unique_id)?,
        (CollateralKind::Native, None) => {}
        _ => return Err(PortalError::mismatch(inst.kind, "proof presence does not match collateral kind")),
    }
    env.state
        .custodian_mut(&content.custodian)?
        .deposit(&content.collateral, content.amount)?;
    info!(
        "[Portal] Custodian {} topped up {} {}",
        content.custodian, content.amount, content.collateral
    );
    accept_tx(env, &content.tx_id, inst)
}
