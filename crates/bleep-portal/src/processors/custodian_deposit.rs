use super::{accept_tx, accepted, emit, expect_action, BuildEnv, ProcessEnv};
use crate::action::ActionEnvelope;
use crate::custodian::CustodianState;
use crate::error::{BuildError, PortalError};
use crate::instruction::Instruction;
use crate::tokens::TokenId;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianDepositContent {
    pub tx_id: String,
    pub custodian: String,
    pub amount: u64,
    pub remote_addresses: BTreeMap<TokenId, String>,
}

pub fn build(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let (custodian, amount, remote_addresses) =
        expect_action!(envelope, CustodianDeposit { custodian, amount, remote_addresses });

    let content = CustodianDepositContent {
        tx_id: envelope.tx_id.clone(),
        custodian: custodian.clone(),
        amount: *amount,
        remote_addresses: remote_addresses.clone(),
    };
    emit(env, accepted(envelope, &content)?, out)?;
    Ok(())
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: CustodianDepositContent = inst.decode()?;
    let custodian = env
        .state
        .custodians
        .entry(content.custodian.clone())
        .or_insert_with(|| CustodianState::new(content.custodian.clone()));
    custodian.deposit_native(content.amount)?;
    custodian.register_remote_addresses(&content.remote_addresses);
    info!(
        "[Portal] Custodian {} deposited {} (free {})",
        content.custodian, content.amount, custodian.free_collateral
    );
    accept_tx(env, &content.tx_id, inst)
}
