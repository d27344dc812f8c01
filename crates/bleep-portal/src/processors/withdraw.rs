use super::{accept_tx, accepted, emit, expect_action, BuildEnv, ProcessEnv};
use crate::action::ActionEnvelope;
use crate::error::{BuildError, PortalError, RejectReason};
use crate::instruction::{Instruction, InstructionKind, InstructionStatus};
use crate::status::{read_status, write_status, RequestStatus, StatusScope};
use crate::tokens::{CollateralKind, TokenId};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawCollateralContent {
    pub tx_id: String,
    pub custodian: String,
    pub collateral: CollateralKind,
    pub amount: u64,
    pub external_address: Option<String>,
}

/// Release order for the external vault, derived from an accepted
/// third-party collateral withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmWithdrawContent {
    /// Tx ID of the originating withdrawal
    pub withdraw_id: String,
    pub custodian: String,
    pub token_id: TokenId,
    pub external_address: String,
    pub amount: u64,
    pub beacon_height: u64,
    pub confirmation_hash: String,
}

impl ConfirmWithdrawContent {
    pub fn new(
        withdraw_id: &str,
        custodian: &str,
        token_id: &TokenId,
        external_address: &str,
        amount: u64,
        beacon_height: u64,
    ) -> Self {
        let mut content = ConfirmWithdrawContent {
            withdraw_id: withdraw_id.to_string(),
            custodian: custodian.to_string(),
            token_id: token_id.clone(),
            external_address: external_address.to_string(),
            amount,
            beacon_height,
            confirmation_hash: String::new(),
        };
        content.confirmation_hash = content.compute_hash();
        content
    }

    /// SHA-256 over every field but the hash itself; the vault checks it
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.withdraw_id.as_str(),
            self.custodian.as_str(),
            self.token_id.as_str(),
            self.external_address.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.amount.to_le_bytes());
        hasher.update(self.beacon_height.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

pub fn build(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let (custodian, collateral, amount, external_address) = expect_action!(
        envelope,
        WithdrawCollateral { custodian, collateral, amount, external_address }
    );

    let holder = env
        .ctx
        .state
        .custodian(custodian)
        .ok_or_else(|| RejectReason::CustodianNotFound(custodian.clone()))?;
    let free = holder.free_of(collateral);
    if *amount > free {
        return Err(RejectReason::InsufficientFreeCollateral {
            free,
            requested: *amount,
        }
        .into());
    }

    let content = WithdrawCollateralContent {
        tx_id: envelope.tx_id.clone(),
        custodian: custodian.clone(),
        collateral: collateral.clone(),
        amount: *amount,
        external_address: external_address.clone(),
    };
    emit(env, accepted(envelope, &content)?, out)?;

    if let (CollateralKind::Token(token), Some(address)) = (collateral, external_address) {
        let confirm = ConfirmWithdrawContent::new(
            &envelope.tx_id,
            custodian,
            token,
            address,
            *amount,
            env.ctx.block.beacon_height,
        );
        let inst = Instruction::new(
            InstructionKind::ConfirmWithdraw,
            i32::from(envelope.shard_id),
            InstructionStatus::Accepted,
            &confirm,
        )?;
        emit(env, inst, out)?;
    }
    Ok(())
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: WithdrawCollateralContent = inst.decode()?;
    if let CollateralKind::Token(_) = content.collateral {
        if content.external_address.is_none() {
            return Err(PortalError::mismatch(inst.kind, "token withdrawal without external address"));
        }
    }
    env.state
        .custodian_mut(&content.custodian)?
        .withdraw(&content.collateral, content.amount)?;
    info!(
        "[Portal] Custodian {} withdrew {} {}",
        content.custodian, content.amount, content.collateral
    );
    accept_tx(env, &content.tx_id, inst)
}

/// Check the release order against the accepted withdrawal it derives
/// from, then close the withdrawal
pub fn process_confirm(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    if inst.status != InstructionStatus::Accepted {
        return Err(PortalError::mismatch(inst.kind, format!("status {}", inst.status.as_str())));
    }
    let content: ConfirmWithdrawContent = inst.decode()?;
    if content.confirmation_hash != content.compute_hash() {
        return Err(PortalError::mismatch(inst.kind, "confirmation hash"));
    }
    if content.beacon_height != env.block.beacon_height {
        return Err(PortalError::mismatch(inst.kind, "beacon height"));
    }

    let record = read_status(&*env.store, StatusScope::Tx, &content.withdraw_id)?
        .filter(|r| r.status == RequestStatus::Accepted)
        .ok_or_else(|| PortalError::mismatch(inst.kind, format!("no accepted withdrawal {}", content.withdraw_id)))?;
    let withdrawal: WithdrawCollateralContent = serde_json::from_str(&record.content)
        .map_err(|e| PortalError::MalformedInstruction(e.to_string()))?;
    let matches = withdrawal.custodian == content.custodian
        && withdrawal.amount == content.amount
        && withdrawal.collateral == CollateralKind::Token(content.token_id.clone())
        && withdrawal.external_address.as_deref() == Some(content.external_address.as_str());
    if !matches {
        return Err(PortalError::mismatch(inst.kind, "withdrawal differs"));
    }

    write_status(
        env.store,
        StatusScope::Tx,
        &content.withdraw_id,
        RequestStatus::Success,
        env.block.beacon_height,
        &inst.content,
    )?;
    info!(
        "[Portal] Vault release of {} {} to {} confirmed ({})",
        content.amount, content.token_id, content.external_address, content.confirmation_hash
    );
    Ok(())
}
