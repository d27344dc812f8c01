// INSTRUCTION PROCESSORS
//
// SAFETY INVARIANTS:
// 1. The dispatch table is closed: one {build, process} pair per
//    InstructionKind, built once from an exhaustive match
// 2. A builder never mutates the working state directly; every produced
//    instruction is applied through the same process fn the validators run
// 3. Builders finish every check before emitting, so a rejected action
//    leaves nothing behind but its rejected instruction
// 4. A process fn either applies the whole instruction or returns an error
//    that rejects the block

pub mod custodian_deposit;
pub mod expire_porting;
pub mod liquidate_by_rates;
pub mod liquidate_run_away;
pub mod liquidation_pool;
pub mod matching_redeem;
pub mod pick_more_custodian;
pub mod porting_request;
pub mod redeem_request;
pub mod request_ptokens;
pub mod reward;
pub mod topup;
pub mod unlock_collateral;
pub mod withdraw;

use crate::action::{ActionEnvelope, PortalAction};
use crate::engine::BlockContext;
use crate::error::{BuildError, PortalError, RejectReason};
use crate::exchange_rates::FinalExchangeRates;
use crate::instruction::{Instruction, InstructionKind, InstructionStatus};
use crate::params::PortalParams;
use crate::proof::{ExternalProof, VerifierRegistry};
use crate::state::PortalState;
use crate::status::{write_status, RequestStatus, StatusScope};
use crate::store::{is_external_tx_consumed, mark_external_tx_consumed, PortalStore};
use crate::tokens::ExternalChain;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a process fn may touch: the working state and the (staged) store.
/// Rates are the block's final table; auto instructions are re-priced with it.
pub struct ProcessEnv<'a> {
    pub params: &'a PortalParams,
    pub block: &'a BlockContext,
    pub rates: &'a FinalExchangeRates,
    pub state: &'a mut PortalState,
    pub store: &'a mut dyn PortalStore,
}

/// What a builder sees on top of the process environment
pub struct BuildEnv<'a> {
    pub verifiers: &'a VerifierRegistry,
    pub table: &'a ProcessorTable,
    pub ctx: ProcessEnv<'a>,
}

pub type UserBuildFn =
    fn(&mut BuildEnv<'_>, &ActionEnvelope, &mut Vec<Instruction>) -> Result<(), BuildError>;
pub type AutoBuildFn = fn(&mut BuildEnv<'_>, &mut Vec<Instruction>) -> Result<(), PortalError>;
pub type ProcessFn = fn(&mut ProcessEnv<'_>, &Instruction) -> Result<(), PortalError>;

/// How instructions of a kind come into existence
#[derive(Clone, Copy)]
pub enum Builder {
    /// From a queued user action
    User(UserBuildFn),
    /// Once per block, without an originating action
    Auto(AutoBuildFn),
    /// Only as a by-product of another kind's builder
    Derived,
}

#[derive(Clone, Copy)]
pub struct ProcessorEntry {
    pub kind: InstructionKind,
    pub build: Builder,
    pub process: ProcessFn,
}

pub struct ProcessorTable {
    entries: BTreeMap<InstructionKind, ProcessorEntry>,
}

impl Default for ProcessorTable {
    fn default() -> Self {
        ProcessorTable::new()
    }
}

impl ProcessorTable {
    pub fn new() -> Self {
        let entries = InstructionKind::ALL
            .iter()
            .map(|kind| (*kind, entry_for(*kind)))
            .collect();
        ProcessorTable { entries }
    }

    pub fn entry(&self, kind: InstructionKind) -> Result<&ProcessorEntry, PortalError> {
        self.entries
            .get(&kind)
            .ok_or_else(|| PortalError::UnknownInstructionKind(kind.code().to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply one instruction. Rejected user instructions share one handler.
    pub fn process(&self, env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
        let entry = self.entry(inst.kind)?;
        if inst.status == InstructionStatus::Rejected && matches!(entry.build, Builder::User(_)) {
            return process_rejected(env, inst);
        }
        (entry.process)(env, inst)
    }
}

fn entry_for(kind: InstructionKind) -> ProcessorEntry {
    let (build, process): (Builder, ProcessFn) = match kind {
        InstructionKind::CustodianDeposit => (
            Builder::User(custodian_deposit::build),
            custodian_deposit::process,
        ),
        InstructionKind::CustodianTopup => (Builder::User(topup::build), topup::process),
        InstructionKind::PortingRequest => (
            Builder::User(porting_request::build),
            porting_request::process,
        ),
        InstructionKind::RequestPTokens => (
            Builder::User(request_ptokens::build),
            request_ptokens::process,
        ),
        InstructionKind::RedeemRequest => (
            Builder::User(redeem_request::build),
            redeem_request::process,
        ),
        InstructionKind::RequestMatchingRedeem => (
            Builder::User(matching_redeem::build),
            matching_redeem::process,
        ),
        InstructionKind::RequestUnlockCollateral => (
            Builder::User(unlock_collateral::build),
            unlock_collateral::process,
        ),
        InstructionKind::WithdrawCollateral => (Builder::User(withdraw::build), withdraw::process),
        InstructionKind::ConfirmWithdraw => (Builder::Derived, withdraw::process_confirm),
        InstructionKind::ClaimLiquidationCompensation => (
            Builder::User(liquidation_pool::build_claim),
            liquidation_pool::process_claim,
        ),
        InstructionKind::RedeemFromLiquidationPool => (
            Builder::User(liquidation_pool::build_redeem),
            liquidation_pool::process_redeem,
        ),
        InstructionKind::WithdrawReward => (
            Builder::User(reward::build_withdraw),
            reward::process_withdraw,
        ),
        InstructionKind::LiquidateRunAway => (
            Builder::Auto(liquidate_run_away::build),
            liquidate_run_away::process,
        ),
        InstructionKind::ExpiredPorting => (
            Builder::Auto(expire_porting::build),
            expire_porting::process,
        ),
        InstructionKind::PickMoreCustodian => (
            Builder::Auto(pick_more_custodian::build),
            pick_more_custodian::process,
        ),
        InstructionKind::LiquidateByRates => (
            Builder::Auto(liquidate_by_rates::build),
            liquidate_by_rates::process,
        ),
        InstructionKind::Reward => (Builder::Auto(reward::build), reward::process),
    };
    ProcessorEntry {
        kind,
        build,
        process,
    }
}

/// Apply `inst` to the working state, then append it to the block
pub(crate) fn emit(
    env: &mut BuildEnv<'_>,
    inst: Instruction,
    out: &mut Vec<Instruction>,
) -> Result<(), PortalError> {
    let table = env.table;
    table.process(&mut env.ctx, &inst)?;
    out.push(inst);
    Ok(())
}

/// Content of every rejected user instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedContent {
    pub tx_id: String,
    pub reason: String,
    pub action: PortalAction,
}

pub(crate) fn reject(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    reason: &RejectReason,
    out: &mut Vec<Instruction>,
) -> Result<(), PortalError> {
    warn!(
        "[Portal] Rejected {} tx {} (shard {}): {}",
        envelope.kind(),
        envelope.tx_id,
        envelope.shard_id,
        reason
    );
    let content = RejectedContent {
        tx_id: envelope.tx_id.clone(),
        reason: reason.to_string(),
        action: envelope.action.clone(),
    };
    let inst = Instruction::new(
        envelope.kind(),
        i32::from(envelope.shard_id),
        InstructionStatus::Rejected,
        &content,
    )?;
    emit(env, inst, out)
}

fn process_rejected(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: RejectedContent = inst.decode()?;
    if content.action.kind() != inst.kind {
        return Err(PortalError::mismatch(inst.kind, "rejected action of another kind"));
    }
    write_status(
        env.store,
        StatusScope::Tx,
        &content.tx_id,
        RequestStatus::Rejected,
        env.block.beacon_height,
        &inst.content,
    )
}

/// Accepted instruction for a user action
pub(crate) fn accepted<T: Serialize>(
    envelope: &ActionEnvelope,
    content: &T,
) -> Result<Instruction, PortalError> {
    Instruction::new(
        envelope.kind(),
        i32::from(envelope.shard_id),
        InstructionStatus::Accepted,
        content,
    )
}

pub(crate) fn accept_tx(
    env: &mut ProcessEnv<'_>,
    tx_id: &str,
    inst: &Instruction,
) -> Result<(), PortalError> {
    write_status(
        env.store,
        StatusScope::Tx,
        tx_id,
        RequestStatus::Accepted,
        env.block.beacon_height,
        &inst.content,
    )
}

/// Build-side proof gate: right chain, external tx not yet consumed
pub(crate) fn check_external_proof(
    env: &BuildEnv<'_>,
    proof: &ExternalProof,
    chain: ExternalChain,
) -> Result<String, BuildError> {
    if proof.chain != chain {
        return Err(RejectReason::WrongChain {
            expected: chain,
            actual: proof.chain,
        }
        .into());
    }
    let unique_id = proof.unique_tx_id();
    if is_external_tx_consumed(&*env.ctx.store, &unique_id).map_err(PortalError::from)? {
        return Err(RejectReason::ExternalTxReplayed(unique_id).into());
    }
    Ok(unique_id)
}

/// Process-side replay guard
pub(crate) fn consume_external_tx(env: &mut ProcessEnv<'_>, unique_id: &str) -> Result<(), PortalError> {
    if is_external_tx_consumed(&*env.store, unique_id)? {
        return Err(PortalError::Replay(format!("external tx {}", unique_id)));
    }
    mark_external_tx_consumed(env.store, unique_id)?;
    Ok(())
}

/// Unwrap the user action a builder was dispatched for
macro_rules! expect_action {
    ($envelope:expr, $variant:ident { $($field:ident),* $(,)? }) => {
        match &$envelope.action {
            crate::action::PortalAction::$variant { $($field),*, .. } => ($($field),*),
            _ => {
                return Err(crate::error::BuildError::Fault(crate::error::PortalError::mismatch(
                    $envelope.kind(),
                    "dispatched to the wrong builder",
                )))
            }
        }
    };
}
pub(crate) use expect_action;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::proof::VerifierRegistry;
    use crate::store::MemoryStore;

    /// Everything a processor test needs, owned in one place
    pub struct Fixture {
        pub params: PortalParams,
        pub block: BlockContext,
        pub state: PortalState,
        pub store: MemoryStore,
        pub rates: FinalExchangeRates,
        pub verifiers: VerifierRegistry,
        pub table: ProcessorTable,
    }

    impl Fixture {
        pub fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            Fixture {
                params: PortalParams::default(),
                block: BlockContext::new(10).with_shard_height(0, 100),
                state: PortalState::genesis(),
                store: MemoryStore::new(),
                rates: FinalExchangeRates::new(10)
                    .with_rate("prv", 1)
                    .with_rate("pbtc", 10)
                    .with_rate("usdt", 1)
                    .with_rate("dai", 1),
                verifiers: VerifierRegistry::passthrough(),
                table: ProcessorTable::new(),
            }
        }

        pub fn build_env(&mut self) -> BuildEnv<'_> {
            BuildEnv {
                verifiers: &self.verifiers,
                table: &self.table,
                ctx: ProcessEnv {
                    params: &self.params,
                    block: &self.block,
                    rates: &self.rates,
                    state: &mut self.state,
                    store: &mut self.store,
                },
            }
        }

        /// Run one user action through its builder, rejecting like the engine
        pub fn submit(&mut self, envelope: ActionEnvelope) -> Vec<Instruction> {
            let mut out = Vec::new();
            let mut env = self.build_env();
            let entry = *env.table.entry(envelope.kind()).unwrap();
            let outcome = match envelope.validate_schema(env.ctx.params) {
                Err(reason) => Err(BuildError::Reject(reason)),
                Ok(()) => match entry.build {
                    Builder::User(build) => build(&mut env, &envelope, &mut out),
                    _ => panic!("not a user kind"),
                },
            };
            match outcome {
                Ok(()) => {}
                Err(BuildError::Reject(reason)) => reject(&mut env, &envelope, &reason, &mut out).unwrap(),
                Err(BuildError::Fault(err)) => panic!("fault: {}", err),
            }
            out
        }

        /// Run one auto builder
        pub fn run_auto(&mut self, kind: InstructionKind) -> Vec<Instruction> {
            let mut out = Vec::new();
            let mut env = self.build_env();
            match env.table.entry(kind).unwrap().build {
                Builder::Auto(build) => build(&mut env, &mut out).unwrap(),
                _ => panic!("not an auto kind"),
            }
            out
        }

        pub fn process(&mut self, inst: &Instruction) -> Result<(), PortalError> {
            let mut env = ProcessEnv {
                params: &self.params,
                block: &self.block,
                rates: &self.rates,
                state: &mut self.state,
                store: &mut self.store,
            };
            self.table.process(&mut env, inst)
        }
    }
}
