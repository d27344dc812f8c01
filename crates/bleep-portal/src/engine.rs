// PORTAL CONTROL LOOP
//
// SAFETY INVARIANTS:
// 1. build_block and process_block are pure functions of (store, block,
//    rates, actions): same input, same instructions, same fingerprint
// 2. Per block: auto instructions in fixed order, then user actions in
//    sorted order, then the reward distribution
// 3. Every produced instruction was already applied to the producer's
//    working copy by the process fn validators run
// 4. process_block commits nothing unless every instruction applied and the
//    resulting state passed verify_invariants
// 5. Auto instructions are re-priced against the block's final rates; ages
//    and liquidation plans are recomputed, never taken from the instruction

use crate::action::ActionEnvelope;
use crate::error::{BuildError, PortalError};
use crate::exchange_rates::ExchangeRateProvider;
use crate::instruction::{Instruction, InstructionKind};
use crate::params::PortalParams;
use crate::processors::{reject, BuildEnv, Builder, ProcessEnv, ProcessorTable};
use crate::proof::VerifierRegistry;
use crate::state::PortalState;
use crate::status::{read_status, StatusScope};
use crate::store::{commit, PortalStore, StagedStore};
use crate::tokens::ShardId;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Auto instructions built before any user action, in this order
pub const AUTO_ORDER: [InstructionKind; 4] = [
    InstructionKind::LiquidateRunAway,
    InstructionKind::ExpiredPorting,
    InstructionKind::PickMoreCustodian,
    InstructionKind::LiquidateByRates,
];

/// Heights a block is evaluated at. Request ages are measured in blocks of
/// the shard that created the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub beacon_height: u64,
    /// Latest height of every shard as seen by this beacon block
    pub shard_heights: BTreeMap<ShardId, u64>,
}

impl BlockContext {
    pub fn new(beacon_height: u64) -> Self {
        BlockContext {
            beacon_height,
            shard_heights: BTreeMap::new(),
        }
    }

    pub fn with_shard_height(mut self, shard_id: ShardId, height: u64) -> Self {
        self.shard_heights.insert(shard_id, height);
        self
    }

    pub fn shard_height(&self, shard_id: ShardId) -> Option<u64> {
        self.shard_heights.get(&shard_id).copied()
    }

    /// Shard blocks elapsed since `since_height`; 0 for an unknown shard
    pub fn age(&self, shard_id: ShardId, since_height: u64) -> u64 {
        self.shard_height(shard_id)
            .map(|current| current.saturating_sub(since_height))
            .unwrap_or(0)
    }
}

/// Result of building one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOutput {
    pub instructions: Vec<Instruction>,
    /// Fingerprint of the state the instructions lead to
    pub state_fingerprint: String,
}

pub struct PortalEngine {
    params: PortalParams,
    table: ProcessorTable,
    verifiers: VerifierRegistry,
}

impl PortalEngine {
    pub fn new(params: PortalParams, verifiers: VerifierRegistry) -> Result<Self, PortalError> {
        params.validate()?;
        Ok(PortalEngine {
            params,
            table: ProcessorTable::new(),
            verifiers,
        })
    }

    pub fn params(&self) -> &PortalParams {
        &self.params
    }

    /// Produce the portal instructions of one beacon block.
    ///
    /// Runs against a private working copy of the state and a staged view of
    /// the store; nothing is written to `store`.
    ///
    /// # Arguments
    /// * `block` - Beacon height and the shard heights it has seen
    /// * `store` - Durable state as of the previous block
    /// * `rates` - Source of the block's final exchange rates
    /// * `actions` - User actions forwarded by the shards, in any order
    ///
    /// # Returns
    /// - `Ok(BlockOutput)` with every instruction, rejected ones included
    /// - `Err(PortalError)` on a hard fault; no block can be produced
    pub fn build_block(
        &self,
        block: &BlockContext,
        store: &dyn PortalStore,
        rates: &dyn ExchangeRateProvider,
        actions: &[ActionEnvelope],
    ) -> Result<BlockOutput, PortalError> {
        let rates = rates.final_rates(block.beacon_height)?;
        let mut state = PortalState::load(store)?;
        let mut staged = StagedStore::new(store);
        let mut out = Vec::new();

        let mut env = BuildEnv {
            verifiers: &self.verifiers,
            table: &self.table,
            ctx: ProcessEnv {
                params: &self.params,
                block,
                rates: &rates,
                state: &mut state,
                store: &mut staged,
            },
        };

        for kind in AUTO_ORDER {
            run_auto(&mut env, kind, &mut out)?;
        }

        let mut sorted: Vec<&ActionEnvelope> = actions.iter().collect();
        sorted.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        for envelope in sorted {
            if read_status(&*env.ctx.store, StatusScope::Tx, &envelope.tx_id)?.is_some() {
                warn!(
                    "[Portal] Skipping {} tx {}: already processed",
                    envelope.kind(),
                    envelope.tx_id
                );
                continue;
            }
            build_user(&mut env, envelope, &mut out)?;
        }

        run_auto(&mut env, InstructionKind::Reward, &mut out)?;

        state.verify_invariants()?;
        let state_fingerprint = state.fingerprint()?;
        info!(
            "[Portal] Built beacon block {}: {} instruction(s) from {} action(s), state {}",
            block.beacon_height,
            out.len(),
            actions.len(),
            state_fingerprint
        );
        Ok(BlockOutput {
            instructions: out,
            state_fingerprint,
        })
    }

    /// Apply a block's portal instructions and commit the result.
    ///
    /// # Arguments
    /// * `block` - Same context the producer built with
    /// * `store` - Durable state; written only on success
    /// * `rates` - Source of the block's final exchange rates
    /// * `instructions` - The block's instructions, in block order
    ///
    /// # Returns
    /// - `Ok(fingerprint)` of the committed state
    /// - `Err(PortalError)` if any instruction does not apply; the block is
    ///   rejected and `store` is untouched
    pub fn process_block(
        &self,
        block: &BlockContext,
        store: &mut dyn PortalStore,
        rates: &dyn ExchangeRateProvider,
        instructions: &[Instruction],
    ) -> Result<String, PortalError> {
        let rates = rates.final_rates(block.beacon_height)?;
        let mut state = PortalState::load(&*store)?;
        let mut staged = StagedStore::new(&*store);
        {
            let mut env = ProcessEnv {
                params: &self.params,
                block,
                rates: &rates,
                state: &mut state,
                store: &mut staged,
            };
            for (index, inst) in instructions.iter().enumerate() {
                self.table.process(&mut env, inst).map_err(|err| {
                    warn!(
                        "[Portal] Block {} rejected at instruction {} ({}): {}",
                        block.beacon_height, index, inst.kind, err
                    );
                    err
                })?;
            }
        }
        state.verify_invariants()?;
        state.persist(&mut staged)?;
        let fingerprint = state.fingerprint()?;

        let writes = staged.into_writes();
        debug!("[Portal] Committing {} write(s)", writes.len());
        commit(store, writes)?;
        info!(
            "[Portal] Processed beacon block {}: {} instruction(s), state {}",
            block.beacon_height,
            instructions.len(),
            fingerprint
        );
        Ok(fingerprint)
    }

    /// Rebuild a received block from its actions and apply it only if the
    /// rebuild reproduces `instructions` exactly.
    ///
    /// Catches what `process_block` alone cannot: user actions the producer
    /// dropped or rejected without cause.
    pub fn verify_block(
        &self,
        block: &BlockContext,
        store: &mut dyn PortalStore,
        rates: &dyn ExchangeRateProvider,
        actions: &[ActionEnvelope],
        instructions: &[Instruction],
    ) -> Result<String, PortalError> {
        let rebuilt = self.build_block(block, &*store, rates, actions)?;
        let mismatch = |reason: String| {
            warn!("[Portal] Block {} failed verification: {}", block.beacon_height, reason);
            PortalError::BlockMismatch {
                beacon_height: block.beacon_height,
                reason,
            }
        };
        if rebuilt.instructions.len() != instructions.len() {
            return Err(mismatch(format!(
                "{} instruction(s), rebuild has {}",
                instructions.len(),
                rebuilt.instructions.len()
            )));
        }
        if let Some(index) = rebuilt
            .instructions
            .iter()
            .zip(instructions)
            .position(|(expected, received)| expected != received)
        {
            return Err(mismatch(format!(
                "instruction {} ({}) differs",
                index, instructions[index].kind
            )));
        }

        let fingerprint = self.process_block(block, store, rates, instructions)?;
        if fingerprint != rebuilt.state_fingerprint {
            return Err(mismatch(format!(
                "state {} but rebuild reached {}",
                fingerprint, rebuilt.state_fingerprint
            )));
        }
        Ok(fingerprint)
    }

    /// Current state as committed in `store`
    pub fn load_state(&self, store: &dyn PortalStore) -> Result<PortalState, PortalError> {
        PortalState::load(store)
    }
}

fn run_auto(
    env: &mut BuildEnv<'_>,
    kind: InstructionKind,
    out: &mut Vec<Instruction>,
) -> Result<(), PortalError> {
    match env.table.entry(kind)?.build {
        Builder::Auto(build) => {
            let before = out.len();
            build(env, out)?;
            if out.len() > before {
                debug!("[Portal] {} produced {} instruction(s)", kind, out.len() - before);
            }
            Ok(())
        }
        _ => Err(PortalError::mismatch(kind, "not an auto kind")),
    }
}

fn build_user(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), PortalError> {
    let outcome = match envelope.validate_schema(env.ctx.params) {
        Err(reason) => Err(BuildError::Reject(reason)),
        Ok(()) => match env.table.entry(envelope.kind())?.build {
            Builder::User(build) => build(env, envelope, out),
            _ => Err(BuildError::Fault(PortalError::mismatch(
                envelope.kind(),
                "not a user kind",
            ))),
        },
    };
    match outcome {
        Ok(()) => Ok(()),
        Err(BuildError::Reject(reason)) => reject(env, envelope, &reason, out),
        Err(BuildError::Fault(err)) => Err(err),
    }
}
