use anyhow::{bail, Context, Result};
use bleep_portal::{
    ActionEnvelope, BlockContext, FinalExchangeRates, Instruction, InstructionStatus, MemoryStore,
    PortalEngine, RateHistory, ShardId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// A scripted run: rate tables by beacon height and one entry per block.
/// Block `i` of the file is beacon height `i + 1`.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub rates: Vec<FinalExchangeRates>,
    pub blocks: Vec<ScenarioBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioBlock {
    pub shard_heights: BTreeMap<ShardId, u64>,
    #[serde(default)]
    pub actions: Vec<ActionEnvelope>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockReport {
    pub beacon_height: u64,
    pub instructions: Vec<[String; 4]>,
    pub rejected: usize,
    pub state_fingerprint: String,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        let scenario: Scenario = serde_json::from_str(&raw)
            .with_context(|| format!("parsing scenario {}", path.display()))?;
        if scenario.blocks.is_empty() {
            bail!("scenario {} has no blocks", path.display());
        }
        Ok(scenario)
    }
}

/// Replay every block through the producer. With `verify`, a separate
/// validator store rebuilds each block from its actions and rates, and
/// must reproduce the producer's instructions and fingerprint.
pub fn run(engine: &PortalEngine, scenario: &Scenario, verify: bool) -> Result<Vec<BlockReport>> {
    let mut rates = RateHistory::new();
    for table in &scenario.rates {
        rates.record(table.clone());
    }

    let mut producer = MemoryStore::new();
    let mut validator = MemoryStore::new();
    let mut reports = Vec::with_capacity(scenario.blocks.len());

    for (index, entry) in scenario.blocks.iter().enumerate() {
        let block = BlockContext {
            beacon_height: index as u64 + 1,
            shard_heights: entry.shard_heights.clone(),
        };
        let output = engine
            .build_block(&block, &producer, &rates, &entry.actions)
            .with_context(|| format!("building beacon block {}", block.beacon_height))?;
        let committed = engine
            .process_block(&block, &mut producer, &rates, &output.instructions)
            .with_context(|| format!("committing beacon block {}", block.beacon_height))?;
        if committed != output.state_fingerprint {
            bail!(
                "beacon block {}: producer state {} differs from built state {}",
                block.beacon_height,
                committed,
                output.state_fingerprint
            );
        }

        if verify {
            let replayed = replay(engine, &block, &mut validator, &rates, &entry.actions, &output.instructions)?;
            if replayed != committed {
                bail!(
                    "beacon block {}: validator state {} differs from producer state {}",
                    block.beacon_height,
                    replayed,
                    committed
                );
            }
        }

        let rejected = output
            .instructions
            .iter()
            .filter(|i| i.status == InstructionStatus::Rejected)
            .count();
        if rejected > 0 {
            warn!(beacon_height = block.beacon_height, rejected, "actions rejected");
        }
        info!(
            beacon_height = block.beacon_height,
            instructions = output.instructions.len(),
            fingerprint = %committed,
            "block committed"
        );
        reports.push(BlockReport {
            beacon_height: block.beacon_height,
            instructions: output.instructions.iter().map(Instruction::to_record).collect(),
            rejected,
            state_fingerprint: committed,
        });
    }
    Ok(reports)
}

/// Validator path: instructions go through the 4-field record and back
fn replay(
    engine: &PortalEngine,
    block: &BlockContext,
    store: &mut MemoryStore,
    rates: &RateHistory,
    actions: &[ActionEnvelope],
    instructions: &[Instruction],
) -> Result<String> {
    let decoded = instructions
        .iter()
        .map(|inst| Instruction::from_record(&inst.to_record()))
        .collect::<Result<Vec<_>, _>>()?;
    let fingerprint = engine
        .verify_block(block, store, rates, actions, &decoded)
        .with_context(|| format!("validating beacon block {}", block.beacon_height))?;
    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bleep_portal::{PortalParams, VerifierRegistry};

    const SAMPLE: &str = include_str!("../scenarios/sample.json");

    #[test]
    fn test_sample_scenario_runs_and_verifies() {
        let scenario: Scenario = serde_json::from_str(SAMPLE).unwrap();
        let engine = PortalEngine::new(PortalParams::default(), VerifierRegistry::passthrough()).unwrap();
        let reports = run(&engine, &scenario, true).unwrap();
        assert_eq!(reports.len(), scenario.blocks.len());

        let liquidation = reports
            .iter()
            .flat_map(|r| r.instructions.iter())
            .any(|record| record[0] == "portal-liquidate-by-rates");
        assert!(liquidation);
        assert!(reports.iter().all(|r| r.rejected == 0));
    }

    #[test]
    fn test_validator_rebuilds_from_actions() {
        let scenario: Scenario = serde_json::from_str(SAMPLE).unwrap();
        let engine = PortalEngine::new(PortalParams::default(), VerifierRegistry::passthrough()).unwrap();
        let mut rates = RateHistory::new();
        for table in &scenario.rates {
            rates.record(table.clone());
        }
        let entry = &scenario.blocks[0];
        let block = BlockContext {
            beacon_height: 1,
            shard_heights: entry.shard_heights.clone(),
        };
        let output = engine
            .build_block(&block, &MemoryStore::new(), &rates, &entry.actions)
            .unwrap();

        // both deposits silently left out of the block
        let mut validator = MemoryStore::new();
        assert!(replay(&engine, &block, &mut validator, &rates, &entry.actions, &[]).is_err());
        assert!(validator.is_empty());

        let fingerprint = replay(&engine, &block, &mut validator, &rates, &entry.actions, &output.instructions).unwrap();
        assert_eq!(fingerprint, output.state_fingerprint);
    }
}
