use anyhow::{Context, Result};
use bleep_portal::{porting_memo, redeem_memo, topup_memo, PortalEngine, PortalParams, VerifierRegistry};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod scenario;

use scenario::Scenario;

#[derive(Parser)]
#[command(name = "bleep-portal")]
#[command(about = "BLEEP portal operator tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file through the portal and print per-block reports
    Simulate {
        scenario: PathBuf,

        /// Parameter file (TOML, YAML or JSON); defaults apply otherwise
        #[arg(long)]
        params: Option<PathBuf>,

        /// Rebuild and re-apply every block on a separate validator store
        #[arg(long)]
        verify: bool,
    },

    /// Print the effective portal parameters
    Params {
        #[arg(long)]
        params: Option<PathBuf>,
    },

    /// Print the memo an external transfer must carry
    Memo { kind: MemoKind, id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum MemoKind {
    Porting,
    Redeem,
    Topup,
}

fn load_params(path: Option<&Path>) -> Result<PortalParams> {
    match path {
        Some(path) => PortalParams::from_file(path)
            .with_context(|| format!("loading parameters from {}", path.display())),
        None => Ok(PortalParams::default()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            scenario,
            params,
            verify,
        } => {
            let params = load_params(params.as_deref())?;
            let engine = PortalEngine::new(params, VerifierRegistry::passthrough())?;
            let loaded = Scenario::load(&scenario)?;
            info!(blocks = loaded.blocks.len(), verify, "running scenario {}", scenario.display());
            let reports = scenario::run(&engine, &loaded, verify)?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Commands::Params { params } => {
            let params = load_params(params.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&params)?);
        }
        Commands::Memo { kind, id } => {
            let memo = match kind {
                MemoKind::Porting => porting_memo(&id),
                MemoKind::Redeem => redeem_memo(&id),
                MemoKind::Topup => topup_memo(&id),
            };
            println!("{}", memo);
        }
    }

    Ok(())
}
