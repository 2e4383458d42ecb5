use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use modeshift_consensus::{
    BftEngine, BlockContext, BlockHeight, EngineSet, LedgerView, PosEngine,
    StateRoot, SwitchConfig, SwitchController, SwitchEvent, SwitchStateStore, ThreatReport,
    ValidatorId, ValidatorStake,
};

#[derive(Parser)]
#[command(name = "modeshift")]
#[command(about = "Consensus mode switch operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the effective settings
    CheckConfig { path: PathBuf },

    /// Print the default configuration as JSON
    DefaultConfig,

    /// Decode a persisted switch-state snapshot
    Inspect {
        snapshot: PathBuf,

        /// Print the full state instead of the summary view
        #[arg(long)]
        full: bool,
    },

    /// Drive the switch through a synthetic attack against the built-in engines
    Simulate {
        /// Configuration file; defaults are used when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = 200)]
        blocks: u64,

        /// First block under attack
        #[arg(long, default_value_t = 20)]
        attack_from: u64,

        /// First calm block after the attack
        #[arg(long, default_value_t = 120)]
        attack_until: u64,

        /// Validators generated when no config file is given
        #[arg(long, default_value_t = 7)]
        validators: usize,

        /// Validators that vote on every proposal
        #[arg(long)]
        voters: Option<usize>,

        #[arg(long, default_value_t = 1_000)]
        block_time_ms: u64,

        /// Write the final switch state here
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

/// Ledger with deterministic roots and a fixed validator set.
struct SimLedger {
    finalized: BlockHeight,
    validators: Vec<ValidatorId>,
}

impl LedgerView for SimLedger {
    fn finalized_height(&self) -> BlockHeight {
        self.finalized
    }

    fn state_root_at(&self, height: BlockHeight) -> Option<StateRoot> {
        if height > self.finalized {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(b"sim-state");
        hasher.update(height.to_le_bytes());
        Some(hasher.finalize().into())
    }

    fn validator_set_at(&self, height: BlockHeight) -> Option<Vec<ValidatorId>> {
        (height <= self.finalized).then(|| self.validators.clone())
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn threat_report(node: usize, timestamp: u64, attacked: bool) -> ThreatReport {
    let node_id = format!("sentinel-{}", node);
    if attacked {
        ThreatReport::new(node_id, timestamp, 1_800, 0.9, 18, 900)
    } else {
        ThreatReport::new(node_id, timestamp, 40, 0.0, 0, 10)
    }
}

#[allow(clippy::too_many_arguments)]
async fn simulate(
    config: Option<PathBuf>,
    blocks: u64,
    attack_from: u64,
    attack_until: u64,
    validator_count: usize,
    voters: Option<usize>,
    block_time_ms: u64,
    snapshot: Option<PathBuf>,
) -> Result<()> {
    let config = match config {
        Some(path) => SwitchConfig::load(&path)?,
        None => {
            let mut config = SwitchConfig::default();
            config.proposal.validators = (0..validator_count)
                .map(|i| format!("validator-{:02}", i))
                .collect();
            // Each sentinel reports every block; keep its newest samples inside the rate limit
            config.oracle.window_ms = block_time_ms * (config.oracle.max_reports_per_node as u64).saturating_sub(1).max(1);
            config
        }
    };

    let validators = config.proposal.validators.clone();
    let voters = voters.unwrap_or(validators.len()).min(validators.len());
    let pos = PosEngine::new(
        validators
            .iter()
            .map(|id| ValidatorStake::new(id.clone(), 1_000))
            .collect(),
    );
    let bft = BftEngine::new(validators.clone());
    let ledger = SimLedger {
        finalized: 0,
        validators: validators.clone(),
    };

    let mut controller = SwitchController::new(config, EngineSet::new(pos, bft), ledger)?;
    let genesis = controller.bootstrap().await?;
    info!(
        "Simulating {} blocks from {} (checkpoint {}), attack in [{}, {})",
        blocks,
        controller.current_mode(),
        genesis.block_number,
        attack_from,
        attack_until
    );

    for height in 1..=blocks {
        controller.ledger_mut().finalized = height - 1;
        let timestamp = height * block_time_ms;
        let attacked = (attack_from..attack_until).contains(&height);
        for node in 0..5 {
            controller.submit_threat_report(threat_report(node, timestamp, attacked));
        }

        if let Err(e) = controller.on_block(BlockContext::new(height, timestamp)).await {
            error!("Block {} failed: {}", height, e);
            if controller.is_halted() {
                warn!("Controller halted; operator must resume in {}", controller.current_mode());
                break;
            }
            return Err(e.into());
        }

        for event in controller.drain_events() {
            println!("{}", serde_json::to_string(&event)?);
            if let SwitchEvent::ProposalCreated { proposal_id, .. } = event {
                for validator in validators.iter().take(voters) {
                    controller.vote_switch(proposal_id, validator);
                }
            }
        }
    }

    print_json(&controller.view())?;

    if let Some(path) = snapshot {
        let bytes = controller.store().to_bytes()?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("writing snapshot to {}", path.display()))?;
        info!("Snapshot written to {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => {
            let config = SwitchConfig::load(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            info!(
                "Configuration valid: {} validators, quorum {}",
                config.proposal.validators.len(),
                config.proposal.quorum_needed()
            );
            print_json(&config)?;
        }
        Commands::DefaultConfig => {
            print_json(&SwitchConfig::default())?;
        }
        Commands::Inspect { snapshot, full } => {
            let bytes = std::fs::read(&snapshot)
                .with_context(|| format!("reading {}", snapshot.display()))?;
            let store = SwitchStateStore::from_bytes(&bytes)?;
            if full {
                println!("{}", store.to_json()?);
            } else {
                print_json(&store.view())?;
            }
            println!("digest: {}", store.digest()?);
        }
        Commands::Simulate {
            config,
            blocks,
            attack_from,
            attack_until,
            validators,
            voters,
            block_time_ms,
            snapshot,
        } => {
            if attack_from > attack_until {
                bail!("attack_from must not be after attack_until");
            }
            simulate(
                config,
                blocks,
                attack_from,
                attack_until,
                validators,
                voters,
                block_time_ms,
                snapshot,
            )
            .await?;
        }
    }

    Ok(())
}
