//! seqtrain CLI
//!
//! Command-line driver for the training loop over the bundled toy
//! collaborators.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use seqtrain::checkpoint::CheckpointSaver;
use seqtrain::training::{RlStepMode, TrainerConfig};

mod run;

#[derive(Parser)]
#[command(name = "seqtrain")]
#[command(version, about = "seqtrain - Hybrid supervised / RL training loop", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the toy bigram decoder on a synthetic copy task
    Train(TrainArgs),

    /// Print the default trainer configuration as JSON
    Config,

    /// Print the metadata of a checkpoint file as JSON
    Inspect {
        /// Checkpoint file
        checkpoint: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub struct TrainArgs {
    /// Trainer configuration (JSON); flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after this many steps
    #[arg(long)]
    train_steps: Option<i64>,

    /// Batches per optimizer update
    #[arg(long)]
    accum_count: Option<usize>,

    /// Validate every N steps
    #[arg(long)]
    valid_steps: Option<u64>,

    /// Report every N steps
    #[arg(long)]
    report_every: Option<u64>,

    /// Local worker threads
    #[arg(long)]
    world_size: Option<usize>,

    /// Enable RL fine-tuning after this step
    #[arg(long)]
    rl_after: Option<i64>,

    /// Probability of the RL trigger
    #[arg(long)]
    rl_probability: Option<f64>,

    /// Fold RL gradients into the supervised step
    #[arg(long)]
    shared_rl_step: bool,

    /// Seed for the RL trigger and the corpus
    #[arg(long)]
    seed: Option<u64>,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,

    /// Write checkpoints into this directory
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Keep only the last N checkpoints (0 = keep all)
    #[arg(long, default_value = "5")]
    keep_last: usize,

    /// Resume from the latest checkpoint in --checkpoint-dir
    #[arg(long, requires = "checkpoint_dir")]
    resume: bool,

    /// Vocabulary size, special tokens included
    #[arg(long, default_value = "16")]
    vocab_size: usize,

    /// Training batches in the synthetic corpus
    #[arg(long, default_value = "40")]
    batches: usize,

    /// Examples per batch
    #[arg(long, default_value = "4")]
    batch_size: usize,

    /// Beam candidates decoded per example during RL
    #[arg(long, default_value = "2")]
    beam_size: usize,

    /// Learning rate
    #[arg(long, default_value = "0.5")]
    lr: f64,

    /// Global gradient norm limit
    #[arg(long)]
    max_grad_norm: Option<f64>,
}

impl TrainArgs {
    /// File config (or defaults) with the flags applied on top.
    fn trainer_config(&self) -> Result<TrainerConfig> {
        let mut config = match self.config {
            Some(ref path) => TrainerConfig::from_json_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => TrainerConfig::default(),
        };

        if let Some(steps) = self.train_steps {
            config.train_steps = steps;
        }
        if let Some(count) = self.accum_count {
            config.accum_count = count;
        }
        if let Some(steps) = self.valid_steps {
            config.valid_steps = steps;
        }
        if let Some(every) = self.report_every {
            config.report_every = every;
        }
        if let Some(world_size) = self.world_size {
            config.world_size = world_size;
        }
        if let Some(step) = self.rl_after {
            config.enable_rl_after = step;
        }
        if let Some(p) = self.rl_probability {
            config.rl_trigger_probability = p;
        }
        if self.shared_rl_step {
            config.rl_step_mode = RlStepMode::Shared;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.progress {
            config.show_progress = true;
        }
        config.rank = 0;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => {
            let config = args.trainer_config()?;
            let summary = run::train(&args, config)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&TrainerConfig::default())?);
        }
        Commands::Inspect { checkpoint } => {
            inspect(&checkpoint)?;
        }
    }

    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let state = CheckpointSaver::load_from_path(path)
        .with_context(|| format!("failed to read checkpoint {}", path.display()))?;

    let parameters: Vec<serde_json::Value> = state
        .parameters
        .iter()
        .map(|p| serde_json::json!({ "name": p.name, "shape": p.value.shape() }))
        .collect();
    let summary = serde_json::json!({
        "step": state.step,
        "version": state.version,
        "timestamp": state.timestamp,
        "num_scalars": state.num_scalars(),
        "moving_average": state.moving_average.is_some(),
        "parameters": parameters,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
