//! Training runs over the toy collaborators, one thread per worker.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use seqtrain::checkpoint::{CheckpointConfig, CheckpointSaver};
use seqtrain::toy::{BigramDecoder, CorpusConfig, GeneratorLoss, Sgd, SyntheticCorpus, TokenF1};
use seqtrain::training::{Collectives, LocalGroup, Optimizer, TrainerBuilder, TrainerConfig};

use crate::TrainArgs;

/// Outcome of a run, as seen by the primary worker.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub steps: u64,
    pub rl_steps: u64,
    pub rl_triggered: bool,
    pub world_size: usize,
    pub n_words: u64,
    pub xent: f64,
    pub accuracy: f64,
    pub valid_xent: f64,
    pub valid_accuracy: f64,
    pub checkpoint: Option<PathBuf>,
}

/// Train with `config.world_size` local workers and return rank 0's summary.
pub fn train(args: &TrainArgs, config: TrainerConfig) -> Result<RunSummary> {
    let world_size = config.world_size;
    if world_size == 1 {
        return run_worker(args, config, None);
    }

    tracing::info!(world_size, "Spawning local workers");
    let timeout = Duration::from_millis(config.collective_timeout_ms);
    let summaries = std::thread::scope(|scope| {
        let workers: Vec<_> = LocalGroup::handles(world_size, timeout)
            .into_iter()
            .map(|handle| {
                let config = config.clone().with_world(world_size, handle.rank());
                let collectives: Arc<dyn Collectives> = Arc::new(handle);
                scope.spawn(move || run_worker(args, config, Some(collectives)))
            })
            .collect();

        workers
            .into_iter()
            .enumerate()
            .map(|(rank, worker)| {
                worker
                    .join()
                    .map_err(|_| anyhow!("worker {} panicked", rank))?
            })
            .collect::<Result<Vec<_>>>()
    })?;

    summaries
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no worker finished"))
}

fn run_worker(
    args: &TrainArgs,
    config: TrainerConfig,
    collectives: Option<Arc<dyn Collectives>>,
) -> Result<RunSummary> {
    let rank = config.rank;
    let seed = config.seed.unwrap_or(0);
    let rl_enabled = config.enable_rl_after >= 0;

    let corpus = CorpusConfig {
        vocab_size: args.vocab_size,
        batch_size: args.batch_size,
        num_batches: args.batches,
        seed,
        ..Default::default()
    };
    let train_corpus = SyntheticCorpus::new(corpus.clone());
    let valid_corpus = SyntheticCorpus::new(CorpusConfig {
        num_batches: 4,
        seed: seed.wrapping_add(1),
        ..corpus
    });

    let mut model = BigramDecoder::new(args.vocab_size);
    if rl_enabled {
        model = model.with_beam(args.beam_size);
    }

    let mut start_step = 0;
    let saver = match args.checkpoint_dir {
        Some(ref dir) => {
            let saver = CheckpointSaver::new(CheckpointConfig::new(dir).keep_last(args.keep_last))?;
            if args.resume {
                if let Some(state) = saver.load_latest()? {
                    state.restore_into(&mut model)?;
                    start_step = state.step;
                    tracing::info!(rank, step = start_step, "Resumed from checkpoint");
                }
            }
            Some(saver)
        }
        None => None,
    };

    let mut optim = Sgd::new(args.lr).with_start_step(start_step);
    if let Some(max_norm) = args.max_grad_norm {
        optim = optim.with_max_grad_norm(max_norm);
    }

    let padding_idx = config.padding_idx;
    let mut builder = TrainerBuilder::new(config);
    if let Some(collectives) = collectives {
        builder = builder.collectives(collectives);
    }
    if let Some(saver) = saver {
        builder = builder.saver(Box::new(saver));
    }
    if rl_enabled {
        builder = builder.reward_evaluator(Box::new(TokenF1::new()));
    }
    let mut trainer = builder.build(
        model,
        GeneratorLoss::new(padding_idx),
        GeneratorLoss::new(padding_idx),
        optim,
    )?;

    let stats = trainer.train(train_corpus.batches(), Some(|| valid_corpus.batches()))?;
    let valid = trainer.validate(valid_corpus.batches())?;

    let checkpoint = match args.checkpoint_dir {
        Some(ref dir) if rank == 0 => CheckpointSaver::new(CheckpointConfig::new(dir))?
            .list_checkpoints()?
            .pop(),
        _ => None,
    };

    Ok(RunSummary {
        steps: trainer.optimizer().training_step(),
        rl_steps: trainer.optimizer().rl_steps(),
        rl_triggered: trainer.rl_triggered(),
        world_size: trainer.config().world_size,
        n_words: stats.n_words,
        xent: stats.xent(),
        accuracy: stats.accuracy(),
        valid_xent: valid.xent(),
        valid_accuracy: valid.accuracy(),
        checkpoint,
    })
}
