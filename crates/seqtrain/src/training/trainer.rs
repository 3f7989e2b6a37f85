//! Main training loop.

use super::accumulate::BatchAccumulator;
use super::averaging::{ExponentialAverage, MovingAverage, NoAverage, ParameterAverager};
use super::config::{RlStepMode, TrainerConfig};
use super::distributed::{
    all_gather_list, CollectiveReducer, Collectives, GradientReducer, NoReduce,
};
use super::loss::{LossCompute, LossRequest};
use super::optimizer::Optimizer;
use super::reward::{RewardEvaluator, RewardShaper};
use super::schedule::CheckpointScheduler;
use crate::batch::Batch;
use crate::checkpoint::ModelSaver;
use crate::model::Model;
use crate::report::{LogReportManager, ReportManager};
use crate::stats::Statistics;
use crate::utils::seeded_rng;
use crate::{Result, SeqTrainError};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use std::sync::Arc;

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// Where the loop currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// Nested inside `Running`, never re-entered from itself.
    Validating,
    Done,
}

/// Assembles a [`Trainer`], choosing every strategy once.
pub struct TrainerBuilder<M> {
    config: TrainerConfig,
    collectives: Option<Arc<dyn Collectives>>,
    saver: Option<Box<dyn ModelSaver<M>>>,
    report_manager: Option<Box<dyn ReportManager>>,
    reward_evaluator: Option<Box<dyn RewardEvaluator>>,
}

impl<M: Model> TrainerBuilder<M> {
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            collectives: None,
            saver: None,
            report_manager: None,
            reward_evaluator: None,
        }
    }

    /// Collectives of the data-parallel group this worker belongs to.
    pub fn collectives(mut self, collectives: Arc<dyn Collectives>) -> Self {
        self.collectives = Some(collectives);
        self
    }

    /// Checkpoint saver; ignored on every rank but 0.
    pub fn saver(mut self, saver: Box<dyn ModelSaver<M>>) -> Self {
        self.saver = Some(saver);
        self
    }

    /// Defaults to a [`LogReportManager`].
    pub fn report_manager(mut self, report_manager: Box<dyn ReportManager>) -> Self {
        self.report_manager = Some(report_manager);
        self
    }

    /// Required when RL fine-tuning is enabled.
    pub fn reward_evaluator(mut self, evaluator: Box<dyn RewardEvaluator>) -> Self {
        self.reward_evaluator = Some(evaluator);
        self
    }

    /// Build the trainer.
    ///
    /// With RL enabled on several workers this is a collective call: every
    /// rank adopts rank 0's RL trigger.
    pub fn build<L, O>(
        self,
        mut model: M,
        train_loss: L,
        valid_loss: L,
        optim: O,
    ) -> Result<Trainer<M, L, O>>
    where
        L: LossCompute<M>,
        O: Optimizer,
    {
        let config = self.config;
        config.validate()?;

        if let Some(ref collectives) = self.collectives {
            if collectives.world_size() != config.world_size || collectives.rank() != config.rank {
                return Err(SeqTrainError::Config(format!(
                    "collectives are rank {} of {}, config says rank {} of {}",
                    collectives.rank(),
                    collectives.world_size(),
                    config.rank,
                    config.world_size
                )));
            }
        }

        let reducer: Box<dyn GradientReducer> = match (&self.collectives, config.is_distributed()) {
            (Some(collectives), true) => {
                Box::new(CollectiveReducer::new(collectives.clone(), config.reduce_op))
            }
            (None, true) => {
                return Err(SeqTrainError::Config(format!(
                    "world size {} needs collectives",
                    config.world_size
                )))
            }
            (_, false) => Box::new(NoReduce),
        };

        let averager: Box<dyn ParameterAverager> = if config.average_decay > 0.0 {
            Box::new(ExponentialAverage::new(config.average_decay, config.average_every))
        } else {
            Box::new(NoAverage)
        };

        let saver = if config.rank == 0 {
            self.saver
        } else {
            if self.saver.is_some() {
                tracing::debug!(
                    rank = config.rank,
                    "Dropping checkpoint saver on non-primary worker"
                );
            }
            None
        };

        let report_manager: Box<dyn ReportManager> = match self.report_manager {
            Some(report_manager) => report_manager,
            None => {
                let manager = LogReportManager::new(config.report_every);
                match self.collectives {
                    Some(ref collectives) => {
                        Box::new(manager.with_collectives(collectives.clone()))
                    }
                    None => Box::new(manager),
                }
            }
        };

        let rl_enabled = config.enable_rl_after >= 0;
        let shaper = match (rl_enabled, self.reward_evaluator) {
            (true, Some(evaluator)) => {
                Some(RewardShaper::new(evaluator, config.bos_idx, config.padding_idx))
            }
            (true, None) => {
                return Err(SeqTrainError::Config(
                    "RL fine-tuning is enabled but no reward evaluator was given".into(),
                ))
            }
            (false, _) => None,
        };

        let mut rl_triggered =
            rl_enabled && seeded_rng(config.seed).gen::<f64>() < config.rl_trigger_probability;
        if rl_enabled && config.is_distributed() {
            if let Some(ref collectives) = self.collectives {
                let triggers: Vec<bool> = all_gather_list(collectives.as_ref(), &rl_triggered)?;
                rl_triggered = triggers.first().copied().unwrap_or(false);
            }
        }
        tracing::debug!(rank = config.rank, rl_enabled, rl_triggered, "Drew RL trigger");

        model.set_training(true);
        tracing::info!(
            parameters = model.num_parameters(),
            accum_count = config.accum_count,
            world_size = config.world_size,
            "Built trainer"
        );

        Ok(Trainer {
            schedule: CheckpointScheduler::from_config(&config),
            shard_size: config.shard_size(),
            config,
            model,
            train_loss,
            valid_loss,
            optim,
            reducer,
            averager,
            saver,
            report_manager,
            shaper,
            rl_triggered,
            rl_announced: false,
            state: LoopState::Running,
        })
    }
}

/// Drives a model through accumulation cycles.
///
/// Per cycle: synchronize normalization, run the RL and supervised passes
/// for every batch, step the optimizer, update the moving average, report,
/// validate and checkpoint.
pub struct Trainer<M, L, O> {
    config: TrainerConfig,
    model: M,
    train_loss: L,
    valid_loss: L,
    optim: O,
    reducer: Box<dyn GradientReducer>,
    averager: Box<dyn ParameterAverager>,
    saver: Option<Box<dyn ModelSaver<M>>>,
    report_manager: Box<dyn ReportManager>,
    shaper: Option<RewardShaper>,
    schedule: CheckpointScheduler,
    rl_triggered: bool,
    rl_announced: bool,
    state: LoopState,
    shard_size: usize,
}

impl<M, L, O> Trainer<M, L, O>
where
    M: Model,
    L: LossCompute<M>,
    O: Optimizer,
{
    /// Train without validation.
    pub fn train_only<I>(&mut self, train_iter: I) -> Result<Statistics>
    where
        I: IntoIterator<Item = Batch>,
    {
        self.train(train_iter, None::<fn() -> std::iter::Empty<Batch>>)
    }

    /// Run the loop until the step budget or `train_iter` is exhausted.
    ///
    /// `valid_source` produces a fresh validation stream each time
    /// validation is due. Returns the statistics of every processed batch.
    pub fn train<I, F, V>(
        &mut self,
        train_iter: I,
        mut valid_source: Option<F>,
    ) -> Result<Statistics>
    where
        I: IntoIterator<Item = Batch>,
        F: FnMut() -> V,
        V: IntoIterator<Item = Batch>,
    {
        let world_size = self.config.world_size.max(1);
        let rank = self.config.rank;
        let train_steps = self.config.train_steps;
        let multigpu = self.reducer.world_size() > 1;

        if valid_source.is_some() {
            tracing::info!(
                valid_steps = self.config.valid_steps,
                "Start training loop and validate every {} steps",
                self.config.valid_steps
            );
        } else {
            tracing::info!("Start training loop without validation");
        }

        let mut step = self.optim.training_step();
        let mut total_stats = Statistics::new();
        let mut report_stats = Statistics::new();
        self.report_manager.start(total_stats.start_time());
        self.state = LoopState::Running;
        let progress = self.progress_bar(step);

        let stream = train_iter.into_iter().skip(rank).step_by(world_size);
        let mut groups = BatchAccumulator::from_config(stream, &self.config).enumerate();

        loop {
            // Shards may differ in length; every worker stops once any is exhausted.
            let next = groups.next();
            if !self.reducer.sync_continue(next.is_some())? {
                if next.is_some() {
                    tracing::debug!(rank, step, "A peer ran out of batches, dropping the group");
                }
                break;
            }
            let Some((cycle, group)) = next else {
                break;
            };
            step += 1;
            let normalization = self.reducer.sync_normalization(group.normalization)?;
            if self.config.verbose_level > 0 {
                tracing::debug!(
                    rank,
                    step,
                    cycle,
                    batches = group.len(),
                    normalization,
                    "Accumulation cycle"
                );
            }

            let rl_active = self.rl_active(step);
            if rl_active && !self.rl_announced {
                tracing::info!(step, mode = ?self.config.rl_step_mode, "RL fine-tuning active");
                self.rl_announced = true;
            }

            self.gradient_accumulation(
                group.batches,
                normalization,
                rl_active,
                step,
                &mut total_stats,
                &mut report_stats,
            )?;

            self.averager.on_cycle(cycle as u64, step, &self.model)?;

            let lr = self.optim.learning_rate();
            report_stats = self
                .report_manager
                .report_training(step, train_steps, lr, report_stats, multigpu)?;

            if let Some(ref mut source) = valid_source {
                if step % self.config.valid_steps == 0 {
                    self.state = LoopState::Validating;
                    if self.config.verbose_level > 0 {
                        tracing::debug!(rank, step, "Validate step");
                    }
                    let valid_stats = self.validate(source())?;
                    let valid_stats = self.reducer.gather_stats(valid_stats)?;
                    self.report_manager.report_step(lr, step, Some(&valid_stats))?;
                    self.state = LoopState::Running;
                }
            }

            if self.schedule.should_save(step) {
                self.save(step)?;
            }

            if let Some(ref pb) = progress {
                pb.set_position(step);
                pb.set_message(format!("xent: {:.4} lr: {:.2e}", total_stats.xent(), lr));
            }

            if train_steps > 0 && step as i64 >= train_steps {
                break;
            }
        }

        self.save(step)?;
        self.state = LoopState::Done;
        if let Some(pb) = progress {
            pb.finish_with_message("Training complete");
        }
        tracing::info!(
            step,
            acc = total_stats.accuracy(),
            ppl = total_stats.ppl(),
            "Training loop finished"
        );
        Ok(total_stats)
    }

    /// Score `valid_iter` without touching the live parameters.
    ///
    /// With a moving average present, a copy of the model carrying the
    /// averaged parameters is evaluated and discarded.
    pub fn validate<V>(&mut self, valid_iter: V) -> Result<Statistics>
    where
        V: IntoIterator<Item = Batch>,
    {
        match self.averager.average() {
            Some(average) => {
                let mut valid_model = self.model.clone();
                average.apply_to(&mut valid_model, self.config.model_dtype)?;
                valid_model.set_training(false);
                run_validation(&mut valid_model, &mut self.valid_loss, valid_iter)
            }
            None => {
                self.model.set_training(false);
                let stats = run_validation(&mut self.model, &mut self.valid_loss, valid_iter);
                self.model.set_training(true);
                stats
            }
        }
    }

    fn gradient_accumulation(
        &mut self,
        batches: Vec<Batch>,
        normalization: usize,
        rl_active: bool,
        step: u64,
        total_stats: &mut Statistics,
        report_stats: &mut Statistics,
    ) -> Result<()> {
        let single_step = self.config.accum_count == 1;
        let shared_rl = self.config.rl_step_mode == RlStepMode::Shared;

        if !single_step {
            self.optim.zero_grad(&mut self.model);
        }

        for (j, mut batch) in batches.into_iter().enumerate() {
            if self.config.verbose_level > 1 {
                tracing::debug!(rank = self.config.rank, step, batch = j, "Processing batch");
            }
            if single_step {
                self.optim.zero_grad(&mut self.model);
            }

            let output = self.model.forward(&batch)?;

            if rl_active {
                let beam = output.beam.as_ref().ok_or_else(|| {
                    SeqTrainError::Contract(
                        "RL fine-tuning needs beam output from the model".into(),
                    )
                })?;
                if let Some(ref mut shaper) = self.shaper {
                    let summary = shaper.backward_beams(
                        &mut self.model,
                        &mut self.train_loss,
                        &mut self.optim,
                        &mut batch,
                        beam,
                        normalization,
                        self.shard_size,
                    )?;
                    tracing::debug!(
                        step,
                        beams = summary.beams,
                        evaluated = summary.evaluated,
                        fallbacks = summary.fallbacks,
                        mean_scale = summary.mean_scale(),
                        loss = summary.loss,
                        "RL backward"
                    );
                }
                if single_step && !shared_rl {
                    self.reducer.reduce_gradients(&mut self.model)?;
                    self.optim.step(&mut self.model, true)?;
                }
            }

            if single_step && !(rl_active && shared_rl) {
                self.optim.zero_grad(&mut self.model);
            }

            let request = LossRequest::training(&batch, normalization, self.shard_size);
            let (loss, batch_stats) = self.train_loss.compute(
                &self.model,
                &batch,
                &output.outputs,
                &output.attentions,
                &request,
            )?;
            if let Some(loss) = loss {
                self.optim.backward(&mut self.model, loss)?;
            }

            total_stats.merge(&batch_stats);
            report_stats.merge(&batch_stats);
            report_stats.n_src_words += batch.src_words().unwrap_or(0) as u64;

            if single_step {
                self.reducer.reduce_gradients(&mut self.model)?;
                self.optim.step(&mut self.model, false)?;
            }

            if self.model.has_decoder_state() {
                self.model.detach_decoder_state();
            }
        }

        if !single_step {
            self.reducer.reduce_gradients(&mut self.model)?;
            self.optim.step(&mut self.model, false)?;
        }
        Ok(())
    }

    fn rl_active(&self, step: u64) -> bool {
        self.rl_triggered && self.shaper.is_some() && self.config.rl_phase(step)
    }

    fn save(&mut self, step: u64) -> Result<()> {
        if let Some(ref mut saver) = self.saver {
            saver.save(step, &self.model, self.averager.average())?;
        }
        Ok(())
    }

    fn progress_bar(&self, start: u64) -> Option<ProgressBar> {
        if !self.config.show_progress || self.config.train_steps <= 0 || self.config.rank != 0 {
            return None;
        }
        let pb = ProgressBar::new(self.config.train_steps as u64);
        if let Ok(style) = ProgressStyle::default_bar().template(PROGRESS_TEMPLATE) {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_position(start);
        Some(pb)
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optim
    }

    /// Moving average, absent until the first update.
    pub fn average(&self) -> Option<&MovingAverage> {
        self.averager.average()
    }

    /// Outcome of the once-per-run RL trigger.
    pub fn rl_triggered(&self) -> bool {
        self.rl_triggered
    }

    pub fn state(&self) -> LoopState {
        self.state
    }
}

fn run_validation<M, L, V>(model: &mut M, loss: &mut L, valid_iter: V) -> Result<Statistics>
where
    M: Model,
    L: LossCompute<M>,
    V: IntoIterator<Item = Batch>,
{
    let mut stats = Statistics::new();
    for batch in valid_iter {
        let output = model.forward(&batch)?;
        let request = LossRequest::validation(&batch);
        let (_, batch_stats) =
            loss.compute(model, &batch, &output.outputs, &output.attentions, &request)?;
        stats.merge(&batch_stats);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Attentions, BeamOutput, ExampleDecoding, ForwardOutput, Parameter, Parameterized, Tensor,
    };
    use crate::training::{Loss, RewardError, RewardMetrics};
    use ndarray::{Array2, Array3, IxDyn};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Seen = Arc<Mutex<Vec<(f32, Option<Vec<f32>>)>>>;

    #[derive(Clone)]
    struct MockModel {
        params: Vec<Parameter>,
        beam: usize,
        training: bool,
        stateful: bool,
        // Some(attached) once a forward pass has run
        decoder_state: Option<bool>,
        detaches: Arc<AtomicUsize>,
    }

    impl MockModel {
        fn new(beam: usize) -> Self {
            Self {
                params: vec![Parameter::new("w", Tensor::zeros(IxDyn(&[1])))],
                beam,
                training: true,
                stateful: false,
                decoder_state: None,
                detaches: Arc::default(),
            }
        }

        /// Keeps a recurrent decoder state and counts detach calls.
        fn stateful(beam: usize) -> (Self, Arc<AtomicUsize>) {
            let model = Self {
                stateful: true,
                ..Self::new(beam)
            };
            let detaches = model.detaches.clone();
            (model, detaches)
        }

        fn state_attached(&self) -> bool {
            self.decoder_state == Some(true)
        }

        fn value(&self) -> f32 {
            self.params[0].value[[0]]
        }
    }

    impl Parameterized for MockModel {
        fn parameters(&self) -> Vec<&Parameter> {
            self.params.iter().collect()
        }
        fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
            self.params.iter_mut().collect()
        }
    }

    impl Model for MockModel {
        fn forward(&mut self, batch: &Batch) -> Result<ForwardOutput> {
            if self.stateful {
                self.decoder_state = Some(true);
            }
            let (t, b) = (batch.tgt_len() - 1, batch.batch_size());
            let beam = (self.beam > 0).then(|| BeamOutput {
                dec_outputs: Tensor::zeros(IxDyn(&[t, b, self.beam, 1])),
                dec_attns: Attentions::new(),
                decodings: (0..b)
                    .map(|_| ExampleDecoding {
                        token_ids: vec![vec![5]; self.beam],
                        tokens: vec![vec!["x".to_string()]; self.beam],
                        source: vec!["x".to_string()],
                        reference: vec!["x".to_string()],
                    })
                    .collect(),
            });
            Ok(ForwardOutput {
                outputs: Tensor::zeros(IxDyn(&[t, b, 1])),
                attentions: Attentions::new(),
                beam,
            })
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn has_decoder_state(&self) -> bool {
            self.decoder_state.is_some()
        }

        fn detach_decoder_state(&mut self) {
            self.decoder_state = Some(false);
            self.detaches.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Unit gradient per call; records the parameter value and scales seen.
    struct MockLoss {
        seen: Seen,
        attached: Arc<Mutex<Vec<bool>>>,
    }

    impl MockLoss {
        fn new() -> (Self, Seen) {
            let seen = Seen::default();
            let loss = Self {
                seen: seen.clone(),
                attached: Arc::default(),
            };
            (loss, seen)
        }
    }

    impl LossCompute<MockModel> for MockLoss {
        fn compute(
            &mut self,
            model: &MockModel,
            batch: &Batch,
            _outputs: &Tensor,
            _attentions: &Attentions,
            request: &LossRequest,
        ) -> Result<(Option<Loss>, Statistics)> {
            self.seen
                .lock()
                .unwrap()
                .push((model.value(), request.scales.clone()));
            self.attached.lock().unwrap().push(model.state_attached());
            let loss = Loss {
                value: 1.0,
                gradients: vec![Some(Tensor::ones(IxDyn(&[1])))],
            };
            Ok((Some(loss), Statistics::with_counts(1.0, batch.batch_size() as u64, 0)))
        }
    }

    #[derive(Default)]
    struct MockOptim {
        steps: Vec<bool>,
    }

    impl Optimizer for MockOptim {
        fn step(&mut self, model: &mut dyn Parameterized, rl: bool) -> Result<()> {
            for param in model.parameters_mut() {
                if let Some(grad) = param.grad.clone() {
                    param.value.zip_mut_with(&grad, |v, &g| *v -= 0.1 * g);
                }
            }
            self.steps.push(rl);
            Ok(())
        }
        fn learning_rate(&self) -> f64 {
            0.1
        }
        fn training_step(&self) -> u64 {
            0
        }
    }

    struct HalfF1;

    impl RewardEvaluator for HalfF1 {
        fn evaluate(
            &mut self,
            _: &str,
            _: &str,
            _: &str,
        ) -> core::result::Result<RewardMetrics, RewardError> {
            Ok(RewardMetrics {
                f1: 0.5,
                exact_match: None,
            })
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        saves: Arc<Mutex<Vec<u64>>>,
        reports: Arc<Mutex<Vec<u64>>>,
        validations: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    impl ModelSaver<MockModel> for Recorder {
        fn save(
            &mut self,
            step: u64,
            _model: &MockModel,
            _average: Option<&MovingAverage>,
        ) -> Result<Option<PathBuf>> {
            self.saves.lock().unwrap().push(step);
            Ok(None)
        }
    }

    impl ReportManager for Recorder {
        fn start(&mut self, _start_time: std::time::Instant) {}

        fn report_training(
            &mut self,
            step: u64,
            _num_steps: i64,
            _learning_rate: f64,
            _stats: Statistics,
            _multigpu: bool,
        ) -> Result<Statistics> {
            self.reports.lock().unwrap().push(step);
            Ok(Statistics::new())
        }

        fn report_step(
            &mut self,
            _lr: f64,
            step: u64,
            valid_stats: Option<&Statistics>,
        ) -> Result<()> {
            let words = valid_stats.map_or(0, |s| s.n_words);
            self.validations.lock().unwrap().push((step, words));
            Ok(())
        }
    }

    fn batch(size: usize) -> Batch {
        let tgt = Array3::from_shape_fn((3, size, 1), |(t, _, _)| if t == 0 { 2 } else { 4 });
        Batch::new(Array2::from_elem((2, size), 7), tgt)
    }

    fn batches(n: usize) -> Vec<Batch> {
        (0..n).map(|_| batch(2)).collect()
    }

    fn quiet(config: TrainerConfig) -> TrainerConfig {
        config.with_checkpoint_steps(0, 0).with_valid_steps(1_000).with_train_steps(0)
    }

    #[test]
    fn test_end_to_end_cadence() {
        let config = TrainerConfig::default()
            .with_accum_count(4)
            .with_valid_steps(5)
            .with_checkpoint_steps(2, 2)
            .with_train_steps(0);
        let recorder = Recorder::default();
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let mut trainer = TrainerBuilder::new(config)
            .saver(Box::new(recorder.clone()))
            .report_manager(Box::new(recorder.clone()))
            .build(MockModel::new(0), train_loss, valid_loss, MockOptim::default())
            .unwrap();

        let stats = trainer.train(batches(20), Some(|| batches(3))).unwrap();

        assert_eq!(stats.n_words, 40);
        assert_eq!(trainer.optimizer().steps, vec![false; 5]);
        assert_eq!(*recorder.reports.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(*recorder.validations.lock().unwrap(), vec![(5, 6)]);
        assert_eq!(*recorder.saves.lock().unwrap(), vec![2, 4, 5]);
        assert_eq!(trainer.state(), LoopState::Done);
    }

    #[test]
    fn test_accumulated_gradients_step_once_per_group() {
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let mut trainer = TrainerBuilder::new(quiet(TrainerConfig::default().with_accum_count(3)))
            .build(MockModel::new(0), train_loss, valid_loss, MockOptim::default())
            .unwrap();

        trainer.train_only(batches(7)).unwrap();

        assert_eq!(trainer.optimizer().steps.len(), 3);
        // groups of 3, 3 and 1 unit gradients
        assert!((trainer.model().value() + 0.7).abs() < 1e-5);
    }

    #[test]
    fn test_step_budget_stops_at_group_boundary() {
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let config = quiet(TrainerConfig::default().with_accum_count(2)).with_train_steps(2);
        let mut trainer = TrainerBuilder::new(config)
            .build(MockModel::new(0), train_loss, valid_loss, MockOptim::default())
            .unwrap();

        let stats = trainer.train_only(batches(10)).unwrap();
        assert_eq!(trainer.optimizer().steps.len(), 2);
        assert_eq!(stats.n_words, 8);
    }

    #[test]
    fn test_rl_separate_step() {
        let (train_loss, seen) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let config = quiet(TrainerConfig::default().with_rl(0, 1.0).with_seed(7));
        let mut trainer = TrainerBuilder::new(config)
            .reward_evaluator(Box::new(HalfF1))
            .build(MockModel::new(2), train_loss, valid_loss, MockOptim::default())
            .unwrap();
        assert!(trainer.rl_triggered());

        trainer.train_only(batches(3)).unwrap();

        assert_eq!(
            trainer.optimizer().steps,
            vec![true, false, true, false, true, false]
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 9);
        assert_eq!(seen[0].1, Some(vec![0.5, 0.5]));
        assert_eq!(seen[1].1, Some(vec![0.5, 0.5]));
        assert_eq!(seen[2].1, None);
    }

    #[test]
    fn test_rl_shared_step_folds_gradients() {
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let mut config = quiet(TrainerConfig::default().with_rl(0, 1.0).with_seed(7));
        config.rl_step_mode = RlStepMode::Shared;
        let mut trainer = TrainerBuilder::new(config)
            .reward_evaluator(Box::new(HalfF1))
            .build(MockModel::new(2), train_loss, valid_loss, MockOptim::default())
            .unwrap();

        trainer.train_only(batches(3)).unwrap();

        assert_eq!(trainer.optimizer().steps, vec![false; 3]);
        // two beam gradients plus the supervised one per step
        assert!((trainer.model().value() + 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_rl_waits_for_threshold() {
        let (train_loss, seen) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let config = quiet(TrainerConfig::default().with_rl(2, 1.0).with_seed(7));
        let mut trainer = TrainerBuilder::new(config)
            .reward_evaluator(Box::new(HalfF1))
            .build(MockModel::new(1), train_loss, valid_loss, MockOptim::default())
            .unwrap();

        trainer.train_only(batches(4)).unwrap();

        assert_eq!(
            trainer.optimizer().steps,
            vec![false, false, true, false, true, false]
        );
        let scaled = seen.lock().unwrap().iter().filter(|(_, s)| s.is_some()).count();
        assert_eq!(scaled, 2);
    }

    #[test]
    fn test_rl_trigger_never_fires_at_zero_probability() {
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let config = quiet(TrainerConfig::default().with_rl(0, 0.0));
        let mut trainer = TrainerBuilder::new(config)
            .reward_evaluator(Box::new(HalfF1))
            .build(MockModel::new(2), train_loss, valid_loss, MockOptim::default())
            .unwrap();
        assert!(!trainer.rl_triggered());

        trainer.train_only(batches(2)).unwrap();
        assert_eq!(trainer.optimizer().steps, vec![false, false]);
    }

    #[test]
    fn test_rl_without_beam_output_is_fatal() {
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let config = quiet(TrainerConfig::default().with_rl(0, 1.0));
        let mut trainer = TrainerBuilder::new(config)
            .reward_evaluator(Box::new(HalfF1))
            .build(MockModel::new(0), train_loss, valid_loss, MockOptim::default())
            .unwrap();

        let err = trainer.train_only(batches(1)).unwrap_err();
        assert!(matches!(err, SeqTrainError::Contract(_)));
    }

    #[test]
    fn test_decoder_state_detached_after_every_backward() {
        let (train_loss, _) = MockLoss::new();
        let attached = train_loss.attached.clone();
        let (valid_loss, _) = MockLoss::new();
        let (model, detaches) = MockModel::stateful(2);
        let config = quiet(TrainerConfig::default().with_rl(0, 1.0).with_seed(7));
        let mut trainer = TrainerBuilder::new(config)
            .reward_evaluator(Box::new(HalfF1))
            .build(model, train_loss, valid_loss, MockOptim::default())
            .unwrap();

        trainer.train_only(batches(2)).unwrap();

        // per batch: one detach per beam slot, then one after the supervised pass
        assert_eq!(detaches.load(Ordering::SeqCst), 6);
        // only the first beam loss sees the state the forward pass attached
        assert_eq!(
            *attached.lock().unwrap(),
            vec![true, false, false, true, false, false]
        );
    }

    #[test]
    fn test_supervised_pass_detaches_decoder_state() {
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let (model, detaches) = MockModel::stateful(0);
        let config = quiet(TrainerConfig::default().with_accum_count(2));
        let mut trainer = TrainerBuilder::new(config)
            .build(model, train_loss, valid_loss, MockOptim::default())
            .unwrap();

        trainer.train_only(batches(3)).unwrap();

        assert_eq!(detaches.load(Ordering::SeqCst), 3);
        assert!(!trainer.model().state_attached());
    }

    #[test]
    fn test_build_puts_model_in_training_mode() {
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let mut model = MockModel::new(2);
        model.set_training(false);
        let config = quiet(TrainerConfig::default().with_rl(0, 1.0).with_seed(7));
        let mut trainer = TrainerBuilder::new(config)
            .reward_evaluator(Box::new(HalfF1))
            .build(model, train_loss, valid_loss, MockOptim::default())
            .unwrap();
        assert!(trainer.model().training);

        trainer.train_only(batches(1)).unwrap();
        assert_eq!(trainer.optimizer().steps, vec![true, false]);
    }

    #[test]
    fn test_averaged_validation_leaves_live_model_alone() {
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, valid_seen) = MockLoss::new();
        let config = quiet(TrainerConfig::default())
            .with_average(0.5, 1)
            .with_valid_steps(1);
        let mut trainer = TrainerBuilder::new(config)
            .report_manager(Box::new(Recorder::default()))
            .build(MockModel::new(0), train_loss, valid_loss, MockOptim::default())
            .unwrap();

        trainer.train(batches(2), Some(|| batches(1))).unwrap();

        let seen: Vec<f32> = valid_seen.lock().unwrap().iter().map(|(v, _)| *v).collect();
        assert_eq!(seen.len(), 2);
        assert!((seen[0] + 0.1).abs() < 1e-5);
        // decay at step 2 is max(0.5, 0.75)
        assert!((seen[1] + 0.175).abs() < 1e-5);
        assert!((trainer.model().value() + 0.2).abs() < 1e-5);
        assert!(trainer.model().training);
        assert!(trainer.average().is_some());
    }

    #[test]
    fn test_plain_validation_restores_training_mode() {
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let mut trainer = TrainerBuilder::new(quiet(TrainerConfig::default()))
            .build(MockModel::new(0), train_loss, valid_loss, MockOptim::default())
            .unwrap();

        let stats = trainer.validate(batches(3)).unwrap();
        assert_eq!(stats.n_words, 6);
        assert!(trainer.model().training);
        assert!(trainer.optimizer().steps.is_empty());
    }

    #[test]
    fn test_builder_rejects_invalid_setups() {
        let build = |config: TrainerConfig, with_evaluator: bool| {
            let (train_loss, _) = MockLoss::new();
            let (valid_loss, _) = MockLoss::new();
            let mut builder = TrainerBuilder::new(config);
            if with_evaluator {
                builder = builder.reward_evaluator(Box::new(HalfF1));
            }
            builder
                .build(MockModel::new(0), train_loss, valid_loss, MockOptim::default())
                .map(|_| ())
        };

        let mut truncated = TrainerConfig::default().with_accum_count(2);
        truncated.trunc_size = 5;
        assert!(matches!(build(truncated, false), Err(SeqTrainError::Config(_))));

        let rl = TrainerConfig::default().with_rl(10, 0.2);
        assert!(matches!(build(rl.clone(), false), Err(SeqTrainError::Config(_))));
        assert!(build(rl, true).is_ok());

        let distributed = TrainerConfig::default().with_world(2, 0);
        assert!(matches!(build(distributed, false), Err(SeqTrainError::Config(_))));
    }

    #[test]
    fn test_builder_checks_collectives_world() {
        let handle = crate::training::LocalGroup::handles(2, std::time::Duration::from_millis(50))
            .into_iter()
            .next()
            .unwrap();
        let (train_loss, _) = MockLoss::new();
        let (valid_loss, _) = MockLoss::new();
        let result = TrainerBuilder::new(TrainerConfig::default().with_world(4, 0))
            .collectives(Arc::new(handle))
            .build(MockModel::new(0), train_loss, valid_loss, MockOptim::default());
        assert!(matches!(result, Err(SeqTrainError::Config(_))));
    }
}
