//! Training and validation reports.

use crate::log::{ConsoleLogger, MetricLogger};
use crate::stats::Statistics;
use crate::training::Collectives;
use crate::utils::{abbreviate, format_duration};
use crate::Result;
use std::sync::Arc;
use std::time::Instant;

/// Receives progress from the trainer.
pub trait ReportManager: Send {
    /// Called once when the loop starts.
    fn start(&mut self, start_time: Instant);

    /// Offer the current reporting window at `step`.
    ///
    /// Returns the window to keep accumulating into: a fresh one when a
    /// report was emitted, `stats` unchanged otherwise. With `multigpu` every
    /// worker must make this call at the same steps.
    fn report_training(
        &mut self,
        step: u64,
        num_steps: i64,
        learning_rate: f64,
        stats: Statistics,
        multigpu: bool,
    ) -> Result<Statistics>;

    /// Report the outcome of a validation pass.
    fn report_step(
        &mut self,
        learning_rate: f64,
        step: u64,
        valid_stats: Option<&Statistics>,
    ) -> Result<()>;
}

/// Reports through a [`MetricLogger`] every `report_every` steps.
pub struct LogReportManager {
    report_every: u64,
    logger: Box<dyn MetricLogger>,
    collectives: Option<Arc<dyn Collectives>>,
    start_time: Option<Instant>,
}

impl LogReportManager {
    pub fn new(report_every: u64) -> Self {
        Self::with_logger(report_every, Box::new(ConsoleLogger::new()))
    }

    pub fn with_logger(report_every: u64, logger: Box<dyn MetricLogger>) -> Self {
        Self {
            report_every: report_every.max(1),
            logger,
            collectives: None,
            start_time: None,
        }
    }

    /// Gather reporting windows over `collectives` when reporting multi-worker.
    pub fn with_collectives(mut self, collectives: Arc<dyn Collectives>) -> Self {
        self.collectives = Some(collectives);
        self
    }

    fn is_master(&self) -> bool {
        self.collectives.as_ref().map_or(true, |c| c.is_master())
    }

    fn elapsed(&self) -> f64 {
        self.start_time.map_or(0.0, |t| t.elapsed().as_secs_f64())
    }
}

impl ReportManager for LogReportManager {
    fn start(&mut self, start_time: Instant) {
        self.start_time = Some(start_time);
    }

    fn report_training(
        &mut self,
        step: u64,
        num_steps: i64,
        learning_rate: f64,
        stats: Statistics,
        multigpu: bool,
    ) -> Result<Statistics> {
        if step % self.report_every != 0 {
            return Ok(stats);
        }

        let stats = match (&self.collectives, multigpu) {
            (Some(collectives), true) => stats.all_gather(collectives.as_ref())?,
            _ => stats,
        };

        if self.is_master() {
            let elapsed = stats.elapsed_secs().max(1e-9);
            tracing::info!(
                step,
                num_steps,
                acc = stats.accuracy(),
                ppl = stats.ppl(),
                xent = stats.xent(),
                lr = learning_rate,
                "Step {}/{}; {}/{} tok/s; {} elapsed",
                step,
                num_steps,
                abbreviate((stats.n_src_words as f64 / elapsed) as u64),
                abbreviate((stats.n_words as f64 / elapsed) as u64),
                format_duration(self.elapsed())
            );
            let mut metrics = stats.to_metrics("train/");
            metrics.insert("train/lr".to_string(), learning_rate);
            self.logger.log_metrics(&metrics, step);
        }

        Ok(Statistics::new())
    }

    fn report_step(
        &mut self,
        learning_rate: f64,
        step: u64,
        valid_stats: Option<&Statistics>,
    ) -> Result<()> {
        if !self.is_master() {
            return Ok(());
        }
        if let Some(stats) = valid_stats {
            tracing::info!(
                step,
                ppl = stats.ppl(),
                acc = stats.accuracy(),
                "Validation perplexity: {:.4}; accuracy: {:.2}",
                stats.ppl(),
                stats.accuracy()
            );
            let mut metrics = stats.to_metrics("valid/");
            metrics.insert("valid/lr".to_string(), learning_rate);
            self.logger.log_metrics(&metrics, step);
        }
        Ok(())
    }
}

impl Drop for LogReportManager {
    fn drop(&mut self) {
        self.logger.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLogger;
    use crate::training::LocalGroup;
    use std::time::Duration;

    #[test]
    fn test_reports_on_cadence_and_resets_window() {
        let logger = MemoryLogger::new();
        let mut report = LogReportManager::with_logger(2, Box::new(logger.clone()));
        report.start(Instant::now());

        let window = Statistics::with_counts(4.0, 8, 6);
        let kept = report.report_training(1, 10, 0.1, window.clone(), false).unwrap();
        assert_eq!(kept, window);

        let fresh = report.report_training(2, 10, 0.1, window, false).unwrap();
        assert_eq!(fresh, Statistics::new());
        assert_eq!(logger.steps_for("train/acc"), vec![2]);
        assert_eq!(logger.steps_for("train/lr"), vec![2]);
    }

    #[test]
    fn test_validation_report() {
        let logger = MemoryLogger::new();
        let mut report = LogReportManager::with_logger(1, Box::new(logger.clone()));
        report.report_step(0.5, 5, None).unwrap();
        assert!(logger.records().is_empty());

        report
            .report_step(0.5, 5, Some(&Statistics::with_counts(2.0, 4, 4)))
            .unwrap();
        let acc: Vec<f64> = logger
            .records()
            .into_iter()
            .filter(|(_, n, _)| n == "valid/acc")
            .map(|(_, _, v)| v)
            .collect();
        assert_eq!(acc, vec![100.0]);
    }

    #[test]
    fn test_multigpu_report_gathers_windows() {
        let handles = LocalGroup::handles(2, Duration::from_secs(5));
        let workers: Vec<_> = handles
            .into_iter()
            .map(|handle| {
                std::thread::spawn(move || {
                    let rank = handle.rank();
                    let logger = MemoryLogger::new();
                    let mut report = LogReportManager::with_logger(1, Box::new(logger.clone()))
                        .with_collectives(Arc::new(handle));
                    let window = Statistics::with_counts(1.0, 2 + rank as u64, 1);
                    report.report_training(1, 1, 1.0, window, true).unwrap();
                    logger.records()
                })
            })
            .collect();
        let records: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        // only the primary logs, with both windows merged
        assert!(records[1].is_empty());
        let acc = records[0]
            .iter()
            .find(|(_, n, _)| n == "train/acc")
            .map(|(_, _, v)| *v)
            .unwrap();
        assert!((acc - 40.0).abs() < 1e-9);
    }
}
