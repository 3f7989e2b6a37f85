//! Metric logger traits and composites.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Trait for logging metrics to various backends.
pub trait MetricLogger: Send + Sync {
    /// Log a scalar value (e.g. learning rate, loss).
    fn log_scalar(&self, name: &str, value: f64, step: u64);

    /// Log a set of metrics collected in a map.
    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64);

    /// Close the logger and flush any pending writes.
    fn close(&self) {}
}

/// A logger that does nothing.
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_scalar(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_metrics(&self, _metrics: &HashMap<String, f64>, _step: u64) {}
}

/// A composite logger that dispatches to multiple backends.
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricLogger for CompositeLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log_scalar(name, value, step);
        }
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        for logger in &self.loggers {
            logger.log_metrics(metrics, step);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}

/// Keeps every logged value in memory.
///
/// Clones share the same record.
#[derive(Clone, Default)]
pub struct MemoryLogger {
    records: Arc<Mutex<Vec<(u64, String, f64)>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(step, name, value)` triples in logging order.
    pub fn records(&self) -> Vec<(u64, String, f64)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Steps at which `name` was logged.
    pub fn steps_for(&self, name: &str) -> Vec<u64> {
        self.records()
            .into_iter()
            .filter(|(_, n, _)| n == name)
            .map(|(step, _, _)| step)
            .collect()
    }
}

impl MetricLogger for MemoryLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        if let Ok(mut records) = self.records.lock() {
            records.push((step, name.to_string(), value));
        }
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        let mut keys: Vec<_> = metrics.keys().collect();
        keys.sort();
        for key in keys {
            self.log_scalar(key, metrics[key], step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_dispatches_to_all() {
        let a = MemoryLogger::new();
        let b = MemoryLogger::new();
        let mut composite = CompositeLogger::new(vec![Box::new(a.clone())]);
        composite.add(Box::new(b.clone()));
        composite.add(Box::new(NoOpLogger));
        assert_eq!(composite.len(), 3);

        composite.log_scalar("lr", 0.5, 3);
        let mut metrics = HashMap::new();
        metrics.insert("train/ppl".to_string(), 2.0);
        metrics.insert("train/acc".to_string(), 50.0);
        composite.log_metrics(&metrics, 4);
        composite.close();

        for logger in [&a, &b] {
            assert_eq!(
                logger.records(),
                vec![
                    (3, "lr".to_string(), 0.5),
                    (4, "train/acc".to_string(), 50.0),
                    (4, "train/ppl".to_string(), 2.0),
                ]
            );
        }
        assert_eq!(a.steps_for("train/ppl"), vec![4]);
    }
}
