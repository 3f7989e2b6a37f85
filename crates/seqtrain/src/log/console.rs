//! Console logging backend.

use super::MetricLogger;
use std::collections::HashMap;

/// Logger that prints metrics via tracing.
pub struct ConsoleLogger;

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }

    /// One line per report, keys sorted.
    pub fn format_line(metrics: &HashMap<String, f64>, step: u64) -> String {
        let mut output = format!("Step {}: ", step);
        let mut sorted_keys: Vec<_> = metrics.iter().collect();
        sorted_keys.sort_by(|a, b| a.0.cmp(b.0));

        for (i, (key, value)) in sorted_keys.iter().enumerate() {
            if i > 0 {
                output.push_str(", ");
            }
            output.push_str(&format!("{}={:.4}", key, value));
        }
        output
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::info!("Step {}: {} = {:.4}", step, name, value);
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        tracing::info!("{}", Self::format_line(metrics, step));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line_is_sorted() {
        let mut metrics = HashMap::new();
        metrics.insert("valid/ppl".to_string(), 12.5);
        metrics.insert("valid/acc".to_string(), 40.0);
        assert_eq!(
            ConsoleLogger::format_line(&metrics, 7),
            "Step 7: valid/acc=40.0000, valid/ppl=12.5000"
        );
    }
}
