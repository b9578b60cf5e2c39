use crate::error::{Result, TrainError};
use burn::prelude::*;
use std::collections::BTreeMap;
use tracing::info;

/// Running per-term loss sums for one epoch.
///
/// Owned by the trainer and replaced at every epoch boundary.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LossLog {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
    batches: usize,
}

impl LossLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum already-weighted loss terms into one objective, recording each
    /// term's scalar value under its name.
    pub fn aggregate<B: Backend>(&mut self, terms: Vec<(&str, Tensor<B, 1>)>) -> Result<Tensor<B, 1>> {
        let mut total: Option<Tensor<B, 1>> = None;
        for (name, term) in terms {
            self.record(name, term.clone().into_scalar().elem::<f64>());
            total = Some(match total {
                Some(total) => total + term,
                None => term,
            });
        }
        total.ok_or_else(|| TrainError::Configuration("no loss terms supplied".to_string()))
    }

    pub fn record(&mut self, name: &str, value: f64) {
        *self.sums.entry(name.to_string()).or_insert(0.0) += value;
        *self.counts.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Mark the end of one optimization step.
    pub fn finish_batch(&mut self) {
        self.batches += 1;
    }

    pub fn sum(&self, name: &str) -> Option<f64> {
        self.sums.get(name).copied()
    }

    pub fn count(&self, name: &str) -> usize {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sums.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    /// Trailing average of every term over the batches seen so far.
    pub fn averages(&self) -> BTreeMap<String, f64> {
        self.sums
            .iter()
            .map(|(name, sum)| {
                let count = self.count(name).max(1);
                (name.clone(), sum / count as f64)
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.sums.clear();
        self.counts.clear();
        self.batches = 0;
    }

    /// One-line progress summary, e.g. `G_adv: 1.234e-1 | D_true: 5.000e-1`.
    pub fn summary(&self) -> String {
        self.averages()
            .iter()
            .map(|(name, value)| format!("{name}: {value:.3e}"))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Receiver for per-epoch loss averages.
pub trait MetricsSink {
    fn log_epoch(&mut self, epoch: usize, averages: &BTreeMap<String, f64>);
}

/// Emits epoch averages as `tracing` events.
#[derive(Clone, Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log_epoch(&mut self, epoch: usize, averages: &BTreeMap<String, f64>) {
        for (name, value) in averages {
            info!(epoch, term = %name, value, "epoch loss average");
        }
    }
}

/// Keeps every reported epoch in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    pub epochs: Vec<(usize, BTreeMap<String, f64>)>,
}

impl MetricsSink for MemorySink {
    fn log_epoch(&mut self, epoch: usize, averages: &BTreeMap<String, f64>) {
        self.epochs.push((epoch, averages.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn scalar(value: f32) -> Tensor<TestBackend, 1> {
        Tensor::from_data(TensorData::new(vec![value], [1]), &Default::default())
    }

    #[test]
    fn aggregate_returns_unweighted_sum() {
        let mut log = LossLog::new();
        let total = log
            .aggregate(vec![("a", scalar(1.5)), ("b", scalar(2.25))])
            .unwrap();

        assert_relative_eq!(total.into_scalar().elem::<f64>(), 3.75, epsilon = 1e-6);
        assert_relative_eq!(log.sum("a").unwrap(), 1.5, epsilon = 1e-6);
        assert_relative_eq!(log.sum("b").unwrap(), 2.25, epsilon = 1e-6);
    }

    #[test]
    fn sums_accumulate_across_an_epoch() {
        let mut log = LossLog::new();
        let values = [(0.5, 1.0), (1.5, 3.0), (2.0, -1.0)];
        for (a, b) in values {
            log.aggregate(vec![("a", scalar(a)), ("b", scalar(b))]).unwrap();
            log.finish_batch();
        }

        assert_relative_eq!(log.sum("a").unwrap(), 4.0, epsilon = 1e-6);
        assert_relative_eq!(log.sum("b").unwrap(), 3.0, epsilon = 1e-6);
        assert_eq!(log.count("a"), 3);
        assert_eq!(log.batches(), 3);
        assert_relative_eq!(log.averages()["b"], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn reset_clears_every_term() {
        let mut log = LossLog::new();
        log.aggregate(vec![("a", scalar(1.0))]).unwrap();
        log.finish_batch();

        log.reset();

        assert!(log.is_empty());
        assert_eq!(log.sum("a"), None);
        assert_eq!(log.batches(), 0);
    }

    #[test]
    fn empty_term_list_is_an_error() {
        let mut log = LossLog::new();
        assert!(log.aggregate::<TestBackend>(Vec::new()).is_err());
    }

    #[test]
    fn summary_lists_terms_in_name_order() {
        let mut log = LossLog::new();
        log.record("b", 2.0);
        log.record("a", 1.0);

        assert_eq!(log.summary(), "a: 1.000e0 | b: 2.000e0");
    }
}
