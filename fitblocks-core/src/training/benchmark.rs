//! Timing summaries for benchmark, profile and dataset throughput runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Nearest-rank percentile of an ascending slice; 0 when empty.
pub fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[idx.min(sorted_values.len() - 1)]
}

pub(crate) fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1e3
}

/// Summary of a set of wall-clock samples, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub samples: usize,
    pub total_ms: f64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl TimingStats {
    pub fn from_samples(samples_ms: &[f64]) -> Self {
        if samples_ms.is_empty() {
            return Self::default();
        }
        let mut sorted = samples_ms.to_vec();
        sorted.sort_by(f64::total_cmp);
        let total: f64 = sorted.iter().sum();
        Self {
            samples: sorted.len(),
            total_ms: total,
            mean_ms: total / sorted.len() as f64,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
        }
    }
}

/// Measured training-step performance. State touched by the measured steps
/// is rolled back afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub model: String,
    pub batch_size: usize,
    pub burn_iters: usize,
    pub min_iters: usize,
    pub step: TimingStats,
    pub steps_per_second: f64,
    pub examples_per_second: f64,
    pub timestamp: DateTime<Utc>,
}

impl BenchmarkReport {
    pub fn new(model: &str, batch_size: usize, burn_iters: usize, step_ms: &[f64]) -> Self {
        let step = TimingStats::from_samples(step_ms);
        let steps_per_second = if step.total_ms > 0.0 {
            step.samples as f64 / (step.total_ms / 1e3)
        } else {
            0.0
        };
        Self {
            model: model.to_string(),
            batch_size,
            burn_iters,
            min_iters: step.samples,
            steps_per_second,
            examples_per_second: steps_per_second * batch_size as f64,
            step,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} steps, {:.3} ms/step (p95 {:.3} ms), {:.1} examples/s",
            self.model, self.step.samples, self.step.mean_ms, self.step.p95_ms, self.examples_per_second
        )
    }
}

/// Parts of one training step timed by `profile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Data,
    Forward,
    Backward,
    Apply,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Data => "data",
            Self::Forward => "forward",
            Self::Backward => "backward",
            Self::Apply => "apply",
        })
    }
}

/// Per-phase samples collected while profiling.
#[derive(Debug, Clone, Default)]
pub struct PhaseSamples {
    samples: BTreeMap<Phase, Vec<f64>>,
}

impl PhaseSamples {
    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        self.samples.entry(phase).or_default().push(millis(elapsed));
    }

    /// Append every sample from `other`.
    pub fn absorb(&mut self, other: PhaseSamples) {
        for (phase, samples) in other.samples {
            self.samples.entry(phase).or_default().extend(samples);
        }
    }

    pub fn summarize(&self) -> BTreeMap<Phase, TimingStats> {
        self.samples
            .iter()
            .map(|(phase, s)| (*phase, TimingStats::from_samples(s)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileReport {
    pub model: String,
    pub batch_size: usize,
    pub burn_iters: usize,
    pub phases: BTreeMap<Phase, TimingStats>,
    pub step: TimingStats,
    pub timestamp: DateTime<Utc>,
}

impl ProfileReport {
    /// Phase whose mean time is largest.
    pub fn dominant_phase(&self) -> Option<Phase> {
        self.phases
            .iter()
            .max_by(|a, b| a.1.mean_ms.total_cmp(&b.1.mean_ms))
            .map(|(p, _)| *p)
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {} profiled steps", self.model, self.step.samples)?;
        for (phase, stats) in &self.phases {
            let share = if self.step.total_ms > 0.0 {
                100.0 * stats.total_ms / self.step.total_ms
            } else {
                0.0
            };
            writeln!(f, "  {phase:<9} {:>9.3} ms/step {share:>5.1}%", stats.mean_ms)?;
        }
        write!(f, "  {:<9} {:>9.3} ms/step", "total", self.step.mean_ms)
    }
}

/// Throughput of the data source alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetReport {
    pub source: String,
    pub split: String,
    pub batches: usize,
    pub examples: usize,
    pub elapsed_ms: f64,
    pub batches_per_second: f64,
    pub examples_per_second: f64,
    pub timestamp: DateTime<Utc>,
}

impl DatasetReport {
    pub fn new(source: &str, split: &str, batches: usize, examples: usize, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = |n: usize| if secs > 0.0 { n as f64 / secs } else { 0.0 };
        Self {
            source: source.to_string(),
            split: split.to_string(),
            batches,
            examples,
            elapsed_ms: millis(elapsed),
            batches_per_second: rate(batches),
            examples_per_second: rate(examples),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for DatasetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: {} batches / {} examples in {:.1} ms ({:.1} batches/s, {:.1} examples/s)",
            self.source,
            self.split,
            self.batches,
            self.examples,
            self.elapsed_ms,
            self.batches_per_second,
            self.examples_per_second
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 10.0);
        assert!((percentile(&values, 50.0) - 5.5).abs() < 1.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_timing_stats() {
        let stats = TimingStats::from_samples(&[3.0, 1.0, 2.0]);
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.total_ms, 6.0);
        assert_eq!(stats.mean_ms, 2.0);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 3.0);
        assert_eq!(stats.p50_ms, 2.0);
        assert_eq!(TimingStats::from_samples(&[]), TimingStats::default());
    }

    #[test]
    fn test_benchmark_throughput() {
        let report = BenchmarkReport::new("dense", 32, 2, &[10.0, 10.0]);
        assert_eq!(report.min_iters, 2);
        assert!((report.steps_per_second - 100.0).abs() < 1e-9);
        assert!((report.examples_per_second - 3200.0).abs() < 1e-9);
    }

    #[test]
    fn test_profile_dominant_phase() {
        let mut samples = PhaseSamples::default();
        samples.record(Phase::Data, Duration::from_millis(1));
        samples.record(Phase::Forward, Duration::from_millis(5));
        samples.record(Phase::Apply, Duration::from_millis(2));
        let report = ProfileReport {
            model: "m".into(),
            batch_size: 4,
            burn_iters: 0,
            phases: samples.summarize(),
            step: TimingStats::from_samples(&[8.0]),
            timestamp: Utc::now(),
        };
        assert_eq!(report.dominant_phase(), Some(Phase::Forward));
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["phases"]["forward"]["mean_ms"].as_f64().unwrap() > 4.0);
    }

    #[test]
    fn test_dataset_report_rates() {
        let report = DatasetReport::new("src", "train", 10, 320, Duration::from_secs(2));
        assert_eq!(report.batches_per_second, 5.0);
        assert_eq!(report.examples_per_second, 160.0);
    }
}
