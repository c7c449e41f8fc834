//! Timing hooks for impression generation and pod assembly.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const COMBINATION_GENERATOR_V1: &str = "combination_generator_v1";
pub const COMPETITIVE_EXCLUSION_V1: &str = "competitive_exclusion_v1";

/// Sink for pod-level timings. Each call carries the algorithm name and
/// the size of the work it measured.
pub trait PodMetrics: Send + Sync {
    fn record_impression_generation(&self, algorithm: &str, impressions: usize, elapsed: Duration);
    fn record_combination_generation(&self, algorithm: &str, combinations: usize, elapsed: Duration);
    fn record_competitive_exclusion(&self, algorithm: &str, response_bids: usize, elapsed: Duration);
}

/// Emits histograms through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderPodMetrics;

impl PodMetrics for RecorderPodMetrics {
    fn record_impression_generation(&self, algorithm: &str, impressions: usize, elapsed: Duration) {
        metrics::histogram!(
            "adpod.impression_generation_seconds",
            "algorithm" => algorithm.to_string(),
            "no_of_impressions" => impressions.to_string()
        )
        .record(elapsed.as_secs_f64());
    }

    fn record_combination_generation(&self, algorithm: &str, combinations: usize, elapsed: Duration) {
        metrics::histogram!(
            "adpod.combination_generation_seconds",
            "algorithm" => algorithm.to_string(),
            "total_combinations" => combinations.to_string()
        )
        .record(elapsed.as_secs_f64());
    }

    fn record_competitive_exclusion(&self, algorithm: &str, response_bids: usize, elapsed: Duration) {
        metrics::histogram!(
            "adpod.competitive_exclusion_seconds",
            "algorithm" => algorithm.to_string(),
            "no_of_response_bids" => response_bids.to_string()
        )
        .record(elapsed.as_secs_f64());
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPodMetrics;

impl PodMetrics for NoopPodMetrics {
    fn record_impression_generation(&self, _: &str, _: usize, _: Duration) {}
    fn record_combination_generation(&self, _: &str, _: usize, _: Duration) {}
    fn record_competitive_exclusion(&self, _: &str, _: usize, _: Duration) {}
}

/// Forwards every timing to each of its sinks in order.
#[derive(Default, Clone)]
pub struct FanoutPodMetrics {
    sinks: Vec<Arc<dyn PodMetrics>>,
}

impl FanoutPodMetrics {
    pub fn new(sinks: Vec<Arc<dyn PodMetrics>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl PodMetrics for FanoutPodMetrics {
    fn record_impression_generation(&self, algorithm: &str, impressions: usize, elapsed: Duration) {
        for sink in &self.sinks {
            sink.record_impression_generation(algorithm, impressions, elapsed);
        }
    }

    fn record_combination_generation(&self, algorithm: &str, combinations: usize, elapsed: Duration) {
        for sink in &self.sinks {
            sink.record_combination_generation(algorithm, combinations, elapsed);
        }
    }

    fn record_competitive_exclusion(&self, algorithm: &str, response_bids: usize, elapsed: Duration) {
        for sink in &self.sinks {
            sink.record_competitive_exclusion(algorithm, response_bids, elapsed);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodTiming {
    ImpressionGeneration,
    CombinationGeneration,
    CompetitiveExclusion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodMetricRecord {
    pub timing: PodTiming,
    pub algorithm: String,
    pub count: usize,
    pub elapsed: Duration,
}

/// Keeps every record in memory. Used by the simulator report and tests.
#[derive(Debug, Default)]
pub struct MemoryPodMetrics {
    records: Mutex<Vec<PodMetricRecord>>,
}

impl MemoryPodMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PodMetricRecord> {
        self.records.lock().clone()
    }

    fn push(&self, timing: PodTiming, algorithm: &str, count: usize, elapsed: Duration) {
        self.records.lock().push(PodMetricRecord {
            timing,
            algorithm: algorithm.to_string(),
            count,
            elapsed,
        });
    }
}

impl PodMetrics for MemoryPodMetrics {
    fn record_impression_generation(&self, algorithm: &str, impressions: usize, elapsed: Duration) {
        self.push(PodTiming::ImpressionGeneration, algorithm, impressions, elapsed);
    }

    fn record_combination_generation(&self, algorithm: &str, combinations: usize, elapsed: Duration) {
        self.push(PodTiming::CombinationGeneration, algorithm, combinations, elapsed);
    }

    fn record_competitive_exclusion(&self, algorithm: &str, response_bids: usize, elapsed: Duration) {
        self.push(PodTiming::CompetitiveExclusion, algorithm, response_bids, elapsed);
    }
}
