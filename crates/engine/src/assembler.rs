//! Concurrent pod assembly.
//!
//! A small pool of blocking workers pulls duration sequences from a shared
//! enumerator, searches each one for its best bid assignment, and sends the
//! result back over a bounded channel. The orchestrator collects results
//! until the workers run dry, the deadline passes, or the caller cancels.

use crate::combination::{CombinationEnumerator, CombinationStats};
use crate::pod_metrics::{PodMetrics, COMBINATION_GENERATOR_V1, COMPETITIVE_EXCLUSION_V1};
use crate::search::{search_sequence, Candidate, SequenceResult};
use adpod_core::config::AdPodEngineConfig;
use adpod_core::types::{AdPodBid, BidBuckets, CtvBid, FilterReasonCode, PodShapeConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerConfig {
    pub worker_count: usize,
    /// Upper bound on how long results are collected.
    pub timeout: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            timeout: Duration::from_millis(10),
        }
    }
}

impl From<&AdPodEngineConfig> for AssemblerConfig {
    fn from(config: &AdPodEngineConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            timeout: Duration::from_millis(config.assembly_timeout_ms),
        }
    }
}

/// What one worker sends back for one sequence.
#[derive(Debug)]
struct WorkerResult {
    worker: usize,
    result: SequenceResult,
    /// Enumerator counters as of this worker's pull.
    stats: CombinationStats,
    combination_time: Duration,
    search_time: Duration,
}

/// Result of assembling one pod.
#[derive(Debug, Clone, Default)]
pub struct PodOutcome {
    /// `None` means no fill.
    pub bid: Option<AdPodBid>,
    /// Reason per bid id. Bids missing here never got a chance.
    pub filter_codes: HashMap<String, FilterReasonCode>,
    pub sequences_searched: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub stats: CombinationStats,
}

impl PodOutcome {
    pub fn reason_for(&self, bid_id: &str) -> FilterReasonCode {
        self.filter_codes
            .get(bid_id)
            .copied()
            .unwrap_or(FilterReasonCode::DidNotGetChance)
    }

    /// Write the outcome's reason into every bid.
    pub fn annotate<'a>(&self, bids: impl IntoIterator<Item = &'a mut CtvBid>) {
        for bid in bids {
            bid.filter_reason = self.reason_for(bid.id());
        }
    }
}

pub struct AdPodAssembler {
    config: AssemblerConfig,
    metrics: Arc<dyn PodMetrics>,
}

impl AdPodAssembler {
    pub fn new(config: AssemblerConfig, metrics: Arc<dyn PodMetrics>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> AssemblerConfig {
        self.config
    }

    /// Build the best pod for `shape` out of `buckets`. Every bucket must
    /// already be ordered by (deal tier, price) descending.
    ///
    /// Cancelling `cancel` stops the workers and returns whatever was
    /// collected so far.
    pub async fn assemble(
        &self,
        request_id: &str,
        imp_id: &str,
        shape: &PodShapeConfig,
        buckets: Arc<BidBuckets>,
        cancel: &CancellationToken,
    ) -> PodOutcome {
        let enumerator = Arc::new(Mutex::new(CombinationEnumerator::new(
            shape.pod_min_duration,
            shape.pod_max_duration,
            shape,
            &buckets.counts(),
        )));
        let worker_count = self.config.worker_count.max(1);
        let (tx, mut rx) = mpsc::channel::<WorkerResult>(worker_count);
        let stop = cancel.child_token();

        for worker in 0..worker_count {
            let tx = tx.clone();
            let stop = stop.clone();
            let enumerator = enumerator.clone();
            let buckets = buckets.clone();
            let shape = *shape;
            tokio::task::spawn_blocking(move || {
                run_worker(worker, &enumerator, &buckets, &shape, &stop, &tx)
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let mut collected = Vec::new();
        let mut outcome = PodOutcome::default();
        let mut closed = false;
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(message) => collected.push(message),
                    None => {
                        closed = true;
                        break;
                    }
                },
                _ = &mut deadline => {
                    outcome.timed_out = true;
                    break;
                }
                _ = stop.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
            }
        }
        stop.cancel();

        if !closed {
            let request_id = request_id.to_string();
            tokio::spawn(async move {
                while let Some(late) = rx.recv().await {
                    debug!(
                        request_id = %request_id,
                        worker = late.worker,
                        durations = ?late.result.durations,
                        "discarding late pod search result"
                    );
                }
            });
        }

        let combination_time: Duration = collected.iter().map(|m| m.combination_time).sum();
        let search_time: Duration = collected.iter().map(|m| m.search_time).sum();
        self.metrics
            .record_combination_generation(COMBINATION_GENERATOR_V1, collected.len(), combination_time);
        self.metrics.record_competitive_exclusion(
            COMPETITIVE_EXCLUSION_V1,
            buckets.total_bids(),
            search_time,
        );

        // Workers may still hold the enumerator after a timeout.
        outcome.stats = match enumerator.try_lock() {
            Some(enumerator) => enumerator.stats(),
            None => collected
                .iter()
                .map(|m| m.stats)
                .max_by_key(CombinationStats::visited)
                .unwrap_or_default(),
        };
        outcome.sequences_searched = collected.len();

        let results: Vec<SequenceResult> = collected.into_iter().map(|m| m.result).collect();
        let (best, mut filter_codes) = reduce(&results);
        outcome.bid = best.map(|candidate| {
            let bids = candidate
                .bids
                .iter()
                .cloned()
                .map(|mut bid| {
                    filter_codes.insert(bid.id().to_string(), FilterReasonCode::WinningBid);
                    bid.filter_reason = FilterReasonCode::WinningBid;
                    bid
                })
                .collect();
            AdPodBid::from_bids(bids)
        });
        outcome.filter_codes = filter_codes;

        match &outcome.bid {
            Some(bid) => info!(
                request_id,
                imp_id,
                ads = bid.bids.len(),
                price = bid.price,
                deal_count = bid.deal_count,
                sequences = outcome.sequences_searched,
                timed_out = outcome.timed_out,
                "pod assembled"
            ),
            None => info!(
                request_id,
                imp_id,
                sequences = outcome.sequences_searched,
                timed_out = outcome.timed_out,
                cancelled = outcome.cancelled,
                "no pod fill"
            ),
        }

        outcome
    }
}

fn run_worker(
    worker: usize,
    enumerator: &Mutex<CombinationEnumerator>,
    buckets: &BidBuckets,
    shape: &PodShapeConfig,
    stop: &CancellationToken,
    tx: &mpsc::Sender<WorkerResult>,
) {
    let mut searched = 0usize;
    while !stop.is_cancelled() {
        let pulled = Instant::now();
        let (sequence, stats) = {
            let mut enumerator = enumerator.lock();
            let sequence = enumerator.next_sequence_until(|| stop.is_cancelled());
            (sequence, enumerator.stats())
        };
        let combination_time = pulled.elapsed();
        if sequence.is_empty() {
            break;
        }

        let started = Instant::now();
        let result = search_sequence(&sequence, buckets, shape, || stop.is_cancelled());
        let message = WorkerResult {
            worker,
            result,
            stats,
            combination_time,
            search_time: started.elapsed(),
        };
        searched += 1;

        if tx.blocking_send(message).is_err() {
            break;
        }
    }
    debug!(worker, searched, "pod search worker finished");
}

/// Best candidate across sequences plus the first rejection reason seen for
/// each bid. Ties keep the earlier result.
fn reduce(results: &[SequenceResult]) -> (Option<&Candidate>, HashMap<String, FilterReasonCode>) {
    let mut best: Option<&Candidate> = None;
    let mut filter_codes = HashMap::new();

    for result in results {
        for (id, reason) in &result.filtered {
            filter_codes.entry(id.clone()).or_insert(*reason);
        }
        if let Some(candidate) = &result.best {
            if best.map_or(true, |b| candidate.beats(b)) {
                best = Some(candidate);
            }
        }
    }

    (best, filter_codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod_metrics::{MemoryPodMetrics, NoopPodMetrics, PodTiming};
    use adpod_core::openrtb::Bid;

    fn bid(id: &str, price: f64, duration: i64, deal: bool, cat: &[&str]) -> CtvBid {
        CtvBid::new(
            Bid {
                id: id.to_string(),
                price,
                cat: cat.iter().map(|c| c.to_string()).collect(),
                ..Default::default()
            },
            duration,
            deal,
        )
    }

    fn shape(ads: (i64, i64), pod: (i64, i64), category: i64) -> PodShapeConfig {
        PodShapeConfig {
            min_ads: ads.0,
            max_ads: ads.1,
            slot_min_duration: 5,
            slot_max_duration: 30,
            pod_min_duration: pod.0,
            pod_max_duration: pod.1,
            advertiser_exclusion_percent: 100,
            category_exclusion_percent: category,
        }
    }

    fn assembler(metrics: Arc<dyn PodMetrics>) -> AdPodAssembler {
        AdPodAssembler::new(
            AssemblerConfig {
                worker_count: 3,
                timeout: Duration::from_secs(5),
            },
            metrics,
        )
    }

    fn deal_buckets() -> BidBuckets {
        BidBuckets::from_bids(vec![
            bid("b1", 6.339115524232314, 20, true, &[]),
            bid("b2", 3.532468782358357, 20, true, &[]),
            bid("b3", 5.0, 20, false, &[]),
            bid("b4", 5.0, 20, false, &[]),
            bid("b5", 3.4502433547413878, 10, true, &[]),
            bid("b6", 3.329644588311827, 10, true, &[]),
            bid("b7", 5.0, 10, false, &[]),
            bid("b8", 5.0, 10, false, &[]),
        ])
    }

    #[test]
    fn test_config_from_engine_section() {
        let config = AssemblerConfig::from(&AdPodEngineConfig {
            worker_count: 0,
            assembly_timeout_ms: 25,
            ..Default::default()
        });
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.timeout, Duration::from_millis(25));
        assert_eq!(AssemblerConfig::default().worker_count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_deal_bids_fill_the_pod() {
        let metrics = Arc::new(MemoryPodMetrics::new());
        let outcome = assembler(metrics.clone())
            .assemble(
                "req-1",
                "imp-1",
                &shape((4, 4), (60, 60), 100),
                Arc::new(deal_buckets()),
                &CancellationToken::new(),
            )
            .await;

        let pod = outcome.bid.clone().expect("pod should fill");
        let ids: Vec<&str> = pod.bids.iter().map(CtvBid::id).collect();
        assert_eq!(ids, vec!["b1", "b2", "b5", "b6"]);
        assert_eq!(pod.deal_count, 4);
        assert!((pod.price - 16.651472249643884).abs() < 1e-9);
        assert!(pod
            .bids
            .iter()
            .all(|b| b.filter_reason == FilterReasonCode::WinningBid));

        assert_eq!(outcome.sequences_searched, 1);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.reason_for("b1"), FilterReasonCode::WinningBid);
        assert_eq!(outcome.reason_for("b7"), FilterReasonCode::DidNotGetChance);

        let records = metrics.records();
        assert_eq!(records.len(), 2);
        let exclusion = records
            .iter()
            .find(|r| r.timing == PodTiming::CompetitiveExclusion)
            .unwrap();
        assert_eq!(exclusion.algorithm, COMPETITIVE_EXCLUSION_V1);
        assert_eq!(exclusion.count, 8);
        let generation = records
            .iter()
            .find(|r| r.timing == PodTiming::CombinationGeneration)
            .unwrap();
        assert_eq!(generation.count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_exclusion_reasons_are_annotated() {
        let mut buckets = BidBuckets::from_bids(vec![
            bid("a", 5.0, 30, false, &["IAB1"]),
            bid("b", 4.0, 30, false, &["IAB1"]),
            bid("c", 3.0, 30, false, &["IAB2"]),
        ]);
        let outcome = assembler(Arc::new(NoopPodMetrics))
            .assemble(
                "req-1",
                "imp-1",
                &shape((2, 2), (60, 60), 50),
                Arc::new(buckets.clone()),
                &CancellationToken::new(),
            )
            .await;

        let pod = outcome.bid.clone().unwrap();
        assert_eq!(pod.price, 8.0);

        outcome.annotate(buckets.iter_mut());
        let reasons: HashMap<&str, FilterReasonCode> =
            buckets.iter().map(|b| (b.id(), b.filter_reason)).collect();
        assert_eq!(reasons["a"], FilterReasonCode::WinningBid);
        assert_eq!(reasons["b"], FilterReasonCode::CategoryExclusion);
        assert_eq!(reasons["c"], FilterReasonCode::WinningBid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_best_sequence_wins() {
        // A lone 30s deal beats two non-deal 15s.
        let buckets = BidBuckets::from_bids(vec![
            bid("long", 2.0, 30, true, &[]),
            bid("s1", 9.0, 15, false, &[]),
            bid("s2", 8.0, 15, false, &[]),
        ]);
        let outcome = assembler(Arc::new(NoopPodMetrics))
            .assemble(
                "req-1",
                "imp-1",
                &shape((1, 2), (30, 30), 100),
                Arc::new(buckets),
                &CancellationToken::new(),
            )
            .await;

        let pod = outcome.bid.as_ref().unwrap();
        assert_eq!(pod.bids.len(), 1);
        assert_eq!(pod.bids[0].id(), "long");
        assert_eq!(outcome.sequences_searched, 2);
        assert_eq!(outcome.reason_for("s1"), FilterReasonCode::DidNotGetChance);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_empty_buckets_do_not_fill() {
        let outcome = assembler(Arc::new(NoopPodMetrics))
            .assemble(
                "req-1",
                "imp-1",
                &shape((1, 3), (15, 60), 100),
                Arc::new(BidBuckets::default()),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.bid.is_none());
        assert_eq!(outcome.sequences_searched, 0);
        assert!(outcome.filter_codes.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = assembler(Arc::new(NoopPodMetrics))
            .assemble(
                "req-1",
                "imp-1",
                &shape((4, 4), (60, 60), 100),
                Arc::new(deal_buckets()),
                &cancel,
            )
            .await;
        assert!(outcome.bid.is_none());
        assert_eq!(outcome.sequences_searched, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_deadline_bounds_a_large_search() {
        let buckets = BidBuckets::from_bids(
            (1..=40).map(|d| bid(&format!("d{d}"), d as f64, d, false, &[])),
        );
        let assembler = AdPodAssembler::new(
            AssemblerConfig {
                worker_count: 3,
                timeout: Duration::from_millis(10),
            },
            Arc::new(NoopPodMetrics),
        );

        let started = Instant::now();
        let outcome = assembler
            .assemble(
                "req-1",
                "imp-1",
                &shape((1, 9), (1, 60), 100),
                Arc::new(buckets),
                &CancellationToken::new(),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
        assert!(outcome.timed_out || outcome.bid.is_some());
    }

    #[test]
    fn test_reduce_keeps_first_reason_and_earlier_tie() {
        let candidate = |price: f64| Candidate {
            bids: Vec::new(),
            price,
            deal_count: 0,
        };
        let results = vec![
            SequenceResult {
                durations: vec![30],
                best: Some(candidate(5.0)),
                filtered: vec![("x".to_string(), FilterReasonCode::DomainExclusion)],
                evaluated: 1,
            },
            SequenceResult {
                durations: vec![15, 15],
                best: Some(candidate(5.0)),
                filtered: vec![("x".to_string(), FilterReasonCode::CategoryExclusion)],
                evaluated: 1,
            },
        ];
        let (best, codes) = reduce(&results);
        assert!(std::ptr::eq(best.unwrap(), results[0].best.as_ref().unwrap()));
        assert_eq!(codes["x"], FilterReasonCode::DomainExclusion);
    }
}
