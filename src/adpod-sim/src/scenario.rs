//! A single pod opportunity replayed from a JSON file.

use adpod_core::adpod::{ExtRequestAdPod, ExtVideoAdPod, VideoAdPod};
use adpod_core::config::AppConfig;
use adpod_core::openrtb::{Bid, BidResponse, Impression, SeatBid};
use adpod_core::types::{decode_impression_id, BidBuckets, CtvBid, ImpAdPodConfig, PodShapeConfig};
use adpod_core::AdPodError;
use adpod_engine::combination::CombinationStats;
use adpod_engine::planner::fan_out_impression;
use adpod_engine::pod_metrics::{
    FanoutPodMetrics, MemoryPodMetrics, PodMetrics, RecorderPodMetrics,
};
use adpod_engine::{AdPodAssembler, AssemblerConfig, CombinationEnumerator, Planner, PlannerKind};
use anyhow::{anyhow, bail, Context};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default = "default_request_id")]
    pub request_id: String,
    /// Video impression. The pod itself is read from `video.ext.adpod`.
    pub imp: Impression,
    /// Request-level pod the impression inherits unset values from.
    #[serde(default)]
    pub request_adpod: Option<ExtRequestAdPod>,
    #[serde(default)]
    pub bids: Vec<Bid>,
}

fn default_request_id() -> String {
    "sim-request".to_string()
}

/// Seat the assembled pod is returned under.
pub const POD_SEAT: &str = "adpod";

#[derive(Clone, Default)]
pub struct RunOptions {
    /// Force a planner instead of selecting one from the pod.
    pub planner: Option<PlannerKind>,
    /// When set, timings also go through the `metrics` facade and the
    /// rendered exposition is attached to the report.
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct MetricEntry {
    pub timing: String,
    pub algorithm: String,
    pub count: usize,
    pub elapsed_us: u128,
}

#[derive(Debug, Serialize)]
pub struct SimReport {
    /// Node that produced the report.
    pub node_id: String,
    pub request_id: String,
    pub imp_id: String,
    pub planner: PlannerKind,
    pub shape: PodShapeConfig,
    pub slots: Vec<ImpAdPodConfig>,
    pub impressions: Vec<Impression>,
    /// The pod as a single bid in seat `adpod`. No seat bids on no fill.
    pub response: BidResponse,
    /// Every bucketed bid with its `ext.adpod.aprc` reason code.
    pub bids: Vec<Bid>,
    pub sequences_searched: usize,
    pub timed_out: bool,
    pub combinations: CombinationStats,
    pub search_space: u64,
    pub metrics: Vec<MetricEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<String>,
}

impl Scenario {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("invalid scenario json")
    }

    /// Resolve the impression's pod: request-level values fill the gaps,
    /// then configured defaults, then slot bounds from the pod window.
    pub fn resolve_pod(&self, config: &AppConfig) -> anyhow::Result<VideoAdPod> {
        let video = self
            .imp
            .video
            .as_ref()
            .ok_or_else(|| anyhow!("impression {} has no video object", self.imp.id))?;

        let mut ext: ExtVideoAdPod = match &video.ext {
            Some(raw) => serde_json::from_value(raw.clone()).map_err(AdPodError::from)?,
            None => ExtVideoAdPod::default(),
        };

        let mut errors = Vec::new();
        if let Some(request) = &self.request_adpod {
            let mut request = request.clone();
            errors.extend(request.validate());
            request.set_default_values(&config.defaults);
            if let Some(pod) = ext.adpod.as_mut() {
                pod.merge(&request.pod);
            }
        }

        errors.extend(ext.validate());
        ext.set_default_values(&config.defaults);
        let mut pod = ext.adpod.unwrap_or_default();
        pod.set_default_ad_durations(video.minduration, video.maxduration);
        errors.extend(pod.validate_pod_durations(
            video.minduration,
            video.maxduration,
            video.maxextended,
        ));

        if !errors.is_empty() {
            for error in &errors {
                warn!(imp_id = %self.imp.id, error = %error, "ad pod rejected");
            }
            let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
            bail!("invalid ad pod: {}", messages.join("; "));
        }
        Ok(pod)
    }

    pub async fn run(
        &self,
        config: &AppConfig,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> anyhow::Result<SimReport> {
        let pod = self.resolve_pod(config)?;
        let video = self.imp.video.clone().unwrap_or_default();
        let shape = pod.to_shape(video.minduration, video.maxduration)?;
        shape.validate()?;

        let planner = match options.planner {
            Some(kind) => Planner::new(kind, &pod, config.engine.smoothing_factor),
            None => Planner::select(&pod, config.engine.smoothing_factor),
        };

        let memory = Arc::new(MemoryPodMetrics::new());
        let mut sinks: Vec<Arc<dyn PodMetrics>> = vec![memory.clone()];
        if options.prometheus.is_some() {
            sinks.push(Arc::new(RecorderPodMetrics));
        }
        let metrics = Arc::new(FanoutPodMetrics::new(sinks));
        let slots = planner.impression_configs(&self.imp.id, &shape, metrics.as_ref());
        let impressions: Vec<Impression> = slots
            .iter()
            .map(|slot| fan_out_impression(&self.imp, slot))
            .collect();

        let buckets = BidBuckets::from_bids(
            self.bids
                .iter()
                .cloned()
                .map(|bid| {
                    let fallback = slot_max_duration(&slots, &bid.impid, &shape);
                    CtvBid::from_openrtb(bid, fallback)
                }),
        );
        info!(
            request_id = %self.request_id,
            imp_id = %self.imp.id,
            slots = slots.len(),
            bids = buckets.total_bids(),
            "scenario prepared"
        );

        let assembler = AdPodAssembler::new(
            AssemblerConfig::from(&config.engine),
            metrics.clone() as Arc<dyn PodMetrics>,
        );
        let search_space = CombinationEnumerator::new(
            shape.pod_min_duration,
            shape.pod_max_duration,
            &shape,
            &buckets.counts(),
        )
        .search_space();

        let shared = Arc::new(buckets.clone());
        let outcome = assembler
            .assemble(&self.request_id, &self.imp.id, &shape, shared, cancel)
            .await;

        let mut buckets = buckets;
        outcome.annotate(buckets.iter_mut());

        let mut response = BidResponse::no_bid(self.request_id.clone());
        if let Some(pod) = &outcome.bid {
            response.seatbid.push(SeatBid {
                bid: vec![pod.to_openrtb_bid(&self.imp.id)],
                seat: Some(POD_SEAT.to_string()),
                group: 0,
            });
        }

        Ok(SimReport {
            node_id: config.node_id.clone(),
            request_id: self.request_id.clone(),
            imp_id: self.imp.id.clone(),
            planner: planner.kind(),
            shape,
            slots,
            impressions,
            response,
            bids: buckets.iter().map(CtvBid::to_response_bid).collect(),
            sequences_searched: outcome.sequences_searched,
            timed_out: outcome.timed_out,
            combinations: outcome.stats,
            search_space,
            metrics: memory
                .records()
                .into_iter()
                .map(|r| MetricEntry {
                    timing: format!("{:?}", r.timing),
                    algorithm: r.algorithm,
                    count: r.count,
                    elapsed_us: r.elapsed.as_micros(),
                })
                .collect(),
            prometheus: options.prometheus.as_ref().map(PrometheusHandle::render),
        })
    }
}

/// Duration assumed for a bid that does not report one: the max of the
/// slot it was bid into, else the pod's slot maximum.
fn slot_max_duration(slots: &[ImpAdPodConfig], imp_id: &str, shape: &PodShapeConfig) -> i64 {
    let (_, sequence) = decode_impression_id(imp_id);
    slots
        .iter()
        .find(|slot| slot.sequence_number == sequence)
        .map(|slot| slot.max_duration)
        .unwrap_or(shape.slot_max_duration)
}
