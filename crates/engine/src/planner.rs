//! Picks a slot planning strategy for a pod and fans the plan out into
//! per-slot impressions.

use crate::maximize::PodDurationPlanner;
use crate::minmax::MinMaxPlanner;
use crate::pod_metrics::PodMetrics;
use crate::range::DurationRangeGenerator;
use adpod_core::adpod::VideoAdPod;
use adpod_core::openrtb::Impression;
use adpod_core::types::{
    encode_impression_id, DurationSlot, ImpAdPodConfig, PodShapeConfig, VideoLengthMatching,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerKind {
    MaximizeForDuration,
    MinMax,
    ByDurationRanges,
}

impl PlannerKind {
    /// Label used when reporting impression generation timings.
    pub fn monitor_key(self) -> &'static str {
        match self {
            PlannerKind::MaximizeForDuration => "a1_max",
            PlannerKind::MinMax => "a2_min_max",
            PlannerKind::ByDurationRanges => "a3_duration_ranges",
        }
    }
}

/// A configured slot planner.
#[derive(Debug, Clone)]
pub enum Planner {
    MaximizeForDuration(PodDurationPlanner),
    MinMax(MinMaxPlanner),
    ByDurationRanges(DurationRangeGenerator),
}

impl Planner {
    /// Build a specific strategy. `ByDurationRanges` reads the video lengths
    /// and matching policy from `pod`, defaulting to exact matching.
    pub fn new(kind: PlannerKind, pod: &VideoAdPod, smoothing_factor: i64) -> Self {
        match kind {
            PlannerKind::MaximizeForDuration => {
                Planner::MaximizeForDuration(PodDurationPlanner::new(smoothing_factor))
            }
            PlannerKind::MinMax => Planner::MinMax(MinMaxPlanner::new(smoothing_factor)),
            PlannerKind::ByDurationRanges => Planner::ByDurationRanges(DurationRangeGenerator::new(
                pod.videolengths.clone(),
                pod.videolengthmatching.unwrap_or(VideoLengthMatching::Exact),
            )),
        }
    }

    /// Explicit video lengths with a matching policy go straight to slot
    /// ranges. Everything else is planned with min-max.
    pub fn select(pod: &VideoAdPod, smoothing_factor: i64) -> Self {
        match pod.videolengthmatching {
            Some(matching) if !pod.videolengths.is_empty() => Planner::ByDurationRanges(
                DurationRangeGenerator::new(pod.videolengths.clone(), matching),
            ),
            _ => Planner::MinMax(MinMaxPlanner::new(smoothing_factor)),
        }
    }

    pub fn kind(&self) -> PlannerKind {
        match self {
            Planner::MaximizeForDuration(_) => PlannerKind::MaximizeForDuration,
            Planner::MinMax(_) => PlannerKind::MinMax,
            Planner::ByDurationRanges(_) => PlannerKind::ByDurationRanges,
        }
    }

    pub fn plan(&self, shape: &PodShapeConfig) -> Vec<DurationSlot> {
        match self {
            Planner::MaximizeForDuration(p) => p.plan(shape),
            Planner::MinMax(p) => p.plan(shape),
            Planner::ByDurationRanges(p) => p.plan(shape),
        }
    }

    /// Plan the pod and number its slots as impressions of `imp_id`.
    pub fn impression_configs(
        &self,
        imp_id: &str,
        shape: &PodShapeConfig,
        metrics: &dyn PodMetrics,
    ) -> Vec<ImpAdPodConfig> {
        let start = Instant::now();
        let slots = self.plan(shape);
        metrics.record_impression_generation(self.kind().monitor_key(), slots.len(), start.elapsed());

        if slots.is_empty() {
            info!(imp_id, algorithm = self.kind().monitor_key(), "no slots planned for pod");
        } else {
            debug!(imp_id, slots = slots.len(), "pod slots planned");
        }

        impression_configs(imp_id, &slots)
    }
}

pub fn impression_configs(imp_id: &str, slots: &[DurationSlot]) -> Vec<ImpAdPodConfig> {
    slots
        .iter()
        .enumerate()
        .map(|(i, slot)| ImpAdPodConfig {
            imp_id: encode_impression_id(imp_id, i + 1),
            min_duration: slot.min_duration,
            max_duration: slot.max_duration,
            sequence_number: i + 1,
        })
        .collect()
}

/// Copy of `imp` restricted to one planned slot.
pub fn fan_out_impression(imp: &Impression, config: &ImpAdPodConfig) -> Impression {
    let mut video = imp.video.clone().unwrap_or_default();
    video.minduration = config.min_duration;
    video.maxduration = config.max_duration;
    video.sequence = Some(config.sequence_number);
    video.maxextended = 0;

    Impression {
        id: config.imp_id.clone(),
        video: Some(video),
        ..imp.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod_metrics::{MemoryPodMetrics, PodTiming};
    use adpod_core::openrtb::Video;

    fn shape() -> PodShapeConfig {
        PodShapeConfig {
            min_ads: 2,
            max_ads: 8,
            slot_min_duration: 11,
            slot_max_duration: 15,
            pod_min_duration: 1,
            pod_max_duration: 90,
            advertiser_exclusion_percent: 100,
            category_exclusion_percent: 100,
        }
    }

    #[test]
    fn test_select_uses_ranges_only_with_policy() {
        let mut pod = VideoAdPod {
            videolengths: vec![15, 30],
            ..Default::default()
        };
        assert_eq!(Planner::select(&pod, 5).kind(), PlannerKind::MinMax);

        pod.videolengthmatching = Some(VideoLengthMatching::Roundup);
        assert_eq!(Planner::select(&pod, 5).kind(), PlannerKind::ByDurationRanges);

        pod.videolengths.clear();
        assert_eq!(Planner::select(&pod, 5).kind(), PlannerKind::MinMax);
    }

    #[test]
    fn test_explicit_kind() {
        let planner = Planner::new(PlannerKind::MaximizeForDuration, &VideoAdPod::default(), 5);
        assert_eq!(planner.plan(&shape()), vec![DurationSlot::new(15, 15); 6]);
    }

    #[test]
    fn test_impression_configs_are_numbered_from_one() {
        let metrics = MemoryPodMetrics::new();
        let planner = Planner::new(PlannerKind::MaximizeForDuration, &VideoAdPod::default(), 5);
        let configs = planner.impression_configs("imp-1", &shape(), &metrics);

        assert_eq!(configs.len(), 6);
        assert_eq!(configs[0].imp_id, "imp-1_1");
        assert_eq!(configs[5].imp_id, "imp-1_6");
        assert_eq!(configs[5].sequence_number, 6);
        assert_eq!(configs[0].max_duration, 15);

        let records = metrics.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timing, PodTiming::ImpressionGeneration);
        assert_eq!(records[0].algorithm, "a1_max");
        assert_eq!(records[0].count, 6);
    }

    #[test]
    fn test_fan_out_impression() {
        let imp = Impression {
            id: "imp-1".to_string(),
            video: Some(Video {
                minduration: 1,
                maxduration: 90,
                maxextended: 30,
                ..Default::default()
            }),
            bidfloor: 1.5,
            bidfloorcur: "USD".to_string(),
            ext: None,
        };
        let config = ImpAdPodConfig {
            imp_id: "imp-1_2".to_string(),
            min_duration: 11,
            max_duration: 15,
            sequence_number: 2,
        };

        let out = fan_out_impression(&imp, &config);
        let video = out.video.unwrap();
        assert_eq!(out.id, "imp-1_2");
        assert_eq!(out.bidfloor, 1.5);
        assert_eq!((video.minduration, video.maxduration), (11, 15));
        assert_eq!(video.sequence, Some(2));
        assert_eq!(video.maxextended, 0);
    }
}
