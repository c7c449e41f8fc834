//! CTV ad-pod engine: slot planning for a pod and best-bid assembly across
//! duration buckets under competitive exclusion.

pub mod assembler;
pub mod combination;
pub mod maximize;
pub mod minmax;
pub mod planner;
pub mod pod_metrics;
pub mod range;
pub mod search;

pub use assembler::{AdPodAssembler, AssemblerConfig, PodOutcome};
pub use combination::CombinationEnumerator;
pub use maximize::PodDurationPlanner;
pub use minmax::MinMaxPlanner;
pub use planner::{Planner, PlannerKind};
pub use pod_metrics::{FanoutPodMetrics, NoopPodMetrics, PodMetrics, RecorderPodMetrics};
pub use range::DurationRangeGenerator;
