//! Slot planning over the corners of the pod-duration and ad-count ranges.
//!
//! A single maximize run only explores one slot count. Running it for the
//! extreme (pod, ads) combinations and merging gives bidders a wider set of
//! slot ranges to bid into.

use crate::maximize::{PodDurationPlanner, SlotPlan};
use adpod_core::types::{DurationSlot, PodShapeConfig};
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct MinMaxPlanner {
    inner: PodDurationPlanner,
}

impl MinMaxPlanner {
    pub fn new(smoothing_factor: i64) -> Self {
        Self {
            inner: PodDurationPlanner::new(smoothing_factor),
        }
    }

    pub fn plan(&self, shape: &PodShapeConfig) -> Vec<DurationSlot> {
        let runs = corner_shapes(shape);
        let plans: Vec<SlotPlan> = std::thread::scope(|scope| {
            let handles: Vec<_> = runs
                .iter()
                .map(|run| scope.spawn(move || self.inner.generate(run)))
                .collect();
            handles
                .into_iter()
                .zip(runs.iter())
                .map(|(handle, run)| {
                    handle.join().unwrap_or_else(|_| {
                        warn!(pod_max = run.pod_max_duration, "planning run panicked");
                        SlotPlan {
                            slots: Vec::new(),
                            free_time: run.pod_max_duration,
                        }
                    })
                })
                .collect()
        });

        let mut tracker = RepeatTracker::default();
        for plan in &plans {
            for slot in &plan.slots {
                tracker.observe(*slot);
            }
            tracker.end_run();
        }
        let mut slots = tracker.into_slots();

        if shape.pod_min_duration != shape.pod_max_duration {
            let min_duration =
                (shape.pod_min_duration as f64 / shape.min_ads as f64).round() as i64;
            for slot in &mut slots {
                slot.min_duration = if min_duration >= shape.slot_min_duration
                    && min_duration <= slot.max_duration
                {
                    min_duration
                } else {
                    shape.slot_min_duration
                };
            }
        }

        debug!(runs = plans.len(), slots = slots.len(), "min-max plan merged");
        slots
    }
}

/// The given shape plus the four (pod duration, ad count) extremes.
fn corner_shapes(shape: &PodShapeConfig) -> [PodShapeConfig; 5] {
    let with = |pod: i64, ads: i64| PodShapeConfig {
        pod_min_duration: pod,
        pod_max_duration: pod,
        min_ads: ads,
        max_ads: ads,
        ..*shape
    };

    [
        *shape,
        with(shape.pod_max_duration, shape.max_ads),
        with(shape.pod_max_duration, shape.min_ads),
        with(shape.pod_min_duration, shape.max_ads),
        with(shape.pod_min_duration, shape.min_ads),
    ]
}

/// Counts each slot per run and keeps, per slot, the largest count any
/// single run produced.
#[derive(Debug, Default)]
struct RepeatTracker {
    best: BTreeMap<DurationSlot, usize>,
    current: BTreeMap<DurationSlot, usize>,
}

impl RepeatTracker {
    fn observe(&mut self, slot: DurationSlot) {
        *self.current.entry(slot).or_insert(0) += 1;
    }

    fn end_run(&mut self) {
        for (slot, count) in std::mem::take(&mut self.current) {
            let best = self.best.entry(slot).or_insert(0);
            if count > *best {
                *best = count;
            }
        }
    }

    fn into_slots(self) -> Vec<DurationSlot> {
        self.best
            .into_iter()
            .flat_map(|(slot, count)| std::iter::repeat(slot).take(count))
            .collect()
    }
}
