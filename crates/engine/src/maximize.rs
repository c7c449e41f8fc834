//! Slot planning that fills as much of the pod as the slot bounds allow.
//!
//! Slot durations are nudged towards multiples of a smoothing factor since
//! creatives are almost always cut to such lengths. Snapping only applies
//! when the snapped slot bounds still form a valid range.

use adpod_core::types::{DurationSlot, PodShapeConfig};
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_SMOOTHING_FACTOR: i64 = 5;

/// Output of a single planning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotPlan {
    pub slots: Vec<DurationSlot>,
    /// Pod seconds no slot could absorb. Equals the pod maximum when the
    /// plan failed validation.
    pub free_time: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct PodDurationPlanner {
    smoothing_factor: i64,
}

impl Default for PodDurationPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING_FACTOR)
    }
}

impl PodDurationPlanner {
    /// Non-positive factors are treated as 1, which disables snapping.
    pub fn new(smoothing_factor: i64) -> Self {
        Self {
            smoothing_factor: smoothing_factor.max(1),
        }
    }

    pub fn smoothing_factor(&self) -> i64 {
        self.smoothing_factor
    }

    pub fn plan(&self, shape: &PodShapeConfig) -> Vec<DurationSlot> {
        self.generate(shape).slots
    }

    pub fn generate(&self, shape: &PodShapeConfig) -> SlotPlan {
        let mut fill = SlotFill::new(shape, self.smoothing_factor);
        if fill.overfull {
            debug!(
                min_ads = shape.min_ads,
                pod_max = shape.pod_max_duration,
                slot_min = shape.slot_min_duration,
                "pod cannot hold the minimum ad count"
            );
            return SlotPlan {
                slots: Vec::new(),
                free_time: shape.pod_max_duration,
            };
        }
        let elapsed = fill.run();
        fill.validate();

        let requested = fill.requested;
        if requested.pod_max_duration - elapsed > 0 && !fill.slots.is_empty() {
            fill.free_time = requested.pod_max_duration - elapsed;
        }

        debug!(
            slots = fill.slots.len(),
            allocated = fill.total_slot_time,
            pod_max = requested.pod_max_duration,
            free_time = fill.free_time,
            "slot plan computed"
        );

        SlotPlan {
            slots: fill
                .slots
                .iter()
                .map(|s| DurationSlot::new(s.min, s.max))
                .collect(),
            free_time: fill.free_time,
        }
    }
}

fn closest_factor(num: i64, multiple: i64) -> i64 {
    (num as f64 / multiple as f64).round() as i64 * multiple
}

/// Multiple of `multiple` nearest to `num`, but never below it.
fn closest_factor_for_min(num: i64, multiple: i64) -> i64 {
    let closest = closest_factor(num, multiple);
    if closest == 0 {
        multiple
    } else if closest < num {
        closest + multiple
    } else {
        closest
    }
}

/// Largest multiple of `multiple` not above `num`, or `num` itself when
/// that multiple would be zero.
fn closest_factor_for_max(num: i64, multiple: i64) -> i64 {
    let floor = num.div_euclid(multiple) * multiple;
    if floor == 0 {
        num
    } else {
        floor
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    min: i64,
    max: i64,
}

struct SlotFill {
    requested: PodShapeConfig,
    smoothing_factor: i64,
    slot_min: i64,
    slot_max: i64,
    /// Whether `slot_min`/`slot_max` are the snapped values.
    snapped: bool,
    /// More ads are required than the pod can hold at the slot minimum.
    overfull: bool,
    slots: Vec<Slot>,
    empty_slots: i64,
    total_slot_time: i64,
    free_time: i64,
}

impl SlotFill {
    fn new(shape: &PodShapeConfig, smoothing_factor: i64) -> Self {
        let snapped_min = closest_factor_for_min(shape.slot_min_duration, smoothing_factor);
        let snapped_max = closest_factor_for_max(shape.slot_max_duration, smoothing_factor);
        let (slot_min, slot_max, snapped) = if snapped_min > snapped_max {
            (shape.slot_min_duration, shape.slot_max_duration, false)
        } else {
            (snapped_min, snapped_max, true)
        };

        let mut fill = Self {
            requested: *shape,
            smoothing_factor,
            slot_min,
            slot_max,
            snapped,
            overfull: false,
            slots: Vec::new(),
            empty_slots: 0,
            total_slot_time: 0,
            free_time: 0,
        };

        let total_ads = fill.total_ads();
        if total_ads > fill.max_fitting_ads() {
            fill.overfull = true;
            return fill;
        }
        fill.slots = vec![Slot::default(); usize::try_from(total_ads).unwrap_or(0)];
        fill.empty_slots = fill.slots.len() as i64;
        fill
    }

    fn total_ads(&self) -> i64 {
        if self.slot_max <= 0 || self.slot_min <= 0 {
            return 0;
        }
        let pod_max = self.requested.pod_max_duration;
        let mut total = (pod_max / self.slot_max).max(pod_max / self.slot_min);
        if total < self.requested.min_ads {
            total = self.requested.min_ads;
        }
        if total > self.requested.max_ads {
            total = self.requested.max_ads;
        }
        total
    }

    /// Slots the pod can hold when each takes at least the requested
    /// minimum and never less than a second.
    fn max_fitting_ads(&self) -> i64 {
        self.requested.pod_max_duration / self.requested.slot_min_duration.max(1)
    }

    fn time_for_each_slot(&self) -> i64 {
        let total_ads = self.slots.len() as i64;
        if total_ads <= 0 {
            return 0;
        }
        let pod_max = self.requested.pod_max_duration;

        let mut time = pod_max / total_ads;
        if time < self.slot_min {
            time = self.slot_min;
        }
        if time > self.slot_max {
            time = self.slot_max;
        }

        if self.requested.slot_min_duration == self.requested.slot_max_duration {
            return time;
        }
        if time.saturating_mul(total_ads) > pod_max {
            return pod_max / total_ads;
        }
        if self.snapped && time % self.smoothing_factor != 0 {
            time = closest_factor(time, self.smoothing_factor);
        }
        time
    }

    /// Smallest useful increment for the next pass.
    fn least_value(&self, remaining: i64, slot_headroom: i64) -> i64 {
        let mut time = remaining;
        if self.smoothing_factor < time {
            time = self.smoothing_factor;
        }
        if slot_headroom > 0 && slot_headroom < time {
            time = slot_headroom;
        }
        time
    }

    /// Distributes time over the slots pass by pass. Returns the total
    /// time handed out.
    fn run(&mut self) -> i64 {
        let pod_max = self.requested.pod_max_duration;
        let fixed_ad_count = self.requested.min_ads == self.requested.max_ads;

        let mut increment = self.time_for_each_slot();
        let mut elapsed = 0;
        let mut empty_first = true;
        let mut filled_by_last_pass = 0;
        let mut stalled = 0;

        while elapsed < pod_max {
            let (added, all_full) = self.add_time(increment, empty_first);
            elapsed += added;
            increment = self.least_value(
                pod_max - elapsed,
                self.requested.slot_max_duration - increment,
            );
            if all_full {
                break;
            }

            // No slot can take any more time at any increment we would try.
            if added == 0 {
                stalled += 1;
                if stalled >= 3 {
                    debug!(elapsed, pod_max, "slot fill stalled");
                    break;
                }
            } else {
                stalled = 0;
            }

            empty_first = false;
            filled_by_last_pass = self.empty_slots - filled_by_last_pass;
            if fixed_ad_count && self.empty_slots > 0 && filled_by_last_pass > 0 {
                empty_first = true;
            }
        }

        elapsed
    }

    /// One pass over every slot. Returns the time added and whether every
    /// slot is saturated.
    fn add_time(&mut self, time: i64, empty_first: bool) -> (i64, bool) {
        let requested = self.requested;
        let mut added = 0;
        let mut full = 0;

        for i in 0..self.slots.len() {
            let slot = self.slots[i];
            let grown = slot.max + time;
            let can_adjust =
                grown <= requested.slot_max_duration && grown >= requested.slot_min_duration;
            let fits_pod = self.total_slot_time + time <= requested.pod_max_duration;
            let allowed = !empty_first || slot.max == 0;

            if slot.max <= self.slot_max && can_adjust && fits_pod && allowed {
                let mut updated = slot;
                updated.min += time;
                if time < self.smoothing_factor {
                    updated.min = requested.slot_min_duration;
                }
                if slot.max == 0 {
                    self.empty_slots -= 1;
                }
                updated.max = grown;
                self.slots[i] = updated;
                self.total_slot_time += time;
                added += time;
            }

            if self.slots[i].max == requested.slot_max_duration || !can_adjust {
                full += 1;
            }
        }

        (added, full == self.slots.len())
    }

    /// Empties the plan when it breaks any requested bound.
    fn validate(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        let requested = self.requested;

        let out_of_bounds = self.slots.iter().any(|s| {
            s.min != 0
                && s.max != 0
                && (s.max < requested.slot_min_duration || s.max > requested.slot_max_duration)
        });
        self.slots.retain(|s| s.min != 0 && s.max != 0);

        let count = self.slots.len() as i64;
        let failed = out_of_bounds
            || count < requested.min_ads
            || count > requested.max_ads
            || (requested.pod_min_duration == requested.pod_max_duration
                && self.total_slot_time != requested.pod_max_duration)
            || self.total_slot_time < requested.pod_min_duration
            || self.total_slot_time > requested.pod_max_duration;

        if failed {
            debug!(
                slots = count,
                allocated = self.total_slot_time,
                "slot plan rejected"
            );
            self.slots.clear();
            self.free_time = requested.pod_max_duration;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(pod: (i64, i64), slot: (i64, i64), ads: (i64, i64)) -> PodShapeConfig {
        PodShapeConfig {
            min_ads: ads.0,
            max_ads: ads.1,
            slot_min_duration: slot.0,
            slot_max_duration: slot.1,
            pod_min_duration: pod.0,
            pod_max_duration: pod.1,
            advertiser_exclusion_percent: 100,
            category_exclusion_percent: 100,
        }
    }

    fn slots(pairs: &[(i64, i64, usize)]) -> Vec<DurationSlot> {
        pairs
            .iter()
            .flat_map(|&(min, max, n)| std::iter::repeat(DurationSlot::new(min, max)).take(n))
            .collect()
    }

    fn generate(pod: (i64, i64), slot: (i64, i64), ads: (i64, i64)) -> SlotPlan {
        PodDurationPlanner::default().generate(&shape(pod, slot, ads))
    }

    #[test]
    fn test_closest_factor_for_min() {
        assert_eq!(closest_factor_for_min(11, 5), 15);
        assert_eq!(closest_factor_for_min(5, 5), 5);
        assert_eq!(closest_factor_for_min(1, 5), 5);
        assert_eq!(closest_factor_for_min(0, 5), 5);
        assert_eq!(closest_factor_for_min(14, 5), 15);
    }

    #[test]
    fn test_closest_factor_for_max() {
        assert_eq!(closest_factor_for_max(15, 5), 15);
        assert_eq!(closest_factor_for_max(12, 5), 10);
        assert_eq!(closest_factor_for_max(4, 5), 4);
        assert_eq!(closest_factor_for_max(0, 5), 0);
    }

    #[test]
    fn test_internal_slot_bounds() {
        let cases = [
            ((7, 9), (7, 9), false),
            ((4, 4), (4, 4), false),
            ((34, 34), (34, 34), false),
            ((12, 12), (12, 12), false),
            ((11, 13), (11, 13), false),
            ((0, 0), (0, 0), false),
            ((-3, -4), (-3, -4), false),
            ((1, 1), (1, 1), false),
            ((126, 126), (126, 126), false),
            ((30, 60), (30, 60), true),
            ((20, 45), (20, 45), true),
            ((12, 18), (15, 15), true),
            ((6, 6), (6, 6), false),
        ];
        for (requested, internal, snapped) in cases {
            let fill = SlotFill::new(&shape((0, 90), requested, (1, 1)), 5);
            assert_eq!((fill.slot_min, fill.slot_max), internal, "slot {:?}", requested);
            assert_eq!(fill.snapped, snapped, "slot {:?}", requested);
        }
    }

    #[test]
    fn test_fills_pod_with_max_slots() {
        let plan = generate((1, 90), (11, 15), (2, 8));
        assert_eq!(plan.slots, slots(&[(15, 15, 6)]));
        assert_eq!(plan.free_time, 0);
    }

    #[test]
    fn test_second_pass_tops_up_first_slot() {
        let plan = generate((1, 15), (1, 15), (1, 2));
        assert_eq!(plan.slots, slots(&[(10, 10, 1), (5, 5, 1)]));
        assert_eq!(plan.free_time, 0);
    }

    #[test]
    fn test_small_increment_resets_slot_minimum() {
        let plan = generate((126, 126), (1, 12), (12, 12));
        assert_eq!(plan.slots, slots(&[(1, 12, 3), (10, 10, 9)]));
        assert_eq!(plan.free_time, 0);

        let plan = generate((90, 90), (11, 15), (8, 8));
        assert_eq!(plan.slots, slots(&[(11, 13, 1), (11, 11, 7)]));
    }

    #[test]
    fn test_fixed_slot_durations() {
        assert_eq!(generate((1, 1), (1, 1), (1, 1)).slots, slots(&[(1, 1, 1)]));
        assert_eq!(generate((12, 12), (6, 6), (2, 2)).slots, slots(&[(6, 6, 2)]));
        assert_eq!(generate((6, 6), (6, 6), (1, 1)).slots, slots(&[(6, 6, 1)]));
        assert_eq!(generate((90, 90), (45, 45), (2, 2)).slots, slots(&[(45, 45, 2)]));
    }

    #[test]
    fn test_reports_free_time() {
        let plan = generate((30, 60), (5, 9), (2, 6));
        assert_eq!(plan.slots, slots(&[(5, 9, 6)]));
        assert_eq!(plan.free_time, 6);
    }

    #[test]
    fn test_degenerate_inputs_yield_empty_plan() {
        let plan = generate((0, 0), (0, 0), (1, 1));
        assert!(plan.slots.is_empty());
        assert_eq!(plan.free_time, 0);

        let plan = generate((5, -5), (-3, -4), (1, 1));
        assert!(plan.slots.is_empty());
        assert_eq!(plan.free_time, 0);

        assert!(generate((1, 1), (11, 15), (8, 8)).slots.is_empty());
    }

    #[test]
    fn test_unfillable_fixed_pod_frees_whole_pod() {
        let plan = generate((90, 90), (11, 15), (2, 2));
        assert!(plan.slots.is_empty());
        assert_eq!(plan.free_time, 90);
    }

    #[test]
    fn test_plan_respects_bounds() {
        let shapes = [
            ((1, 90), (11, 15), (2, 8)),
            ((30, 60), (5, 9), (2, 6)),
            ((60, 120), (10, 30), (1, 10)),
            ((15, 45), (5, 20), (3, 3)),
        ];
        for (pod, slot, ads) in shapes {
            let plan = generate(pod, slot, ads);
            if plan.slots.is_empty() {
                continue;
            }
            let n = plan.slots.len() as i64;
            let total: i64 = plan.slots.iter().map(|s| s.max_duration).sum();
            assert!(n >= ads.0 && n <= ads.1, "{:?}", plan);
            assert!(total >= pod.0 && total <= pod.1, "{:?}", plan);
        }
    }

    #[test]
    fn test_ad_count_beyond_pod_capacity() {
        // Two billion 15s ads cannot fit a 60s pod.
        let plan = generate((30, 60), (15, 30), (2_000_000_000, 4_000_000_000));
        assert!(plan.slots.is_empty());
        assert_eq!(plan.free_time, 60);

        // A huge maximum alone is harmless: the pod bounds the count.
        let plan = generate((30, 60), (15, 30), (2, 4_000_000_000));
        assert_eq!(plan.slots.len(), 4);
        assert_eq!(plan.free_time, 0);
    }

    #[test]
    fn test_zero_first_increment() {
        // pod_max / total_ads rounds down to zero on the first pass.
        let plan = generate((0, 3), (-1, 30), (4, 4));
        assert!(plan.slots.is_empty());
    }
}
