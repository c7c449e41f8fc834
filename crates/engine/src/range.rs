//! Slot ranges straight from the publisher's list of video lengths.

use adpod_core::types::{DurationSlot, PodShapeConfig, VideoLengthMatching};

/// Turns requested video lengths into slots without any search.
#[derive(Debug, Clone)]
pub struct DurationRangeGenerator {
    video_lengths: Vec<i64>,
    matching: VideoLengthMatching,
}

impl DurationRangeGenerator {
    pub fn new(video_lengths: Vec<i64>, matching: VideoLengthMatching) -> Self {
        Self {
            video_lengths,
            matching,
        }
    }

    /// Lengths outside the shape's slot bounds are dropped. Survivors are
    /// repeated in order until there are at least `max_ads` slots, or as many
    /// of the shortest survivor as the pod holds if that is fewer.
    pub fn plan(&self, shape: &PodShapeConfig) -> Vec<DurationSlot> {
        let survivors: Vec<i64> = self
            .video_lengths
            .iter()
            .copied()
            .filter(|d| (shape.slot_min_duration..=shape.slot_max_duration).contains(d))
            .collect();

        let floor = match survivors.iter().min() {
            Some(min) => *min,
            None => return Vec::new(),
        };

        let mut slots: Vec<DurationSlot> = survivors
            .iter()
            .map(|&d| match self.matching {
                VideoLengthMatching::Exact => DurationSlot::new(d, d),
                VideoLengthMatching::Roundup => DurationSlot::new(floor, d),
            })
            .collect();

        let distinct = slots.len();
        let fitting = shape.pod_max_duration / floor.max(1);
        let target = usize::try_from(shape.max_ads.min(fitting)).unwrap_or(0);
        let mut i = 0;
        while slots.len() < target {
            slots.push(slots[i % distinct]);
            i += 1;
        }

        slots
    }
}
