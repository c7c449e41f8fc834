//! Lazy enumeration of slot-duration sequences for pod assembly.

use adpod_core::types::PodShapeConfig;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CombinationStats {
    pub valid: u64,
    /// Branches cut for using a duration more often than it has bids.
    pub repeated: u64,
    /// Branches cut because no completion can land inside the pod bounds.
    pub out_of_range: u64,
}

impl CombinationStats {
    /// Placements tried so far. Grows monotonically.
    pub fn visited(&self) -> u64 {
        self.valid + self.repeated + self.out_of_range
    }
}

enum Placement {
    Fits,
    Repeated,
    TooLong,
    TooShort,
}

/// Yields duration sequences (multisets) whose length lies within the
/// ad-count bounds and whose sum lies within the pod duration bounds.
///
/// Sequences come richest first: durations are tried in descending order,
/// longer sequences before shorter ones. A partial sequence is abandoned as
/// soon as no completion of it can be feasible, so the work done is bounded
/// by the feasible sequences rather than by the raw search space.
/// Not safe to share without a lock.
#[derive(Debug)]
pub struct CombinationEnumerator {
    /// Positive durations, longest first.
    durations: Vec<i64>,
    available: Vec<usize>,
    pod_min_duration: i64,
    pod_max_duration: i64,
    min_len: usize,
    max_len: usize,
    current_len: usize,
    /// `cheapest[k]` is the shortest total any k available ads can make.
    cheapest: Vec<i64>,
    /// Indices into `durations` placed so far, non-decreasing.
    path: Vec<usize>,
    path_sum: i64,
    /// Next index to try at position `path.len()`.
    cursor: usize,
    exhausted: bool,
    stats: CombinationStats,
}

impl CombinationEnumerator {
    /// `bid_counts` maps each duration to the number of bids for it.
    pub fn new(
        pod_min_duration: i64,
        pod_max_duration: i64,
        shape: &PodShapeConfig,
        bid_counts: &BTreeMap<i64, usize>,
    ) -> Self {
        let mut pairs: Vec<(i64, usize)> = bid_counts
            .iter()
            .filter(|(duration, count)| **duration > 0 && **count > 0)
            .map(|(d, c)| (*d, *c))
            .collect();
        pairs.sort_by(|a, b| b.0.cmp(&a.0));

        // A sequence can never hold more ads than there are bids, nor more
        // than the pod fits at its shortest duration.
        let total_bids: usize = pairs.iter().map(|p| p.1).sum();
        let fits = match pairs.last() {
            Some((shortest, _)) => usize::try_from(pod_max_duration / shortest).unwrap_or(0),
            None => 0,
        };
        let min_len = usize::try_from(shape.min_ads).unwrap_or(0).max(1);
        let max_len = usize::try_from(shape.max_ads)
            .unwrap_or(0)
            .min(total_bids)
            .min(fits);
        let exhausted = pairs.is_empty() || max_len < min_len;

        let mut cheapest = Vec::with_capacity(max_len + 1);
        cheapest.push(0i64);
        for &(duration, count) in pairs.iter().rev() {
            for _ in 0..count {
                if cheapest.len() > max_len {
                    break;
                }
                let total = cheapest[cheapest.len() - 1].saturating_add(duration);
                cheapest.push(total);
            }
        }

        Self {
            durations: pairs.iter().map(|p| p.0).collect(),
            available: pairs.iter().map(|p| p.1).collect(),
            pod_min_duration,
            pod_max_duration,
            min_len,
            max_len,
            current_len: max_len,
            cheapest,
            path: Vec::with_capacity(max_len),
            path_sum: 0,
            cursor: 0,
            exhausted,
            stats: CombinationStats::default(),
        }
    }

    /// Next feasible sequence, or an empty one once exhausted.
    pub fn next_sequence(&mut self) -> Vec<i64> {
        self.next_sequence_until(|| false)
    }

    /// Like [`next_sequence`](Self::next_sequence), but gives up and returns
    /// an empty sequence as soon as `should_stop` reports true. Stopping
    /// leaves the position intact, so a later call resumes from it.
    pub fn next_sequence_until(&mut self, should_stop: impl Fn() -> bool) -> Vec<i64> {
        while !self.exhausted {
            if should_stop() {
                return Vec::new();
            }

            let pos = self.path.len();
            let floor = self.path.last().copied().unwrap_or(0);
            let candidate = self.cursor.max(floor);

            if candidate >= self.durations.len() {
                self.backtrack();
                continue;
            }

            match self.place(candidate) {
                Placement::Fits => {
                    self.path.push(candidate);
                    self.path_sum += self.durations[candidate];
                    self.cursor = candidate;
                    if pos + 1 == self.current_len {
                        self.stats.valid += 1;
                        let sequence: Vec<i64> =
                            self.path.iter().map(|&i| self.durations[i]).collect();
                        self.pop();
                        return sequence;
                    }
                }
                Placement::Repeated => {
                    self.stats.repeated += 1;
                    self.cursor = candidate + 1;
                }
                Placement::TooLong => {
                    // A shorter duration here may still fit.
                    self.stats.out_of_range += 1;
                    self.cursor = candidate + 1;
                }
                Placement::TooShort => {
                    // Every later duration is shorter still.
                    self.stats.out_of_range += 1;
                    self.cursor = self.durations.len();
                }
            }
        }
        Vec::new()
    }

    pub fn stats(&self) -> CombinationStats {
        self.stats
    }

    /// Sequences an unpruned walk would visit, that is the sum over lengths
    /// r of C(n + r - 1, r). Saturates at `u64::MAX`.
    pub fn search_space(&self) -> u64 {
        let n = self.durations.len() as u64;
        if n == 0 {
            return 0;
        }
        (self.min_len..=self.max_len)
            .map(|r| multiset_count(n, r as u64))
            .fold(0u64, u64::saturating_add)
    }

    /// Whether `index` can go at the next position, judged by the bids left
    /// for it and by the shortest and longest totals still reachable.
    fn place(&self, index: usize) -> Placement {
        // Equal indices are contiguous in a non-decreasing path.
        let run = self.path.iter().rev().take_while(|&&i| i == index).count() + 1;
        if run > self.available[index] {
            return Placement::Repeated;
        }

        let duration = self.durations[index];
        let remaining = self.current_len - self.path.len() - 1;
        let with = self.path_sum.saturating_add(duration);
        if with.saturating_add(self.cheapest[remaining]) > self.pod_max_duration {
            return Placement::TooLong;
        }
        if with.saturating_add((remaining as i64).saturating_mul(duration)) < self.pod_min_duration {
            return Placement::TooShort;
        }
        Placement::Fits
    }

    fn pop(&mut self) {
        if let Some(last) = self.path.pop() {
            self.path_sum -= self.durations[last];
            self.cursor = last + 1;
        }
    }

    /// Leave the current position; at the root, drop to a shorter length.
    fn backtrack(&mut self) {
        if !self.path.is_empty() {
            self.pop();
            return;
        }
        if self.current_len <= self.min_len {
            self.exhausted = true;
            return;
        }
        self.current_len -= 1;
        self.cursor = 0;
    }
}

fn multiset_count(n: u64, r: u64) -> u64 {
    // C(n + r - 1, r) built incrementally so each step divides exactly.
    let mut acc: u128 = 1;
    for k in 1..=r as u128 {
        acc = acc * (n as u128 + k - 1) / k;
        if acc > u64::MAX as u128 {
            return u64::MAX;
        }
    }
    acc as u64
}
