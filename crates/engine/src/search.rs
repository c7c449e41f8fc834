//! Best-bid search for one duration sequence.
//!
//! A sequence such as `[30, 30, 15]` is grouped into `(30, 2), (15, 1)`.
//! Each group picks `k` distinct bids from its duration bucket through `k`
//! strictly increasing cursors. Assignments are visited in cursor order,
//! which, given buckets sorted by (deal, price) descending, visits the
//! richest assignments first.

use adpod_core::types::{BidBuckets, CtvBid, FilterReasonCode, PodShapeConfig};
use std::collections::{HashMap, HashSet};

/// A slot within the grouped sequence: group index, then cursor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub group: usize,
    pub slot: usize,
}

/// Cursor positions for every group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexState {
    cursors: Vec<Vec<usize>>,
}

impl IndexState {
    /// Every group starts at the top of its bucket.
    pub fn initial(repeats: &[usize]) -> Self {
        Self {
            cursors: repeats.iter().map(|&k| (0..k).collect()).collect(),
        }
    }

    pub fn cursors(&self) -> &[Vec<usize>] {
        &self.cursors
    }

    pub fn last_position(&self) -> Option<Position> {
        let group = self.cursors.len().checked_sub(1)?;
        let slot = self.cursors[group].len().checked_sub(1)?;
        Some(Position { group, slot })
    }

    /// State after moving the rightmost cursor at or before `at` that still
    /// has room, with every later cursor reset to its lowest value. `None`
    /// when no such cursor exists. `pool_sizes[g]` is the bucket length for
    /// group `g`.
    pub fn advance(&self, pool_sizes: &[usize], at: Position) -> Option<Self> {
        for group in (0..=at.group.min(self.cursors.len().checked_sub(1)?)).rev() {
            let picks = &self.cursors[group];
            if picks.is_empty() {
                continue;
            }
            let start = if group == at.group {
                at.slot.min(picks.len() - 1)
            } else {
                picks.len() - 1
            };
            let len = pool_sizes.get(group).copied().unwrap_or(0);

            for slot in (0..=start).rev() {
                // The cursor must leave room for the cursors after it.
                if picks[slot] + 1 + picks.len() <= len + slot {
                    return Some(self.moved(group, slot));
                }
            }
        }
        None
    }

    fn moved(&self, group: usize, slot: usize) -> Self {
        let mut cursors = self.cursors.clone();
        cursors[group][slot] += 1;
        for j in slot + 1..cursors[group].len() {
            cursors[group][j] = cursors[group][j - 1] + 1;
        }
        for later in cursors.iter_mut().skip(group + 1) {
            for (j, cursor) in later.iter_mut().enumerate() {
                *cursor = j;
            }
        }
        Self { cursors }
    }
}

/// A feasible assignment of bids to every slot of a sequence.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub bids: Vec<CtvBid>,
    pub price: f64,
    pub deal_count: usize,
}

impl Candidate {
    /// More deal bids wins, then higher total price.
    pub fn beats(&self, other: &Candidate) -> bool {
        self.deal_count > other.deal_count
            || (self.deal_count == other.deal_count && self.price > other.price)
    }
}

/// Where and why an assignment broke an exclusion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub position: Position,
    pub reason: FilterReasonCode,
}

fn exceeds(count: usize, total: usize, max_percent: i64) -> bool {
    count > 1 && (count * 100 / total) as i64 > max_percent
}

/// Score one assignment, stopping at the first bid that pushes a category
/// or advertiser domain over its share of the pod. Categories are checked
/// before domains.
pub fn evaluate(
    pools: &[&[CtvBid]],
    state: &IndexState,
    category_exclusion_percent: i64,
    advertiser_exclusion_percent: i64,
) -> Result<Candidate, Rejection> {
    let total: usize = state.cursors.iter().map(Vec::len).sum();
    let mut bids = Vec::with_capacity(total);
    let mut price = 0.0;
    let mut deal_count = 0;
    let mut categories: HashMap<&str, usize> = HashMap::new();
    let mut domains: HashMap<&str, usize> = HashMap::new();

    for (group, picks) in state.cursors.iter().enumerate() {
        for (slot, &cursor) in picks.iter().enumerate() {
            let position = Position { group, slot };
            let bid = &pools[group][cursor];
            bids.push(bid.clone());
            price += bid.price();
            if bid.deal_tier_satisfied {
                deal_count += 1;
            }

            for cat in bid.categories() {
                let count = categories.entry(cat.as_str()).or_insert(0);
                *count += 1;
                if exceeds(*count, total, category_exclusion_percent) {
                    return Err(Rejection {
                        position,
                        reason: FilterReasonCode::CategoryExclusion,
                    });
                }
            }
            for domain in bid.domains() {
                let count = domains.entry(domain.as_str()).or_insert(0);
                *count += 1;
                if exceeds(*count, total, advertiser_exclusion_percent) {
                    return Err(Rejection {
                        position,
                        reason: FilterReasonCode::DomainExclusion,
                    });
                }
            }
        }
    }

    Ok(Candidate {
        bids,
        price,
        deal_count,
    })
}

/// Outcome of searching one duration sequence.
#[derive(Debug, Clone, Default)]
pub struct SequenceResult {
    pub durations: Vec<i64>,
    pub best: Option<Candidate>,
    /// First rejection reason seen per bid id, in the order seen.
    pub filtered: Vec<(String, FilterReasonCode)>,
    pub evaluated: usize,
}

/// Group equal durations, keeping first-appearance order.
fn group_durations(durations: &[i64]) -> Vec<(i64, usize)> {
    let mut groups: Vec<(i64, usize)> = Vec::new();
    for &d in durations {
        match groups.iter_mut().find(|(g, _)| *g == d) {
            Some((_, repeat)) => *repeat += 1,
            None => groups.push((d, 1)),
        }
    }
    groups
}

/// Search `durations` for the best bid assignment. `should_stop` is polled
/// before every evaluation.
pub fn search_sequence(
    durations: &[i64],
    buckets: &BidBuckets,
    shape: &PodShapeConfig,
    should_stop: impl Fn() -> bool,
) -> SequenceResult {
    let mut result = SequenceResult {
        durations: durations.to_vec(),
        ..Default::default()
    };

    let groups = group_durations(durations);
    let pools: Vec<&[CtvBid]> = groups.iter().map(|(d, _)| buckets.get(*d)).collect();
    let pool_sizes: Vec<usize> = pools.iter().map(|p| p.len()).collect();
    let repeats: Vec<usize> = groups.iter().map(|(_, k)| *k).collect();

    if groups.is_empty() || repeats.iter().zip(&pool_sizes).any(|(k, n)| k > n) {
        return result;
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut state = IndexState::initial(&repeats);

    loop {
        if should_stop() {
            break;
        }
        result.evaluated += 1;

        let at = match evaluate(
            &pools,
            &state,
            shape.category_exclusion_percent,
            shape.advertiser_exclusion_percent,
        ) {
            Ok(candidate) => {
                let improves = result
                    .best
                    .as_ref()
                    .map_or(true, |best| candidate.beats(best));
                if !improves {
                    break;
                }
                result.best = Some(candidate);
                match state.last_position() {
                    Some(p) => p,
                    None => break,
                }
            }
            Err(rejection) => {
                // Every bid up to the offending one shares the blame.
                let stop = rejection.position;
                for (group, picks) in state.cursors.iter().enumerate().take(stop.group + 1) {
                    for (slot, &cursor) in picks.iter().enumerate() {
                        if group == stop.group && slot > stop.slot {
                            break;
                        }
                        let id = pools[group][cursor].id();
                        if seen.insert(id.to_string()) {
                            result.filtered.push((id.to_string(), rejection.reason));
                        }
                    }
                }
                stop
            }
        };

        match state.advance(&pool_sizes, at) {
            Some(next) => state = next,
            None => break,
        }
    }

    result
}
