use crate::error::{AdPodError, AdPodResult};
use crate::openrtb::Bid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

/// How requested video lengths map onto slot ranges.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VideoLengthMatching {
    /// Each slot accepts exactly one requested length.
    Exact,
    /// Each slot accepts anything from the shortest requested length up.
    Roundup,
}

/// Shape of one commercial break. All durations are in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodShapeConfig {
    pub min_ads: i64,
    pub max_ads: i64,
    pub slot_min_duration: i64,
    pub slot_max_duration: i64,
    pub pod_min_duration: i64,
    pub pod_max_duration: i64,
    pub advertiser_exclusion_percent: i64,
    pub category_exclusion_percent: i64,
}

impl PodShapeConfig {
    /// Ordering checks only. Planners accept shapes that fail these and
    /// return an empty plan for them.
    pub fn validate(&self) -> AdPodResult<()> {
        if self.min_ads > self.max_ads {
            return Err(AdPodError::Validation(format!(
                "min_ads {} exceeds max_ads {}",
                self.min_ads, self.max_ads
            )));
        }
        if self.slot_min_duration > self.slot_max_duration {
            return Err(AdPodError::Validation(format!(
                "slot_min_duration {} exceeds slot_max_duration {}",
                self.slot_min_duration, self.slot_max_duration
            )));
        }
        if self.pod_min_duration > self.pod_max_duration {
            return Err(AdPodError::Validation(format!(
                "pod_min_duration {} exceeds pod_max_duration {}",
                self.pod_min_duration, self.pod_max_duration
            )));
        }
        for (name, pct) in [
            ("advertiser_exclusion_percent", self.advertiser_exclusion_percent),
            ("category_exclusion_percent", self.category_exclusion_percent),
        ] {
            if !(0..=100).contains(&pct) {
                return Err(AdPodError::Validation(format!("{name} {pct} is not within 0..=100")));
            }
        }
        Ok(())
    }
}

/// Duration range accepted by one ad slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DurationSlot {
    pub min_duration: i64,
    pub max_duration: i64,
}

impl DurationSlot {
    pub fn new(min_duration: i64, max_duration: i64) -> Self {
        Self {
            min_duration,
            max_duration,
        }
    }
}

/// Why a bid did or did not end up in the pod.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterReasonCode {
    WinningBid,
    CategoryExclusion,
    DomainExclusion,
    #[default]
    DidNotGetChance,
}

impl FilterReasonCode {
    /// Numeric code reported in `bid.ext.adpod.aprc`.
    pub fn code(self) -> u8 {
        match self {
            FilterReasonCode::WinningBid => 0,
            FilterReasonCode::CategoryExclusion => 1,
            FilterReasonCode::DomainExclusion => 2,
            FilterReasonCode::DidNotGetChance => 3,
        }
    }
}

/// A video bid competing for a slot in a pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtvBid {
    pub bid: Bid,
    pub duration: i64,
    pub deal_tier_satisfied: bool,
    #[serde(default)]
    pub filter_reason: FilterReasonCode,
}

impl CtvBid {
    pub fn new(bid: Bid, duration: i64, deal_tier_satisfied: bool) -> Self {
        Self {
            bid,
            duration,
            deal_tier_satisfied,
            filter_reason: FilterReasonCode::DidNotGetChance,
        }
    }

    /// Wrap a bidder response. The ad duration comes from
    /// `ext.prebid.video.duration`, falling back to `default_duration`
    /// when it is absent or not positive.
    pub fn from_openrtb(mut bid: Bid, default_duration: i64) -> Self {
        if bid.id.is_empty() {
            bid.id = Uuid::new_v4().to_string();
        }

        let ext = bid.ext.as_ref();
        let duration = match ext
            .and_then(|e| e.pointer("/prebid/video/duration"))
            .and_then(|v| v.as_i64())
            .filter(|d| *d > 0)
        {
            Some(d) => d,
            None => {
                debug!(bid_id = %bid.id, default_duration, "bid has no duration");
                default_duration
            }
        };
        let deal_tier_satisfied = ext
            .and_then(|e| e.pointer("/prebid/dealtiersatisfied"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Self::new(bid, duration, deal_tier_satisfied)
    }

    pub fn id(&self) -> &str {
        &self.bid.id
    }

    pub fn price(&self) -> f64 {
        self.bid.price
    }

    pub fn categories(&self) -> &[String] {
        &self.bid.cat
    }

    pub fn domains(&self) -> &[String] {
        &self.bid.adomain
    }

    /// Bidder response with the resolved duration and filter reason
    /// written back into its extension.
    pub fn to_response_bid(&self) -> Bid {
        let mut bid = self.bid.clone();
        let mut ext = match bid.ext.take() {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };

        let prebid = ext
            .entry("prebid")
            .or_insert_with(|| serde_json::json!({}));
        if let Some(prebid) = prebid.as_object_mut() {
            let video = prebid
                .entry("video")
                .or_insert_with(|| serde_json::json!({}));
            if let Some(video) = video.as_object_mut() {
                video.insert("duration".to_string(), self.duration.into());
            }
        }
        ext.insert(
            "adpod".to_string(),
            serde_json::json!({ "aprc": self.filter_reason.code() }),
        );

        bid.ext = Some(serde_json::Value::Object(ext));
        bid
    }
}

/// Bids grouped by ad duration. Each bucket is ordered by deal tier first,
/// then price, both descending.
#[derive(Debug, Clone, Default)]
pub struct BidBuckets {
    buckets: BTreeMap<i64, Vec<CtvBid>>,
}

impl BidBuckets {
    /// Group and sort bids. Zero-priced bids never enter a bucket.
    pub fn from_bids(bids: impl IntoIterator<Item = CtvBid>) -> Self {
        let mut buckets: BTreeMap<i64, Vec<CtvBid>> = BTreeMap::new();
        for bid in bids {
            if bid.price() <= 0.0 {
                continue;
            }
            buckets.entry(bid.duration).or_default().push(bid);
        }

        for bucket in buckets.values_mut() {
            bucket.sort_by(|a, b| {
                b.deal_tier_satisfied
                    .cmp(&a.deal_tier_satisfied)
                    .then_with(|| b.price().total_cmp(&a.price()))
            });
        }

        Self { buckets }
    }

    /// Takes buckets as-is. Callers must already have ordered every bucket
    /// by (deal tier, price) descending.
    pub fn from_sorted(buckets: BTreeMap<i64, Vec<CtvBid>>) -> Self {
        Self { buckets }
    }

    pub fn get(&self, duration: i64) -> &[CtvBid] {
        self.buckets
            .get(&duration)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of bids available per duration.
    pub fn counts(&self) -> BTreeMap<i64, usize> {
        self.buckets
            .iter()
            .map(|(d, bids)| (*d, bids.len()))
            .collect()
    }

    pub fn total_bids(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CtvBid> {
        self.buckets.values().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CtvBid> {
        self.buckets.values_mut().flatten()
    }
}

/// The assembled pod. Absence of an `AdPodBid` means no fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdPodBid {
    pub bids: Vec<CtvBid>,
    pub price: f64,
    pub deal_count: usize,
    pub categories: BTreeSet<String>,
    pub domains: BTreeSet<String>,
}

impl AdPodBid {
    pub fn from_bids(bids: Vec<CtvBid>) -> Self {
        let price: f64 = bids.iter().map(CtvBid::price).sum();
        let deal_count = bids.iter().filter(|b| b.deal_tier_satisfied).count();
        let categories = bids
            .iter()
            .flat_map(|b| b.categories().iter().cloned())
            .collect();
        let domains = bids
            .iter()
            .flat_map(|b| b.domains().iter().cloned())
            .collect();
        Self {
            bids,
            price,
            deal_count,
            categories,
            domains,
        }
    }

    pub fn total_duration(&self) -> i64 {
        self.bids.iter().map(|b| b.duration).sum()
    }

    /// Single bid standing in for the whole pod. `ext.adpod.refbids` lists
    /// the member bids in play order.
    pub fn to_openrtb_bid(&self, imp_id: &str) -> Bid {
        let refbids: Vec<&str> = self.bids.iter().map(CtvBid::id).collect();
        Bid {
            id: Uuid::new_v4().to_string(),
            impid: imp_id.to_string(),
            price: self.price,
            adomain: self.domains.iter().cloned().collect(),
            cat: self.categories.iter().cloned().collect(),
            ext: Some(serde_json::json!({
                "prebid": {
                    "type": "video",
                    "video": { "duration": self.total_duration() }
                },
                "adpod": { "refbids": refbids }
            })),
            ..Default::default()
        }
    }
}

/// One slot of a pod fanned out as its own impression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImpAdPodConfig {
    pub imp_id: String,
    pub min_duration: i64,
    pub max_duration: i64,
    /// 1-based position of the slot within the pod.
    pub sequence_number: usize,
}

pub fn encode_impression_id(imp_id: &str, sequence_number: usize) -> String {
    format!("{imp_id}_{sequence_number}")
}

/// Split a fanned-out impression id into the parent impression id and slot
/// sequence. Ids without a numeric suffix decode to sequence 0.
pub fn decode_impression_id(id: &str) -> (&str, usize) {
    match id.rsplit_once('_') {
        Some((imp_id, seq)) if !imp_id.is_empty() => match seq.parse::<usize>() {
            Ok(n) => (imp_id, n),
            Err(_) => (id, 0),
        },
        _ => (id, 0),
    }
}
