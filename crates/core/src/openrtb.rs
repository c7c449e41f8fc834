//! OpenRTB 2.5 compatible impression and bid response types.
//! Subset of fields relevant to CTV ad pod assembly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Impression {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Video>,
    #[serde(default)]
    pub bidfloor: f64,
    #[serde(default = "default_bidfloorcur")]
    pub bidfloorcur: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

fn default_bidfloorcur() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Video {
    #[serde(default)]
    pub mimes: Vec<String>,
    #[serde(default)]
    pub minduration: i64,
    #[serde(default)]
    pub maxduration: i64,
    #[serde(default)]
    pub maxextended: i64,
    #[serde(default)]
    pub protocols: Vec<u32>,
    /// Position of this ad within a pod, starting at 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

/// OpenRTB Bid Response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidResponse {
    pub id: String,
    #[serde(default)]
    pub seatbid: Vec<SeatBid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bidid: Option<String>,
    #[serde(default = "default_cur")]
    pub cur: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

fn default_cur() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatBid {
    pub bid: Vec<Bid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seat: Option<String>,
    #[serde(default)]
    pub group: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bid {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub impid: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dealid: Option<String>,
    /// Advertiser domains.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adomain: Vec<String>,
    /// IAB content categories of the creative.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cat: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

impl BidResponse {
    /// Create a no-bid response for the given request ID.
    pub fn no_bid(request_id: String) -> Self {
        Self {
            id: request_id,
            seatbid: Vec::new(),
            bidid: None,
            cur: "USD".to_string(),
            ext: None,
        }
    }
}
