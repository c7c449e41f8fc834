//! Ad pod request extensions carried on `imp.video.ext` and `request.ext`.
//!
//! Every field is optional on the wire; `set_default_values` fills in what
//! the publisher left out before a pod shape is derived.

use crate::config::AdPodDefaultsConfig;
use crate::error::{AdPodError, AdPodResult};
use crate::types::{PodShapeConfig, VideoLengthMatching};
use serde::{Deserialize, Serialize};

/// Where a pod extension was read from. Used to scope validation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodScope {
    Request,
    Video,
}

impl PodScope {
    fn key(self) -> &'static str {
        match self {
            PodScope::Request => "req.ext.adpod",
            PodScope::Video => "imp.video.ext.adpod",
        }
    }
}

fn invalid(scope: PodScope, field: &str, rule: &str) -> AdPodError {
    AdPodError::Validation(format!("{}.{} {}", scope.key(), field, rule))
}

/// Per-impression pod parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoAdPod {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minads: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxads: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adminduration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admaxduration: Option<i64>,
    /// 0 means no two ads from the same advertiser, 100 means no restriction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excladv: Option<i64>,
    /// 0 means every ad in a distinct IAB category, 100 means no restriction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excliabcat: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videolengths: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub videolengthmatching: Option<VideoLengthMatching>,
}

impl VideoAdPod {
    /// Report every violated rule, scoped to where the pod was read from.
    pub fn validate(&self, scope: PodScope) -> Vec<AdPodError> {
        let mut errors = Vec::new();

        if matches!(self.minads, Some(v) if v <= 0) {
            errors.push(invalid(scope, "minads", "must be positive number"));
        }
        if matches!(self.maxads, Some(v) if v <= 0) {
            errors.push(invalid(scope, "maxads", "must be positive number"));
        }
        if matches!(self.adminduration, Some(v) if v < 0) {
            errors.push(invalid(scope, "adminduration", "must be positive number"));
        }
        if matches!(self.admaxduration, Some(v) if v < 0) {
            errors.push(invalid(scope, "admaxduration", "must be positive number"));
        }
        if matches!(self.excladv, Some(v) if !(0..=100).contains(&v)) {
            errors.push(invalid(scope, "excladv", "must be number between 0 and 100"));
        }
        if matches!(self.excliabcat, Some(v) if !(0..=100).contains(&v)) {
            errors.push(invalid(scope, "excliabcat", "must be number between 0 and 100"));
        }
        if let (Some(min), Some(max)) = (self.minads, self.maxads) {
            if min > max {
                errors.push(invalid(scope, "minads", "must be less than maxads"));
            }
        }
        if let (Some(min), Some(max)) = (self.adminduration, self.admaxduration) {
            if min > max {
                errors.push(invalid(scope, "adminduration", "must be less than admaxduration"));
            }
        }
        if self.videolengths.iter().any(|&d| d <= 0) {
            errors.push(invalid(scope, "videolengths", "must contain positive numbers"));
        }

        errors
    }

    pub fn set_default_values(&mut self, defaults: &AdPodDefaultsConfig) {
        self.minads.get_or_insert(defaults.min_ads);
        self.maxads.get_or_insert(defaults.max_ads);
        self.excladv.get_or_insert(defaults.exclusion_percent);
        self.excliabcat.get_or_insert(defaults.exclusion_percent);
    }

    /// Slot bounds default to half of the pod bounds.
    pub fn set_default_ad_durations(&mut self, pod_min_duration: i64, pod_max_duration: i64) {
        self.adminduration.get_or_insert(pod_min_duration / 2);
        self.admaxduration.get_or_insert(pod_max_duration / 2);
    }

    /// Inherit ad counts and exclusion percentages from the request-level pod.
    pub fn merge(&mut self, parent: &VideoAdPod) {
        if self.minads.is_none() {
            self.minads = parent.minads;
        }
        if self.maxads.is_none() {
            self.maxads = parent.maxads;
        }
        if self.excladv.is_none() {
            self.excladv = parent.excladv;
        }
        if self.excliabcat.is_none() {
            self.excliabcat = parent.excliabcat;
        }
    }

    /// Check slot bounds against the impression's pod duration window.
    pub fn validate_pod_durations(
        &self,
        min_duration: i64,
        max_duration: i64,
        max_extended: i64,
    ) -> Vec<AdPodError> {
        let mut errors = Vec::new();

        if min_duration < 0 {
            errors.push(AdPodError::Validation(
                "imp.video.minduration must be positive number".to_string(),
            ));
        }
        if max_duration <= 0 {
            errors.push(AdPodError::Validation(
                "imp.video.maxduration must be positive non zero number".to_string(),
            ));
        }
        if min_duration > max_duration {
            errors.push(AdPodError::Validation(
                "imp.video.minduration must be less than imp.video.maxduration".to_string(),
            ));
        }

        if let (Some(ads), Some(duration)) = (self.minads, self.adminduration) {
            // An overflowing product is rejected rather than trusted.
            if ads.checked_mul(duration).map_or(true, |total| total < min_duration) {
                errors.push(AdPodError::Validation(
                    "imp.video.ext.adpod.adminduration * imp.video.ext.adpod.minads should be greater than or equal to imp.video.minduration".to_string(),
                ));
            }
        }

        if max_extended > 0 {
            if let (Some(ads), Some(duration)) = (self.maxads, self.admaxduration) {
                let limit = max_duration.saturating_add(max_extended);
                if ads.checked_mul(duration).map_or(true, |total| total > limit) {
                    errors.push(AdPodError::Validation(
                        "imp.video.ext.adpod.admaxduration * imp.video.ext.adpod.maxads should be less than or equal to imp.video.maxduration + imp.video.maxextended".to_string(),
                    ));
                }
            }
        }

        errors
    }

    /// Build the immutable pod shape once every field has a value.
    pub fn to_shape(&self, pod_min_duration: i64, pod_max_duration: i64) -> AdPodResult<PodShapeConfig> {
        let field = |value: Option<i64>, name: &str| {
            value.ok_or_else(|| AdPodError::Validation(format!("adpod.{name} is not set")))
        };

        Ok(PodShapeConfig {
            min_ads: field(self.minads, "minads")?,
            max_ads: field(self.maxads, "maxads")?,
            slot_min_duration: field(self.adminduration, "adminduration")?,
            slot_max_duration: field(self.admaxduration, "admaxduration")?,
            pod_min_duration,
            pod_max_duration,
            advertiser_exclusion_percent: field(self.excladv, "excladv")?,
            category_exclusion_percent: field(self.excliabcat, "excliabcat")?,
        })
    }
}

/// `imp.video.ext`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtVideoAdPod {
    /// Minutes from the start of the content where the pod plays.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adpod: Option<VideoAdPod>,
}

impl ExtVideoAdPod {
    pub fn validate(&self) -> Vec<AdPodError> {
        let mut errors = Vec::new();
        if matches!(self.offset, Some(v) if v < 0) {
            errors.push(AdPodError::Validation(
                "imp.video.ext.offset must be positive number".to_string(),
            ));
        }
        if let Some(pod) = &self.adpod {
            errors.extend(pod.validate(PodScope::Video));
        }
        errors
    }

    pub fn set_default_values(&mut self, defaults: &AdPodDefaultsConfig) {
        self.offset.get_or_insert(0);
        self.adpod
            .get_or_insert_with(VideoAdPod::default)
            .set_default_values(defaults);
    }
}

/// `request.ext.adpod`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtRequestAdPod {
    #[serde(flatten)]
    pub pod: VideoAdPod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crosspodexcladv: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crosspodexcliabcat: Option<i64>,
    /// Minutes between pods in which the category rule still applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excliabcatwindow: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excladvwindow: Option<i64>,
}

impl ExtRequestAdPod {
    pub fn validate(&self) -> Vec<AdPodError> {
        let mut errors = Vec::new();
        let percent = |v: Option<i64>| matches!(v, Some(p) if !(0..=100).contains(&p));
        let negative = |v: Option<i64>| matches!(v, Some(w) if w < 0);

        if percent(self.crosspodexcladv) {
            errors.push(AdPodError::Validation(
                "req.ext.adpod.crosspodexcladv must be a number between 0 and 100".to_string(),
            ));
        }
        if percent(self.crosspodexcliabcat) {
            errors.push(AdPodError::Validation(
                "req.ext.adpod.crosspodexcliabcat must be a number between 0 and 100".to_string(),
            ));
        }
        if negative(self.excliabcatwindow) {
            errors.push(AdPodError::Validation(
                "req.ext.adpod.excliabcatwindow must be positive number".to_string(),
            ));
        }
        if negative(self.excladvwindow) {
            errors.push(AdPodError::Validation(
                "req.ext.adpod.excladvwindow must be positive number".to_string(),
            ));
        }
        errors.extend(self.pod.validate(PodScope::Request));
        errors
    }

    pub fn set_default_values(&mut self, defaults: &AdPodDefaultsConfig) {
        self.pod.set_default_values(defaults);
        self.crosspodexcladv.get_or_insert(defaults.exclusion_percent);
        self.crosspodexcliabcat.get_or_insert(defaults.exclusion_percent);
        self.excliabcatwindow.get_or_insert(0);
        self.excladvwindow.get_or_insert(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(minads: i64, maxads: i64, admin: i64, admax: i64) -> VideoAdPod {
        VideoAdPod {
            minads: Some(minads),
            maxads: Some(maxads),
            adminduration: Some(admin),
            admaxduration: Some(admax),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_pod_is_valid() {
        assert!(VideoAdPod::default().validate(PodScope::Video).is_empty());
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let bad = VideoAdPod {
            minads: Some(0),
            maxads: Some(-1),
            excladv: Some(101),
            excliabcat: Some(-5),
            ..Default::default()
        };
        let errors = bad.validate(PodScope::Request);
        assert_eq!(errors.len(), 5);
        assert!(errors[0].to_string().contains("req.ext.adpod.minads"));
    }

    #[test]
    fn test_validate_min_greater_than_max() {
        let errors = pod(5, 2, 30, 10).validate(PodScope::Video);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("imp.video.ext.adpod.minads"));
        assert!(errors[1].to_string().contains("adminduration"));
    }

    #[test]
    fn test_set_default_values() {
        let mut p = VideoAdPod {
            maxads: Some(6),
            ..Default::default()
        };
        p.set_default_values(&AdPodDefaultsConfig::default());
        assert_eq!(p.minads, Some(2));
        assert_eq!(p.maxads, Some(6));
        assert_eq!(p.excladv, Some(100));
        assert_eq!(p.excliabcat, Some(100));
    }

    #[test]
    fn test_default_ad_durations_are_half_pod() {
        let mut p = VideoAdPod::default();
        p.set_default_ad_durations(30, 91);
        assert_eq!(p.adminduration, Some(15));
        assert_eq!(p.admaxduration, Some(45));
    }

    #[test]
    fn test_merge_keeps_own_values() {
        let parent = VideoAdPod {
            minads: Some(1),
            maxads: Some(4),
            excladv: Some(50),
            ..Default::default()
        };
        let mut child = VideoAdPod {
            maxads: Some(2),
            ..Default::default()
        };
        child.merge(&parent);
        assert_eq!(child.minads, Some(1));
        assert_eq!(child.maxads, Some(2));
        assert_eq!(child.excladv, Some(50));
        assert_eq!(child.excliabcat, None);
    }

    #[test]
    fn test_validate_pod_durations() {
        assert!(pod(2, 3, 15, 30).validate_pod_durations(30, 90, 0).is_empty());

        let errors = pod(2, 3, 10, 30).validate_pod_durations(30, 60, 15);
        assert_eq!(errors.len(), 2);

        let errors = pod(1, 1, 5, 5).validate_pod_durations(-1, -2, 0);
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_overflowing_duration_product_is_rejected() {
        let errors = pod(2, i64::MAX, 15, 30).validate_pod_durations(30, 60, 15);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("admaxduration"));

        let errors = pod(i64::MIN, 2, i64::MAX, 30).validate_pod_durations(30, 60, 0);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("adminduration"));
    }

    #[test]
    fn test_to_shape_requires_defaults() {
        assert!(VideoAdPod::default().to_shape(30, 60).is_err());

        let mut p = pod(2, 6, 5, 9);
        p.set_default_values(&AdPodDefaultsConfig::default());
        let shape = p.to_shape(30, 60).unwrap();
        assert_eq!(shape.max_ads, 6);
        assert_eq!(shape.pod_max_duration, 60);
        assert_eq!(shape.category_exclusion_percent, 100);
    }

    #[test]
    fn test_request_ext_parses_flattened_pod() {
        let ext: ExtRequestAdPod = serde_json::from_str(
            r#"{"minads":1,"maxads":4,"crosspodexcladv":120,"excladvwindow":-1}"#,
        )
        .unwrap();
        assert_eq!(ext.pod.maxads, Some(4));
        assert_eq!(ext.validate().len(), 2);
    }

    #[test]
    fn test_video_ext_defaults_create_pod() {
        let mut ext = ExtVideoAdPod::default();
        ext.set_default_values(&AdPodDefaultsConfig::default());
        assert_eq!(ext.offset, Some(0));
        assert_eq!(ext.adpod.as_ref().and_then(|p| p.minads), Some(2));
    }

    #[test]
    fn test_video_lengths_must_be_positive() {
        let p = VideoAdPod {
            videolengths: vec![15, 0],
            ..Default::default()
        };
        assert_eq!(p.validate(PodScope::Video).len(), 1);
    }
}
