//! Slice intents.
//!
//! An intent is the operator-facing request: a slice class plus coarse
//! throughput/latency targets. The orchestrator expands it into concrete VNF
//! resources and a transport spec using the class QoS map below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::slice::SlicePriority;
use crate::types::{QosRequirements, VnfType, QOS_BANDWIDTH_RANGE, QOS_LATENCY_RANGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SliceClass {
    #[serde(rename = "eMBB")]
    Embb,
    #[serde(rename = "URLLC")]
    Urllc,
    #[serde(rename = "mMTC")]
    Mmtc,
}

impl SliceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceClass::Embb => "eMBB",
            SliceClass::Urllc => "URLLC",
            SliceClass::Mmtc => "mMTC",
        }
    }

    pub fn priority(&self) -> SlicePriority {
        match self {
            SliceClass::Urllc => SlicePriority::High,
            SliceClass::Embb => SlicePriority::Medium,
            SliceClass::Mmtc => SlicePriority::Low,
        }
    }
}

/// Network-function role deployed on a cluster of the given tier: radio at
/// the edge, core functions at regional/central sites. One VNF is created per
/// (target cluster, role).
pub fn role_for_cloud(cloud_type: crate::types::CloudType) -> VnfType {
    match cloud_type {
        crate::types::CloudType::Edge => VnfType::Ran,
        crate::types::CloudType::Regional => VnfType::Cn,
        crate::types::CloudType::Central => VnfType::Cn,
    }
}

/// Operator-submitted slice request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceIntent {
    #[serde(default = "Uuid::new_v4")]
    pub intent_id: Uuid,
    pub name: String,
    pub slice_class: SliceClass,
    pub throughput_mbps: f64,
    pub rtt_ms: f64,
    pub target_clusters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl SliceIntent {
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::ManoError::Validation(
                "intent name must not be empty".into(),
            ));
        }
        if self.throughput_mbps <= 0.0 {
            return Err(crate::ManoError::Validation(
                "throughput target must be positive".into(),
            ));
        }
        if self.rtt_ms <= 0.0 {
            return Err(crate::ManoError::Validation(
                "rtt target must be positive".into(),
            ));
        }
        if self.target_clusters.is_empty() {
            return Err(crate::ManoError::Validation(
                "at least one target cluster is required".into(),
            ));
        }
        Ok(())
    }

    /// Per-VNF QoS derived from the intent targets, clamped into the declared
    /// ranges. The RTT target is an end-to-end round trip; the one-way budget
    /// carried on the VNF is half of it.
    pub fn qos(&self) -> QosRequirements {
        let (bw_lo, bw_hi) = QOS_BANDWIDTH_RANGE;
        let (lat_lo, lat_hi) = QOS_LATENCY_RANGE;
        QosRequirements {
            bandwidth_mbps: self.throughput_mbps.clamp(bw_lo, bw_hi),
            latency_ms: (self.rtt_ms / 2.0).clamp(lat_lo, lat_hi),
        }
    }
}

/// Aggregate deployment state of one intent across its member VNFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentState {
    Pending,
    Deploying,
    Ready,
    Degraded,
    Failed,
}

impl IntentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::Pending => "Pending",
            IntentState::Deploying => "Deploying",
            IntentState::Ready => "Ready",
            IntentState::Degraded => "Degraded",
            IntentState::Failed => "Failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(class: SliceClass, throughput: f64, rtt: f64) -> SliceIntent {
        SliceIntent {
            intent_id: Uuid::new_v4(),
            name: "slice-a".to_string(),
            slice_class: class,
            throughput_mbps: throughput,
            rtt_ms: rtt,
            target_clusters: vec!["edge01".to_string()],
            site: None,
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn qos_derivation_clamps_into_declared_ranges() {
        let qos = intent(SliceClass::Embb, 4.57, 16.1).qos();
        assert!((qos.bandwidth_mbps - 4.57).abs() < 1e-9);
        assert!((qos.latency_ms - 8.05).abs() < 1e-9);
        assert!(qos.validate().is_ok());

        // Targets outside the envelope are clamped, not rejected.
        let qos = intent(SliceClass::Mmtc, 0.2, 80.0).qos();
        assert!((qos.bandwidth_mbps - 1.0).abs() < 1e-9);
        assert!((qos.latency_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn class_priorities() {
        assert_eq!(SliceClass::Urllc.priority(), SlicePriority::High);
        assert_eq!(SliceClass::Embb.priority(), SlicePriority::Medium);
        assert_eq!(SliceClass::Mmtc.priority(), SlicePriority::Low);
    }

    #[test]
    fn roles_follow_the_cloud_tier() {
        use crate::types::CloudType;
        assert_eq!(role_for_cloud(CloudType::Edge), VnfType::Ran);
        assert_eq!(role_for_cloud(CloudType::Regional), VnfType::Cn);
        assert_eq!(role_for_cloud(CloudType::Central), VnfType::Cn);
    }

    #[test]
    fn intent_validation() {
        assert!(intent(SliceClass::Embb, 4.0, 16.0).validate().is_ok());
        assert!(intent(SliceClass::Embb, 0.0, 16.0).validate().is_err());
        let mut bad = intent(SliceClass::Embb, 4.0, 16.0);
        bad.target_clusters.clear();
        assert!(bad.validate().is_err());
    }
}
