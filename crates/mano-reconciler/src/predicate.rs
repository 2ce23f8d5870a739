//! Watch-event filtering.
//!
//! Update events are admitted only when the spec generation or the status
//! phase changed. Pure timestamp refreshes (the Running-phase poll touching
//! `last_reconcile_time`) are dropped so the reconciler does not feed itself.

use crate::store::WatchEvent;

pub fn admits(event: &WatchEvent) -> bool {
    match event {
        WatchEvent::Added(_) | WatchEvent::Deleted(_) => true,
        WatchEvent::Modified { old, new } => {
            old.metadata.generation != new.metadata.generation
                || old.status.phase != new.status.phase
                || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
                || old.metadata.finalizers != new.metadata.finalizers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mano_core::types::{
        CloudType, Placement, QosRequirements, VnfPhase, VnfResource, VnfSpec, VnfType,
    };

    fn vnf() -> VnfResource {
        VnfResource::new(
            "slices",
            "ran-a",
            VnfSpec {
                vnf_type: VnfType::Ran,
                qos: QosRequirements {
                    bandwidth_mbps: 4.0,
                    latency_ms: 5.0,
                },
                placement: Placement {
                    cloud_type: CloudType::Edge,
                    site: "edge01".to_string(),
                },
                target_clusters: vec!["edge01".to_string()],
                version: None,
            },
        )
    }

    fn modified(old: VnfResource, new: VnfResource) -> WatchEvent {
        WatchEvent::Modified {
            old: Box::new(old),
            new: Box::new(new),
        }
    }

    #[test]
    fn adds_and_deletes_always_pass() {
        assert!(admits(&WatchEvent::Added(vnf())));
        assert!(admits(&WatchEvent::Deleted(vnf())));
    }

    #[test]
    fn generation_change_passes() {
        let old = vnf();
        let mut new = old.clone();
        new.metadata.generation += 1;
        assert!(admits(&modified(old, new)));
    }

    #[test]
    fn phase_change_passes() {
        let old = vnf();
        let mut new = old.clone();
        new.status.phase = Some(VnfPhase::Pending);
        assert!(admits(&modified(old, new)));
    }

    #[test]
    fn pure_timestamp_refresh_is_dropped() {
        let mut old = vnf();
        old.status.phase = Some(VnfPhase::Running);
        let mut new = old.clone();
        new.status.last_reconcile_time = Some(Utc::now());
        assert!(!admits(&modified(old, new)));
    }

    #[test]
    fn deletion_timestamp_passes() {
        let old = vnf();
        let mut new = old.clone();
        new.metadata.deletion_timestamp = Some(Utc::now());
        assert!(admits(&modified(old, new)));
    }
}
