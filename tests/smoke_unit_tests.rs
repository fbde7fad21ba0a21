//! Smoke Screen Unit tests for approval workflow components
//!
//! These tests span the public surface of the crate, testing behavior in
//! isolation from the database scenarios. They are intended as a smoke
//! screen and mostly cover the happy path.
//!

use chrono::{Datelike, Timelike};
use form_approval::{
    Actor, ApprovalError, ApprovalRequest, FormType, RequestStatus, ServiceConfig, StepKind,
    StepLedger, StepStatus, SubjectRef, TimeStamp,
    ledger::rollup,
    template::steps_for,
    utils::{new_uuid_to_bech32, step_key},
};

// UTILS MODULE TESTS
#[cfg(test)]
mod utils_tests {
    use super::*;

    /// Request ids are bech32 strings carrying the configured prefix
    #[test]
    fn generates_valid_bech32_with_hrp() {
        let encoded = new_uuid_to_bech32("req").unwrap();
        assert!(encoded.starts_with("req1"));
        assert!(encoded.len() > 10);
    }

    /// An empty human readable part is refused
    #[test]
    fn handles_empty_hrp() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    #[test]
    fn generates_unique_ids() {
        let id1 = new_uuid_to_bech32("req").unwrap();
        let id2 = new_uuid_to_bech32("req").unwrap();
        assert_ne!(id1, id2);
    }

    /// Step keys of one request sort by step order
    #[test]
    fn step_keys_sort_by_order() {
        let mut keys = vec![
            step_key("req1abc", 10),
            step_key("req1abc", 2),
            step_key("req1abc", 1),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                step_key("req1abc", 1),
                step_key("req1abc", 2),
                step_key("req1abc", 10)
            ]
        );
    }
}

// TYPES MODULE TESTS
#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn timestamp_new_with_creates_specific_time() {
        let ts = TimeStamp::new_with(2025, 3, 14, 9, 30, 0).unwrap();
        let dt = ts.to_datetime_utc();

        assert_eq!(dt.year(), 2025);
        assert_eq!(dt.month(), 3);
        assert_eq!(dt.day(), 14);
        assert_eq!(dt.hour(), 9);
        assert_eq!(dt.minute(), 30);
    }

    #[test]
    fn timestamp_new_with_rejects_invalid_dates() {
        assert!(TimeStamp::new_with(2025, 2, 30, 0, 0, 0).is_none());
    }

    #[test]
    fn timestamp_cbor_roundtrip() {
        let original = TimeStamp::new();
        let bytes = minicbor::to_vec(&original).unwrap();
        let decoded: TimeStamp<chrono::Utc> = minicbor::decode(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn subject_ref_display_and_key() {
        let subject = SubjectRef::new("asset_transfer", "42");
        assert_eq!(subject.to_string(), "asset_transfer#42");
        assert_eq!(subject.storage_key(), b"asset_transfer/42".to_vec());
    }
}

// TEMPLATE MODULE TESTS
#[cfg(test)]
mod template_tests {
    use super::*;

    fn codes(form: &FormType) -> Vec<&'static str> {
        steps_for(form).iter().map(|t| t.code).collect()
    }

    #[test]
    fn known_form_types_have_fixed_topologies() {
        assert_eq!(
            codes(&FormType::InventoryScheduling),
            vec!["prepared_by", "noted_by", "approved_by"]
        );
        assert_eq!(
            codes(&FormType::OffCampus),
            vec!["issued_by", "external_approved_by"]
        );
        assert_eq!(codes(&FormType::Transfer), vec!["prepared_by", "approved_by"]);
        assert_eq!(
            codes(&FormType::TurnoverDisposal),
            vec!["prepared_by", "external_noted_by", "noted_by"]
        );
    }

    #[test]
    fn unknown_form_type_gets_single_auto_step() {
        let form = FormType::from("bulk_relocation");
        assert!(!form.is_known());

        let template = steps_for(&form);
        assert_eq!(template.len(), 1);
        assert_eq!(template[0].code, "prepared");
        assert!(template[0].auto_approve_by_creator);
    }

    #[test]
    fn form_type_tags_roundtrip() {
        for tag in [
            "inventory_scheduling",
            "off_campus",
            "transfer",
            "turnover_disposal",
            "something_else",
        ] {
            assert_eq!(FormType::from_tag(tag).as_str(), tag);
        }
    }
}

// LEDGER MODULE TESTS
#[cfg(test)]
mod ledger_tests {
    use super::*;

    fn requester() -> Actor {
        Actor::new("staff-001", "Ada Property Custodian")
    }

    #[test]
    fn off_campus_needs_issuer_then_outside_signature() {
        let now = TimeStamp::new();
        let mut ledger = StepLedger::seed(
            "req1smoke",
            steps_for(&FormType::OffCampus),
            &requester(),
            &now,
        );
        assert_eq!(ledger.current_order(), Some(1));
        assert_eq!(ledger.current().map(|s| s.kind()), Some(StepKind::Internal));

        ledger.approve(1, &requester(), None, &now).unwrap();
        let step = ledger
            .approve_external(2, "Dr. Field".into(), Some("Dean".into()), None, &now)
            .unwrap();
        assert_eq!(step.signer_name(), Some("Dr. Field"));
        assert_eq!(ledger.rollup(), RequestStatus::Approved);
    }

    #[test]
    fn external_step_refuses_internal_approval() {
        let now = TimeStamp::new();
        let mut ledger = StepLedger::seed(
            "req1smoke",
            steps_for(&FormType::TurnoverDisposal),
            &requester(),
            &now,
        );
        let err = ledger.approve(2, &requester(), None, &now).unwrap_err();
        assert!(matches!(err, ApprovalError::InvalidStepType { .. }));
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "step 2 is external, this action needs an internal step"
        );
    }

    #[test]
    fn rollup_of_empty_ledger_is_approved() {
        assert_eq!(rollup(&[]), RequestStatus::Approved);
    }

    #[test]
    fn request_takes_status_from_rollup() {
        let now = TimeStamp::new();
        let mut ledger = StepLedger::seed(
            "req1smoke",
            steps_for(&FormType::Transfer),
            &requester(),
            &now,
        );
        let mut request = ApprovalRequest::new(
            "req1smoke".into(),
            SubjectRef::new("asset_transfer", "9"),
            requester(),
            FormType::Transfer,
            "Projector".into(),
            now.clone(),
        );
        request.apply_rollup(&ledger, None, None, &now);
        assert_eq!(request.status, RequestStatus::PendingReview);

        let approver = Actor::new("staff-003", "Alan Property Director");
        ledger
            .reject(2, &approver, Some("not in register".into()), &now)
            .unwrap();
        assert_eq!(
            request.apply_rollup(&ledger, Some(&approver), Some("not in register"), &now),
            Some(RequestStatus::Rejected)
        );
        assert_eq!(ledger.step(2).map(|s| s.status), Some(StepStatus::Rejected));
        assert_eq!(request.reviewed_by, Some(approver));
    }
}

// CONFIG MODULE TESTS
#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn defaults_match_stored_layout() {
        let config = ServiceConfig::default();
        assert_eq!(config.request_id_hrp, "req");
        assert!(!config.flush_on_commit);
        assert_eq!(config.steps_tree, "approval_steps");
    }
}
