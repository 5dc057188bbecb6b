//! Change workflow against the SQLite audit store

mod common;

use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use common::*;
use compliance_audit::export::{ExportAdapter, FileArchiveAdapter};
use compliance_audit::store::AuditEventStore;
use compliance_audit::workflow::{
    ApprovalRouter, ChangeDraft, ChangeStatus, ChangeType, ComplianceCheck, PostImplementationReport,
    RiskLevel, RollbackTrigger, APPROVAL_RECORDED,
};
use compliance_audit::AuditError;

async fn sqlite_store() -> Arc<dyn AuditEventStore> {
    Arc::new(setup_test_store().await)
}

fn emergency_draft() -> ChangeDraft {
    ChangeDraft::new("Hotfix for checkout outage", "Restart stuck workers and roll the fix")
        .affecting("checkout")
}

fn clean_report() -> PostImplementationReport {
    PostImplementationReport::new(vec![
        ComplianceCheck::passed("audit_logging_enabled"),
        ComplianceCheck::passed("access_controls_intact"),
        ComplianceCheck::passed("smoke_tests"),
    ])
}

#[tokio::test]
async fn test_emergency_change_waits_for_cab_approval() {
    let store = sqlite_store().await;
    let wf = workflow_on(store.clone(), "acme").with_router(ApprovalRouter::new(1));

    let change = wf.submit(&requester(), emergency_draft()).await.unwrap();
    let id = change.correlation_id;
    let change = wf.assess(&requester(), id).await.unwrap();
    assert_eq!(change.status, ChangeStatus::ImpactAssessed);
    assert_eq!(change.change_type, ChangeType::Emergency);
    assert!(change.risk_level >= RiskLevel::High);

    let err = wf.start_implementation(&implementer(), id).await.unwrap_err();
    assert!(matches!(
        err,
        AuditError::InvalidTransition {
            from: ChangeStatus::ImpactAssessed,
            to: ChangeStatus::Implementing
        }
    ));

    let change = wf.approve(&cab_member("carol"), id, None).await.unwrap();
    assert_eq!(change.status, ChangeStatus::Approved);

    let change = wf.start_implementation(&implementer(), id).await.unwrap();
    assert_eq!(change.status, ChangeStatus::Implementing);

    let types: Vec<String> = wf.history(id).await.unwrap().into_iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec!["change.requested", "change.impact_assessed", "change.approved", "change.implementing"]
    );
    assert!(store.verify_integrity(&tenant("acme")).await.unwrap());
}

#[tokio::test]
async fn test_cab_quorum_requires_distinct_members() {
    let wf = workflow_on(sqlite_store().await, "acme");
    let id = wf.submit(&requester(), emergency_draft()).await.unwrap().correlation_id;
    wf.assess(&requester(), id).await.unwrap();

    let change = wf.approve(&cab_member("carol"), id, Some("ok".to_string())).await.unwrap();
    assert_eq!(change.status, ChangeStatus::ImpactAssessed);
    assert_eq!(change.approvals.len(), 1);

    let err = wf.approve(&cab_member("carol"), id, None).await.unwrap_err();
    assert!(matches!(err, AuditError::ApprovalDenied(_)));

    // Managers sign off normal changes only.
    let err = wf.approve(&manager(), id, None).await.unwrap_err();
    assert!(matches!(err, AuditError::ApprovalDenied(_)));

    let change = wf.approve(&cab_member("dave"), id, None).await.unwrap();
    assert_eq!(change.status, ChangeStatus::ImpactAssessed);

    let change = wf.approve(&cab_member("frank"), id, None).await.unwrap();
    assert_eq!(change.status, ChangeStatus::Approved);
    assert_eq!(change.approvals.len(), 3);

    let history = wf.history(id).await.unwrap();
    let partial: Vec<_> = history.iter().filter(|e| e.event_type == APPROVAL_RECORDED).collect();
    assert_eq!(partial.len(), 2);
    assert_eq!(partial[0].metadata.get("remaining"), Some(&serde_json::json!(2)));
    assert_eq!(partial[1].metadata.get("remaining"), Some(&serde_json::json!(1)));

    assert_eq!(wf.load(id).await.unwrap(), change);
}

#[tokio::test]
async fn test_single_ciso_approval_satisfies_cab() {
    let wf = workflow_on(sqlite_store().await, "acme");
    let id = wf.submit(&requester(), emergency_draft()).await.unwrap().correlation_id;
    wf.assess(&requester(), id).await.unwrap();

    let change = wf.approve(&ciso(), id, None).await.unwrap();
    assert_eq!(change.status, ChangeStatus::Approved);
}

#[tokio::test]
async fn test_requester_cannot_approve_own_change() {
    let wf = workflow_on(sqlite_store().await, "acme");
    let draft = ChangeDraft::new("Tune cache sizes", "Raise cache limits on the web tier");
    let id = wf.submit(&manager(), draft).await.unwrap().correlation_id;
    wf.assess(&manager(), id).await.unwrap();

    let err = wf.approve(&manager(), id, None).await.unwrap_err();
    assert!(matches!(err, AuditError::ApprovalDenied(_)));
    assert_eq!(wf.history(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_verification_rolls_back() {
    let store = sqlite_store().await;
    let wf = workflow_on(store.clone(), "acme");
    let draft = ChangeDraft::new("Tune cache sizes", "Raise cache limits on the web tier");
    let id = wf.submit(&requester(), draft).await.unwrap().correlation_id;
    wf.assess(&requester(), id).await.unwrap();
    wf.approve(&manager(), id, None).await.unwrap();
    wf.start_implementation(&implementer(), id).await.unwrap();

    let report = PostImplementationReport::new(vec![
        ComplianceCheck::passed("audit_logging_enabled"),
        ComplianceCheck::passed("access_controls_intact"),
        ComplianceCheck::failed("smoke_tests", "checkout returns 500"),
    ]);
    let change = wf.complete_verification(&implementer(), id, &report).await.unwrap();
    assert_eq!(change.status, ChangeStatus::RolledBack);

    let last = wf.history(id).await.unwrap().pop().unwrap();
    assert_eq!(last.event_type, "change.rolled_back");
    assert_eq!(
        last.metadata.get("trigger"),
        Some(&serde_json::to_value(RollbackTrigger::VerificationFailure).unwrap())
    );
    assert!(last.metadata.contains_key("snapshot"));

    // Terminal: nothing more may happen to it.
    let err = wf.review(&manager(), id, None).await.unwrap_err();
    assert!(matches!(err, AuditError::InvalidTransition { .. }));
    assert!(store.verify_integrity(&tenant("acme")).await.unwrap());
}

#[tokio::test]
async fn test_rejected_change_is_terminal() {
    let wf = workflow_on(sqlite_store().await, "acme");
    let draft = ChangeDraft::new("Tune cache sizes", "Raise cache limits on the web tier");
    let id = wf.submit(&requester(), draft).await.unwrap().correlation_id;
    wf.assess(&requester(), id).await.unwrap();

    let change = wf.reject(&manager(), id, "no rollback plan").await.unwrap();
    assert_eq!(change.status, ChangeStatus::Rejected);

    let err = wf.approve(&cab_member("carol"), id, None).await.unwrap_err();
    assert!(matches!(err, AuditError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_changes_are_isolated_per_tenant() {
    let store = sqlite_store().await;
    let acme = workflow_on(store.clone(), "acme");
    let globex = workflow_on(store.clone(), "globex");

    let id = acme
        .submit(&requester(), ChangeDraft::new("Tune cache sizes", "Raise cache limits"))
        .await
        .unwrap()
        .correlation_id;

    assert!(matches!(globex.load(id).await, Err(AuditError::ChangeNotFound(_))));
    assert!(matches!(
        globex.assess(&requester(), id).await,
        Err(AuditError::ChangeNotFound(_))
    ));
}

#[tokio::test]
async fn test_terminal_change_forwarded_to_archive() {
    let archive = TempDir::new().unwrap();
    let adapter: Arc<dyn ExportAdapter> = Arc::new(FileArchiveAdapter::new(archive.path()).unwrap());
    let wf = workflow_on(sqlite_store().await, "acme").with_exporter(Some(adapter), false);

    let draft = ChangeDraft::new("Tune cache sizes", "Raise cache limits on the web tier");
    let id = wf.submit(&requester(), draft).await.unwrap().correlation_id;
    wf.assess(&requester(), id).await.unwrap();
    wf.approve(&manager(), id, None).await.unwrap();
    wf.start_implementation(&implementer(), id).await.unwrap();
    wf.complete_verification(&implementer(), id, &clean_report()).await.unwrap();
    let change = wf.review(&manager(), id, Some("clean".to_string())).await.unwrap();
    assert_eq!(change.status, ChangeStatus::Reviewed);

    // All six events of the change, ids 1 through 6.
    let batches = archived_batches(&archive.path().join("acme"));
    assert_eq!(batches.len(), 1);
    assert!(file_name(&batches[0]).starts_with("000000000001-000000000006-"));
    let lines = fs::read_to_string(&batches[0]).unwrap();
    assert_eq!(lines.lines().count(), 6);
}

#[tokio::test]
async fn test_offline_workflow_does_not_forward() {
    let archive = TempDir::new().unwrap();
    let adapter: Arc<dyn ExportAdapter> = Arc::new(FileArchiveAdapter::new(archive.path()).unwrap());
    let wf = workflow_on(sqlite_store().await, "acme").with_exporter(Some(adapter), true);

    let draft = ChangeDraft::new("Tune cache sizes", "Raise cache limits on the web tier");
    let id = wf.submit(&requester(), draft).await.unwrap().correlation_id;
    wf.assess(&requester(), id).await.unwrap();
    let change = wf.reject(&manager(), id, "not now").await.unwrap();
    assert_eq!(change.status, ChangeStatus::Rejected);

    assert!(!archive.path().join("acme").exists());
}

#[tokio::test]
async fn test_two_engines_never_record_the_same_transition_twice() {
    let (_dir, store) = setup_file_store().await;
    let store: Arc<dyn AuditEventStore> = Arc::new(store);
    let first = Arc::new(workflow_on(store.clone(), "acme"));
    let second = Arc::new(workflow_on(store.clone(), "acme"));

    for round in 0..10 {
        let draft = ChangeDraft::new(format!("Tune cache sizes #{}", round), "Raise cache limits");
        let id = first.submit(&requester(), draft).await.unwrap().correlation_id;
        first.assess(&requester(), id).await.unwrap();
        second.approve(&manager(), id, None).await.unwrap();

        let racers: Vec<_> = [first.clone(), second.clone()]
            .into_iter()
            .map(|wf| tokio::spawn(async move { wf.start_implementation(&implementer(), id).await }))
            .collect();
        let mut won = 0;
        for racer in racers {
            match racer.await.unwrap() {
                Ok(change) => {
                    assert_eq!(change.status, ChangeStatus::Implementing);
                    won += 1;
                }
                Err(err) => assert!(
                    matches!(
                        err,
                        AuditError::InvalidTransition {
                            from: ChangeStatus::Implementing,
                            to: ChangeStatus::Implementing
                        }
                    ),
                    "round {}: {:?}",
                    round,
                    err
                ),
            }
        }
        assert_eq!(won, 1, "round {}", round);

        for wf in [&first, &second] {
            assert_eq!(wf.load(id).await.unwrap().status, ChangeStatus::Implementing);
        }
        let implementing = first
            .history(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == "change.implementing")
            .count();
        assert_eq!(implementing, 1);
    }
    assert!(store.verify_integrity(&tenant("acme")).await.unwrap());
}
