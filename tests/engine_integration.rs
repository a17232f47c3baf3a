//! Integration tests for the update engine
//!
//! These drive the whole engine through its public surface with a scripted
//! gateway standing in for the remote agents.

mod support;

use confsync::{
    CompletionReport, Configuration, EngineConfig, Property, StaticDirectory, StaticPermissions,
    UpdateEngine, UpdateError, UpdateKind, UpdateOutcome, UpdateStatus,
};
use confsync::{AllowAllPermissions, MemberDisposition};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use support::{config, init_tracing, wait_until, ScriptedGateway};

fn engine_with(
    gateway: Arc<ScriptedGateway>,
    directory: StaticDirectory,
) -> UpdateEngine {
    init_tracing();
    UpdateEngine::new(
        EngineConfig::default(),
        gateway,
        Arc::new(AllowAllPermissions),
        Arc::new(directory),
    )
}

/// Fresh target, in-progress admission, success round trip
#[tokio::test]
async fn test_single_target_update_round_trip() {
    let gateway = Arc::new(ScriptedGateway::new());
    let engine = engine_with(
        Arc::clone(&gateway),
        StaticDirectory::new().with_target("web-01"),
    );

    assert!(engine.latest("web-01").await.is_none());

    let outcome = engine
        .request_update("web-01", config(&[("x", "1")]), "alice", UpdateKind::Resource)
        .await
        .unwrap();
    let record_id = outcome.record().id;

    assert!(engine.is_in_progress("web-01").await);

    // A concurrent request against the same target is rejected, not queued
    let err = engine
        .request_update("web-01", config(&[("x", "2")]), "alice", UpdateKind::Resource)
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::UpdateInProgress { .. }));

    // The agent confirms the applied value
    gateway.wait_for_pushes(1, Duration::from_secs(5)).await;
    engine
        .complete_update(CompletionReport::success(record_id, config(&[("x", "1")])))
        .await
        .unwrap();

    assert!(!engine.is_in_progress("web-01").await);
    let latest = engine.latest("web-01").await.unwrap();
    assert_eq!(latest.status, UpdateStatus::Success);
    assert_eq!(latest.configuration, config(&[("x", "1")]));

    engine.shutdown();
}

/// Purging the sole record never leaves the target without history
#[tokio::test]
async fn test_purge_sole_record_keeps_history_derivable() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_live("web-01", config(&[("x", "live")]));
    let engine = engine_with(
        Arc::clone(&gateway),
        StaticDirectory::new().with_target("web-01"),
    );

    let outcome = engine
        .request_update("web-01", config(&[("x", "1")]), "alice", UpdateKind::Resource)
        .await
        .unwrap();
    let record_id = outcome.record().id;
    engine
        .complete_update(CompletionReport::success(record_id, config(&[("x", "1")])))
        .await
        .unwrap();

    engine.purge(record_id, false, "alice").await.unwrap();

    // The purged record is gone, but a baseline took its place
    assert!(engine.record(record_id).await.is_none());
    let latest = engine.latest("web-01").await.expect("history must survive purge");
    assert_eq!(latest.configuration, config(&[("x", "live")]));
    assert_eq!(latest.status, UpdateStatus::Success);

    engine.shutdown();
}

/// One member fails validation; the group fails while the others keep SUCCESS
#[tokio::test]
async fn test_group_update_with_one_validation_failure() {
    let gateway = Arc::new(ScriptedGateway::new());
    let engine = engine_with(
        Arc::clone(&gateway),
        StaticDirectory::new().with_group("db-cluster", ["db-01", "db-02", "db-03"]),
    );

    let mut member_configurations = HashMap::new();
    for member in ["db-01", "db-02", "db-03"] {
        member_configurations.insert(member.to_string(), config(&[("p", "v")]));
    }

    let group_id = engine
        .request_group_update("db-cluster", &member_configurations, "alice", UpdateKind::Resource)
        .await
        .unwrap();
    assert_eq!(
        engine.group_update(group_id).unwrap().status,
        UpdateStatus::InProgress
    );

    let pushes = gateway.wait_for_pushes(3, Duration::from_secs(5)).await;
    for (target, correlation_id) in pushes {
        let report = if target == "db-02" {
            // The agent rejected property p
            let mut annotated = Configuration::new();
            annotated.put("p", Property::scalar_with_error("v", "value out of range"));
            CompletionReport::success(correlation_id, annotated)
        } else {
            CompletionReport::success(correlation_id, config(&[("p", "v")]))
        };
        engine.complete_update(report).await.unwrap();
    }

    let status = engine
        .wait_for_group_update(group_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, UpdateStatus::Failure);

    let group = engine.group_update(group_id).unwrap();
    assert!(group.error.unwrap().contains("db-02"));

    // Member outcomes stay individual: sticky failure is group-level only
    for member in ["db-01", "db-03"] {
        assert_eq!(
            engine.latest(member).await.unwrap().status,
            UpdateStatus::Success
        );
    }
    let failed = engine.latest("db-02").await.unwrap();
    assert_eq!(failed.status, UpdateStatus::Failure);
    assert!(failed
        .configuration
        .get("p")
        .unwrap()
        .error
        .as_deref()
        .is_some());

    // The consumed terminal group record can be dropped from the tracker
    assert!(engine.purge_group_update(group_id));
    assert!(engine.group_update(group_id).is_none());

    engine.shutdown();
}

/// Large fan-out converges to a single terminal aggregate
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_member_fan_out_converges() {
    let members: Vec<String> = (0..1000).map(|i| format!("node-{:04}", i)).collect();
    let gateway = Arc::new(ScriptedGateway::new());
    let engine = Arc::new(engine_with(
        Arc::clone(&gateway),
        StaticDirectory::new().with_group("fleet", members.clone()),
    ));

    let mut member_configurations = HashMap::new();
    for member in &members {
        member_configurations.insert(member.clone(), config(&[("x", "1")]));
    }

    let group_id = engine
        .request_group_update("fleet", &member_configurations, "alice", UpdateKind::Resource)
        .await
        .unwrap();

    // All member callbacks arrive concurrently within a bounded window
    let pushes = gateway.wait_for_pushes(1000, Duration::from_secs(30)).await;
    let mut callbacks = Vec::with_capacity(pushes.len());
    for (_, correlation_id) in pushes {
        let engine = Arc::clone(&engine);
        callbacks.push(tokio::spawn(async move {
            engine
                .complete_update(CompletionReport::success(
                    correlation_id,
                    config(&[("x", "1")]),
                ))
                .await
                .unwrap();
        }));
    }
    for callback in callbacks {
        callback.await.unwrap();
    }

    let status = engine
        .wait_for_group_update(group_id, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(status, UpdateStatus::Success);

    // No torn aggregate after the last callback: repeated reads agree
    let group = engine.group_update(group_id).unwrap();
    assert_eq!(group.status, UpdateStatus::Success);
    assert_eq!(group.members.len(), 1000);

    engine.shutdown();
}

#[tokio::test]
async fn test_group_permission_failure_is_atomic() {
    init_tracing();
    let gateway = Arc::new(ScriptedGateway::new());
    let engine = UpdateEngine::new(
        EngineConfig::default(),
        gateway.clone(),
        Arc::new(StaticPermissions::new().deny("mallory", "db-cluster")),
        Arc::new(StaticDirectory::new().with_group("db-cluster", ["db-01", "db-02"])),
    );

    let mut member_configurations = HashMap::new();
    member_configurations.insert("db-01".to_string(), config(&[("x", "1")]));
    member_configurations.insert("db-02".to_string(), config(&[("x", "1")]));

    let err = engine
        .request_group_update("db-cluster", &member_configurations, "mallory", UpdateKind::Resource)
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::PermissionDenied { .. }));

    // Permission failure precedes any dispatch: no member was touched
    assert!(gateway.pushes().is_empty());
    assert!(engine.latest("db-01").await.is_none());
    assert!(engine.latest("db-02").await.is_none());

    engine.shutdown();
}

#[tokio::test]
async fn test_group_skips_member_with_update_in_flight() {
    let gateway = Arc::new(ScriptedGateway::new());
    let engine = engine_with(
        Arc::clone(&gateway),
        StaticDirectory::new().with_group("db-cluster", ["db-01", "db-02"]),
    );

    // db-01 is mid-update from a direct request
    let direct = engine
        .request_update("db-01", config(&[("x", "direct")]), "bob", UpdateKind::Resource)
        .await
        .unwrap();

    let mut member_configurations = HashMap::new();
    member_configurations.insert("db-01".to_string(), config(&[("x", "group")]));
    member_configurations.insert("db-02".to_string(), config(&[("x", "group")]));

    let group_id = engine
        .request_group_update("db-cluster", &member_configurations, "alice", UpdateKind::Resource)
        .await
        .unwrap();

    let group = engine.group_update(group_id).unwrap();
    assert_eq!(
        group.members.get("db-01"),
        Some(&MemberDisposition::SkippedInProgress)
    );

    // Only db-02 was dispatched for the group; the skipped member does not
    // hold the aggregate open
    let pushes = gateway.wait_for_pushes(2, Duration::from_secs(5)).await;
    let group_push = pushes
        .iter()
        .find(|(target, id)| target.as_str() == "db-02" && *id != direct.record().id)
        .unwrap();
    engine
        .complete_update(CompletionReport::success(
            group_push.1,
            config(&[("x", "group")]),
        ))
        .await
        .unwrap();

    let status = engine
        .wait_for_group_update(group_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, UpdateStatus::Success);

    // The direct update is still in flight and untouched by the group result
    assert!(engine.is_in_progress("db-01").await);

    engine.shutdown();
}

#[tokio::test]
async fn test_unreachable_member_fails_group_without_callback() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_unreachable("db-02");
    let engine = engine_with(
        Arc::clone(&gateway),
        StaticDirectory::new().with_group("db-cluster", ["db-01", "db-02"]),
    );

    let mut member_configurations = HashMap::new();
    member_configurations.insert("db-01".to_string(), config(&[("x", "1")]));
    member_configurations.insert("db-02".to_string(), config(&[("x", "1")]));

    let group_id = engine
        .request_group_update("db-cluster", &member_configurations, "alice", UpdateKind::Resource)
        .await
        .unwrap();

    // db-01 made it onto the wire; db-02's dispatch failed and self-finalized
    let pushes = gateway.wait_for_pushes(1, Duration::from_secs(5)).await;
    assert_eq!(pushes[0].0, "db-01");
    engine
        .complete_update(CompletionReport::success(pushes[0].1, config(&[("x", "1")])))
        .await
        .unwrap();

    let status = engine
        .wait_for_group_update(group_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, UpdateStatus::Failure);

    let failed = engine.latest("db-02").await.unwrap();
    assert_eq!(failed.status, UpdateStatus::Failure);
    assert!(failed.error.unwrap().contains("communicate"));

    engine.shutdown();
}

#[tokio::test]
async fn test_sweeper_times_out_wedged_target() {
    init_tracing();
    let gateway = Arc::new(ScriptedGateway::new());
    let engine = UpdateEngine::new(
        EngineConfig {
            in_progress_timeout_secs: 0,
            sweep_interval_secs: 1,
            ..EngineConfig::default()
        },
        gateway.clone(),
        Arc::new(AllowAllPermissions),
        Arc::new(StaticDirectory::new().with_target("web-01")),
    );

    // The agent accepts the push but never calls back
    let outcome = engine
        .request_update("web-01", config(&[("x", "1")]), "alice", UpdateKind::Resource)
        .await
        .unwrap();
    let record_id = outcome.record().id;
    gateway.wait_for_pushes(1, Duration::from_secs(5)).await;

    wait_until(Duration::from_secs(10), || async {
        !engine.is_in_progress("web-01").await
    })
    .await;

    let record = engine.record(record_id).await.unwrap();
    assert_eq!(record.status, UpdateStatus::Failure);
    assert!(record.error.unwrap().contains("timed out"));

    // The wedged target accepts updates again
    engine
        .request_update("web-01", config(&[("x", "2")]), "alice", UpdateKind::Resource)
        .await
        .unwrap();

    engine.shutdown();
}

#[tokio::test]
async fn test_get_live_and_rollback() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_live("web-01", config(&[("x", "factory")]));
    let engine = engine_with(
        Arc::clone(&gateway),
        StaticDirectory::new().with_target("web-01"),
    );

    // First read materializes the baseline
    let live = engine
        .get_live("web-01", false, UpdateKind::Resource)
        .await
        .unwrap();
    assert_eq!(live, config(&[("x", "factory")]));
    let baseline_id = engine.latest("web-01").await.unwrap().id;

    // Apply a new value
    let outcome = engine
        .request_update("web-01", config(&[("x", "tuned")]), "alice", UpdateKind::Resource)
        .await
        .unwrap();
    engine
        .complete_update(CompletionReport::success(
            outcome.record().id,
            config(&[("x", "tuned")]),
        ))
        .await
        .unwrap();
    assert_eq!(
        engine.get_live("web-01", false, UpdateKind::Resource).await.unwrap(),
        config(&[("x", "tuned")])
    );

    // Roll back to the baseline snapshot
    let rollback = engine
        .rollback("web-01", baseline_id, "alice")
        .await
        .unwrap();
    assert!(matches!(rollback, UpdateOutcome::Accepted(_)));
    engine
        .complete_update(CompletionReport::success(
            rollback.record().id,
            config(&[("x", "factory")]),
        ))
        .await
        .unwrap();

    let latest = engine.latest("web-01").await.unwrap();
    assert_eq!(latest.configuration, config(&[("x", "factory")]));

    engine.shutdown();
}

#[tokio::test]
async fn test_history_query_by_target_and_status() {
    let gateway = Arc::new(ScriptedGateway::new());
    let engine = engine_with(
        Arc::clone(&gateway),
        StaticDirectory::new().with_target("web-01").with_target("web-02"),
    );

    for (target, value, ok) in [("web-01", "1", true), ("web-01", "2", false), ("web-02", "1", true)] {
        let outcome = engine
            .request_update(target, config(&[("x", value)]), "alice", UpdateKind::Resource)
            .await
            .unwrap();
        let report = if ok {
            CompletionReport::success(outcome.record().id, config(&[("x", value)]))
        } else {
            CompletionReport::failure(outcome.record().id, None, "agent said no")
        };
        engine.complete_update(report).await.unwrap();
    }

    let page = engine
        .history(&confsync::HistoryCriteria::for_target("web-01"))
        .await;
    assert_eq!(page.total, 2);
    // Newest first
    assert_eq!(page.items[0].status, UpdateStatus::Failure);

    let failures = engine
        .history(&confsync::HistoryCriteria {
            status: Some(UpdateStatus::Failure),
            ..Default::default()
        })
        .await;
    assert_eq!(failures.total, 1);
    assert_eq!(failures.items[0].target, "web-01");

    engine.shutdown();
}
