
use fleet_harness::{Fleet, credential, fast_policy};

use botfactory::FleetError;
use botfactory::core::control::{Capability, CreateWorkerRequest};
use botfactory::core::store::{AgentDescriptor, ConfigPatch, OpenAiSettings, ReadMode};
use botfactory::core::worker::LifecycleState;
use std::time::Duration;

fn agent_only() -> ConfigPatch {
    ConfigPatch {
        agent: Some(AgentDescriptor::OpenAi {
            handle: "helper".into(),
            settings: OpenAiSettings::default(),
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn verified_write_is_visible_to_fresh_reads() {
    let fleet = Fleet::new();
    let id = fleet.create(1, 1, Some(agent_only())).await;

    let outcome = fleet
        .control
        .toggle_capability(1, id, Capability::Ai, true)
        .await
        .unwrap();
    assert!(!outcome.restarted);

    let fresh = fleet.store.read(id, ReadMode::Fresh).await.unwrap();
    assert!(fresh.ai_enabled);
    assert_eq!(fresh.revision, outcome.commit.revision);
    fleet.orchestrator.remove(id).await.unwrap();
}

#[tokio::test]
async fn cached_reads_may_lag_until_a_fresh_read() {
    let fleet = Fleet::build(fast_policy(5), Duration::from_secs(60));
    let id = fleet.create(1, 2, None).await;
    fleet.orchestrator.remove(id).await.unwrap();

    let before = fleet.store.read(id, ReadMode::Cached).await.unwrap();
    let patch = ConfigPatch {
        goodbye_text: Some("Bye!".into()),
        ..Default::default()
    };
    fleet.store.write(id, &patch).await.unwrap();

    let cached = fleet.store.read(id, ReadMode::Cached).await.unwrap();
    assert_eq!(cached, before);

    let fresh = fleet.store.read(id, ReadMode::Fresh).await.unwrap();
    assert_eq!(fresh.goodbye_text, "Bye!");
    let cached = fleet.store.read(id, ReadMode::Cached).await.unwrap();
    assert_eq!(cached, fresh);
}

#[tokio::test]
async fn unconfirmed_write_never_reaches_the_orchestrator() {
    let fleet = Fleet::new();
    let id = fleet.create(1, 3, Some(agent_only())).await;
    let snapshot = fleet.orchestrator.snapshot(id).await.unwrap();

    // Simulates a replica that silently drops the toggle.
    {
        let db = fleet.store.get_db();
        let db = db.lock().await;
        db.execute_batch(
            "CREATE TRIGGER drop_ai_toggle AFTER UPDATE OF ai_enabled ON worker_configs
             WHEN NEW.ai_enabled = 1
             BEGIN
                UPDATE worker_configs SET ai_enabled = 0 WHERE worker_id = NEW.worker_id;
             END;",
        )
        .unwrap();
    }

    let mut transitions = fleet.orchestrator.subscribe_transitions();
    let err = fleet
        .control
        .update_config(
            1,
            id,
            ConfigPatch {
                welcome_text: Some("new welcome".into()),
                ai_enabled: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotConfirmed { .. }), "{err}");
    assert!(err.is_transient());

    assert!(transitions.try_recv().is_err());
    assert_eq!(fleet.orchestrator.snapshot(id).await.unwrap(), snapshot);
    assert_eq!(
        fleet.orchestrator.status(id).await.state,
        LifecycleState::Running
    );
    fleet.orchestrator.remove(id).await.unwrap();
}

#[tokio::test]
async fn invalid_patch_is_rejected_before_commit() {
    let fleet = Fleet::new();
    let id = fleet.create(1, 4, None).await;

    let err = fleet
        .control
        .toggle_capability(1, id, Capability::Ai, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidConfig(_)));

    let err = fleet
        .control
        .toggle_capability(1, id, Capability::SubscriptionGate, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidConfig(_)));

    let err = fleet
        .control
        .update_config(1, id, ConfigPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidConfig(_)));

    let fresh = fleet.store.read(id, ReadMode::Fresh).await.unwrap();
    assert_eq!(fresh.revision, 1);
    assert!(!fresh.ai_enabled);
    fleet.orchestrator.remove(id).await.unwrap();
}

#[tokio::test]
async fn other_owners_cannot_touch_a_worker() {
    let fleet = Fleet::new();
    let id = fleet.create(1, 5, Some(agent_only())).await;

    let err = fleet
        .control
        .toggle_capability(2, id, Capability::Ai, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Forbidden { owner_id: 2, .. }));

    let err = fleet.control.delete_worker(2, id).await.unwrap_err();
    assert!(matches!(err, FleetError::Forbidden { .. }));
    assert!(fleet.orchestrator.is_registered(id).await);

    let fresh = fleet.store.read(id, ReadMode::Fresh).await.unwrap();
    assert!(!fresh.ai_enabled);
    fleet.orchestrator.remove(id).await.unwrap();
}

#[tokio::test]
async fn delete_removes_row_and_instance() {
    let fleet = Fleet::new();
    let id = fleet.create(1, 6, None).await;
    let mut transitions = fleet.orchestrator.subscribe_transitions();

    fleet.control.delete_worker(1, id).await.unwrap();

    assert!(fleet.store.find_worker(id).await.unwrap().is_none());
    assert!(!fleet.orchestrator.is_registered(id).await);
    assert_eq!(fleet.gateway.live_sessions(), 0);

    let mut last = None;
    while let Ok(event) = transitions.try_recv() {
        last = Some(event.to);
    }
    assert_eq!(last, Some(LifecycleState::Deleted));

    let err = fleet.control.delete_worker(1, id).await.unwrap_err();
    assert!(matches!(err, FleetError::WorkerNotFound(_)));
    // Idempotent at the orchestrator level.
    fleet.orchestrator.remove(id).await.unwrap();
}

#[tokio::test]
async fn delete_stops_the_instance_before_the_row_goes() {
    let fleet = Fleet::new();
    let id = fleet.create(1, 7, None).await;
    {
        let db = fleet.store.get_db();
        let db = db.lock().await;
        db.execute_batch(
            "CREATE TABLE delete_audit (worker_id INTEGER, was_running INTEGER, status TEXT);
             CREATE TRIGGER audit_worker_delete BEFORE DELETE ON workers BEGIN
                 INSERT INTO delete_audit VALUES (OLD.id, OLD.is_running, OLD.status);
             END;",
        )
        .unwrap();
    }
    let mut transitions = fleet.orchestrator.subscribe_transitions();

    fleet.control.delete_worker(1, id).await.unwrap();

    let (audited, was_running, status): (i64, bool, String) = {
        let db = fleet.store.get_db();
        let db = db.lock().await;
        db.query_row(
            "SELECT worker_id, was_running, status FROM delete_audit",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap()
    };
    assert_eq!(audited, id);
    assert!(!was_running, "row was deleted while the worker was still running");
    assert_eq!(status, "stopped");

    let mut seen = Vec::new();
    while let Ok(event) = transitions.try_recv() {
        seen.push(event.to);
    }
    assert_eq!(
        seen,
        vec![
            LifecycleState::Stopping,
            LifecycleState::Stopped,
            LifecycleState::Deleted
        ]
    );
    assert_eq!(fleet.gateway.live_sessions(), 0);

    // A deleted id cannot be brought back.
    let err = fleet.orchestrator.add(id).await.unwrap_err();
    assert!(matches!(err, FleetError::WorkerNotFound(_)));
    assert_eq!(
        fleet.orchestrator.status(id).await.state,
        LifecycleState::Deleted
    );
}

#[tokio::test]
async fn create_enforces_credential_rules_and_owner_limit() {
    let fleet = Fleet::new();

    let err = fleet
        .control
        .create_worker(CreateWorkerRequest {
            owner_id: 1,
            credential: "123:short".into(),
            admin_chat_id: None,
            config: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidCredential(_)));

    fleet.gateway.reject(&credential(99));
    let err = fleet
        .control
        .create_worker(CreateWorkerRequest {
            owner_id: 1,
            credential: credential(99),
            admin_chat_id: None,
            config: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidCredential(_)));

    let first = fleet.create(1, 10, None).await;
    let err = fleet
        .control
        .create_worker(CreateWorkerRequest {
            owner_id: 1,
            credential: credential(10),
            admin_chat_id: None,
            config: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidConfig(_)));

    fleet.create(1, 11, None).await;
    fleet.create(1, 12, None).await;
    let err = fleet
        .control
        .create_worker(CreateWorkerRequest {
            owner_id: 1,
            credential: credential(13),
            admin_chat_id: None,
            config: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FleetError::WorkerLimitReached { owner_id: 1, limit: 3 }
    ));

    let listed = fleet.control.list_workers(Some(1)).await.unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0].id, first);
    fleet.orchestrator.shutdown().await;
}

#[tokio::test]
async fn stop_and_start_through_the_control_plane() {
    let fleet = Fleet::new();
    let id = fleet.create(1, 20, None).await;

    let stopped = fleet.control.stop_worker(1, id).await.unwrap();
    assert_eq!(stopped.state, LifecycleState::Stopped);
    let report = fleet.orchestrator.reconcile().await.unwrap();
    assert!(report.started.is_empty());

    let started = fleet.control.start_worker(1, id).await.unwrap();
    assert_eq!(started.state, LifecycleState::Running);
    let view = fleet.control.worker_status(1, id).await.unwrap();
    assert!(view.worker.is_running);
    assert_eq!(view.runtime.state, LifecycleState::Running);
    fleet.orchestrator.remove(id).await.unwrap();
}
