use std::time::Duration;

use pantry_core::{BatchOp, EntityId, Mutation, MutationKind, Patch};
use pantry_engine::{EngineConfig, MutationError, Phase, RetryPolicy, SubscribeOutcome, WritePolicy};
use pantry_harness::{CommitRecord, Fault, RemoteOp, TestApp, UID, init_tracing};

fn bulk_ops(app: &TestApp, count: usize) -> Vec<BatchOp> {
    let items = app.items();
    (0..count)
        .map(|i| {
            BatchOp::set(
                &items,
                &EntityId::new(format!("bulk-{i:04}")),
                Patch::new().set("name", format!("Item {i}")).set("qty", "1"),
            )
        })
        .collect()
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn subscribing_twice_keeps_one_listener() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    let items = app.items();
    app.open()?;
    app.open()?;
    assert_eq!(app.remote.listener_count(&items), 1);
    assert_eq!(
        app.engine.subscribe(UID, &items)?,
        SubscribeOutcome::AlreadySubscribed
    );
    assert_eq!(app.engine.sync().subscriptions().len(), 3);
    Ok(())
}

#[tokio::test]
async fn new_uid_replaces_the_listener() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    let items = app.items();
    app.open()?;

    assert_eq!(
        app.engine.subscribe("user-2", &items)?,
        SubscribeOutcome::Resubscribed
    );
    assert_eq!(app.remote.listener_count(&items), 1);
    let owner = app
        .engine
        .sync()
        .subscriptions()
        .into_iter()
        .find(|s| s.collection == items)
        .ok_or("missing subscription")?;
    assert_eq!(owner.uid, "user-2");
    Ok(())
}

#[tokio::test]
async fn unsubscribe_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    let items = app.items();
    app.open()?;

    assert!(app.engine.sync().unsubscribe(&items));
    assert!(!app.engine.sync().unsubscribe(&items));
    assert_eq!(app.remote.listener_count(&items), 0);

    assert_eq!(app.engine.close(), 2);
    assert_eq!(app.engine.close(), 0);
    assert_eq!(app.remote.listener_count(&app.recipes()), 0);
    Ok(())
}

#[tokio::test]
async fn closed_listener_ignores_remote_changes() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1")]);
    app.open()?;
    app.engine.close();

    app.seed_items(&[("b", "Eggs", "6")]);
    let snapshot = app.snapshot(&app.items());
    assert!(snapshot.contains(&EntityId::new("a")));
    assert!(!snapshot.contains(&EntityId::new("b")));
    Ok(())
}

// ============================================================================
// Chunked batches
// ============================================================================

#[tokio::test]
async fn large_batch_is_split_into_chunks() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.open()?;
    let ops = bulk_ops(&app, 1200);

    let committed = app.engine.execute(Mutation::batch(ops)).await?;
    assert_eq!(committed.kind, MutationKind::Batch);
    let chunks: Vec<CommitRecord> = app.remote.commit_log();
    assert_eq!(
        chunks,
        vec![
            CommitRecord::Batch { ops: 500 },
            CommitRecord::Batch { ops: 500 },
            CommitRecord::Batch { ops: 200 },
        ]
    );
    assert_eq!(app.remote.documents(&app.items()).len(), 1200);
    assert_eq!(app.snapshot(&app.items()).len(), 1200);
    Ok(())
}

#[tokio::test]
async fn failed_chunk_keeps_earlier_chunks() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let app = TestApp::new()?;
    app.open()?;
    let items = app.items();
    let ops = bulk_ops(&app, 1200);

    app.remote.fail_next(Fault::on(RemoteOp::Batch).chunk(2));
    let err = app.engine.execute(Mutation::batch(ops)).await.unwrap_err();
    match err {
        MutationError::Write { committed_ops, .. } => assert_eq!(committed_ops, 500),
        other => return Err(format!("unexpected error: {other}").into()),
    }

    assert_eq!(app.remote.documents(&items).len(), 500);
    let snapshot = app.snapshot(&items);
    assert_eq!(snapshot.len(), 500);
    assert!(snapshot.contains(&EntityId::new("bulk-0499")));
    assert!(!snapshot.contains(&EntityId::new("bulk-0500")));
    Ok(())
}

#[tokio::test]
async fn custom_batch_limit_is_honoured() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig {
        batch_limit: 2,
        ..EngineConfig::default()
    };
    let app = TestApp::with_config(config)?;
    let ops = bulk_ops(&app, 5);

    app.engine.execute(Mutation::batch(ops)).await?;
    assert_eq!(app.remote.batch_commits(), 3);
    Ok(())
}

// ============================================================================
// Retries
// ============================================================================

fn retrying(max_attempts: u32) -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts,
            backoff_ms: 10,
            jitter_ms: 0,
        },
        ..EngineConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::with_config(retrying(3))?;
    app.seed_items(&[("a", "Milk", "1")]);
    app.open()?;

    app.remote.fail_next(Fault::on(RemoteOp::Write));
    let committed = app
        .engine
        .execute(Mutation::update(
            &app.items(),
            &EntityId::new("a"),
            Patch::new().set("qty", "2"),
        ))
        .await?;
    assert_eq!(committed.attempts, 2);
    assert_eq!(app.notifier.terminal().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retried_batch_resumes_after_committed_chunks() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::with_config(retrying(2))?;
    app.open()?;
    let ops = bulk_ops(&app, 1200);

    app.remote.fail_next(Fault::on(RemoteOp::Batch).chunk(2));
    app.engine.execute(Mutation::batch(ops)).await?;
    // 500 committed, one failed attempt, then the remaining 700 as 500 + 200.
    assert_eq!(app.remote.batch_commits(), 4);
    assert_eq!(app.remote.documents(&app.items()).len(), 1200);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retries_give_up_and_roll_back() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::with_config(retrying(2))?;
    app.seed_items(&[("a", "Milk", "1")]);
    app.open()?;
    let items = app.items();
    let before = app.snapshot(&items);

    app.remote.fail_next(Fault::on(RemoteOp::Write));
    app.remote.fail_next(Fault::on(RemoteOp::Write));
    let result = app
        .engine
        .execute(Mutation::update(&items, &EntityId::new("a"), Patch::new().set("qty", "2")))
        .await;
    assert!(result.is_err());
    assert_eq!(app.snapshot(&items), before);
    Ok(())
}

// ============================================================================
// Write ordering
// ============================================================================

#[tokio::test]
async fn fifo_policy_sends_writes_in_apply_order() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig {
        write_policy: WritePolicy::PerEntityFifo,
        ..EngineConfig::default()
    };
    let app = TestApp::with_config(config)?;
    app.seed_items(&[("a", "Milk", "1")]);
    app.open()?;
    let items = app.items();
    let a = EntityId::new("a");

    app.remote.pause();
    let first = app
        .engine
        .apply(Mutation::update(&items, &a, Patch::new().set("qty", "2")))?;
    let second = app
        .engine
        .apply(Mutation::update(&items, &a, Patch::new().set("qty", "3")))?;
    assert_eq!(app.engine.executor().in_flight_for(&items, &a), 2);

    app.remote.resume();
    second.outcome().await?;
    first.outcome().await?;

    let doc = app.remote.document(&items, &a).ok_or("missing doc")?;
    assert_eq!(doc.text("qty"), Some("3"));
    Ok(())
}

#[tokio::test]
async fn fifo_write_to_temporary_id_reaches_created_document() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig {
        write_policy: WritePolicy::PerEntityFifo,
        ..EngineConfig::default()
    };
    let app = TestApp::with_config(config)?;
    app.open()?;
    let items = app.items();

    app.remote.pause();
    let create = app
        .engine
        .apply(Mutation::create(&items, Patch::new().set("name", "Bread").set("qty", "1")))?;
    let temporary = create.temporary_id().cloned().ok_or("no temporary id")?;
    let update = app
        .engine
        .apply(Mutation::update(&items, &temporary, Patch::new().set("qty", "2")))?;

    app.remote.resume();
    let permanent = create.outcome().await?.entity_id.ok_or("no permanent id")?;
    update.outcome().await?;

    let doc = app.remote.document(&items, &permanent).ok_or("missing doc")?;
    assert_eq!(doc.text("qty"), Some("2"));
    assert_eq!(app.remote.documents(&items).len(), 1);
    Ok(())
}

#[tokio::test]
async fn parallel_write_to_temporary_id_waits_for_its_create() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    assert_eq!(app.engine.executor().write_policy(), WritePolicy::Parallel);
    app.open()?;
    let items = app.items();

    app.remote.pause();
    let create = app
        .engine
        .apply(Mutation::create(&items, Patch::new().set("name", "Milk").set("qty", "1")))?;
    let temporary = create.temporary_id().cloned().ok_or("no temporary id")?;
    let update = app
        .engine
        .apply(Mutation::update(&items, &temporary, Patch::new().set("checked", true)))?;

    app.remote.resume();
    let permanent = create.outcome().await?.entity_id.ok_or("no permanent id")?;
    update.outcome().await?;

    let doc = app.remote.document(&items, &permanent).ok_or("missing doc")?;
    assert!(doc.flag("checked"));
    assert_eq!(app.remote.documents(&items).len(), 1);
    assert!(app.notifier.terminal().iter().all(|n| n.phase == Phase::Succeeded));
    Ok(())
}

// ============================================================================
// Render scheduling
// ============================================================================

#[tokio::test]
async fn updates_within_a_frame_render_once() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1")]);
    app.open()?;
    app.frame();
    app.renderer.clear();
    let items = app.items();
    let a = EntityId::new("a");

    for qty in ["2", "3", "4"] {
        app.engine
            .apply(Mutation::update(&items, &a, Patch::new().set("qty", qty)))?;
    }
    assert_eq!(app.frame(), 1);

    let renders = app.renderer.renders_for(&items);
    assert_eq!(renders.len(), 1);
    assert_eq!(renders[0].get(&a).and_then(|e| e.text("qty")), Some("4"));
    assert_eq!(app.frame(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn frame_driver_paints_scheduled_snapshots() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1")]);
    let driver = app.engine.spawn_frame_driver();
    app.open()?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(app.renderer.last(&app.items()).is_some_and(|s| s.len() == 1));
    assert!(!app.engine.scheduler().has_pending());

    driver.stop();
    Ok(())
}
