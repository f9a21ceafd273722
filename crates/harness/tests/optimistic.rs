use pantry_core::{CollectionKey, EntityId, Mutation, MutationKind, Patch};
use pantry_engine::{MutationError, MutationStatus, Phase};
use pantry_harness::{Fault, RemoteOp, TestApp, init_tracing};

fn qty(app: &TestApp, collection: &CollectionKey, id: &str) -> Option<String> {
    app.entity(collection, id)
        .and_then(|e| e.text("qty").map(str::to_string))
}

fn ids(app: &TestApp, collection: &CollectionKey) -> Vec<String> {
    app.snapshot(collection)
        .ids()
        .into_iter()
        .map(EntityId::into_string)
        .collect()
}

// ============================================================================
// Apply and roll back
// ============================================================================

#[tokio::test]
async fn update_is_visible_before_the_remote_answers() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1")]);
    app.open()?;
    let items = app.items();

    app.remote.pause();
    let handle = app.engine.apply(Mutation::update(
        &items,
        &EntityId::new("a"),
        Patch::new().set("qty", "2").touched(),
    ))?;
    assert_eq!(qty(&app, &items, "a").as_deref(), Some("2"));
    assert_eq!(app.engine.executor().in_flight_count(), 1);
    assert_eq!(
        app.engine.executor().status(&handle.mutation_id()),
        Some(MutationStatus::InFlight)
    );

    app.remote.resume();
    let id = handle.mutation_id();
    let committed = handle.outcome().await?;
    assert_eq!(committed.kind, MutationKind::Update);
    assert_eq!(committed.attempts, 1);
    assert_eq!(
        app.engine.executor().status(&id),
        Some(MutationStatus::Committed)
    );
    assert_eq!(app.engine.executor().in_flight_count(), 0);

    let doc = app.remote.document(&items, &EntityId::new("a")).ok_or("missing doc")?;
    assert_eq!(doc.text("qty"), Some("2"));
    Ok(())
}

#[tokio::test]
async fn failed_update_restores_exact_snapshot() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1"), ("b", "Eggs", "6")]);
    app.open()?;
    let items = app.items();
    let before = app.snapshot(&items);

    app.remote
        .fail_next(Fault::on(RemoteOp::Write).entity(&EntityId::new("a")));
    let handle = app.engine.apply(Mutation::update(
        &items,
        &EntityId::new("a"),
        Patch::new().set("qty", "2").touched(),
    ))?;
    assert_eq!(qty(&app, &items, "a").as_deref(), Some("2"));

    let err = handle.outcome().await.unwrap_err();
    assert!(matches!(
        err,
        MutationError::Write {
            kind: MutationKind::Update,
            ..
        }
    ));
    assert_eq!(app.snapshot(&items), before);
    Ok(())
}

#[tokio::test]
async fn failed_delete_restores_entity_at_its_position() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1"), ("b", "Eggs", "6"), ("c", "Salt", "1")]);
    app.open()?;
    let items = app.items();

    app.remote
        .fail_next(Fault::on(RemoteOp::Remove).entity(&EntityId::new("b")));
    let handle = app
        .engine
        .apply(Mutation::delete(&items, &EntityId::new("b")))?;
    assert_eq!(ids(&app, &items), vec!["a", "c"]);

    assert!(handle.outcome().await.is_err());
    assert_eq!(ids(&app, &items), vec!["a", "b", "c"]);
    assert_eq!(app.remote.documents(&items).len(), 3);
    Ok(())
}

#[tokio::test]
async fn failed_delete_restores_the_entity_it_removed() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1"), ("b", "Eggs", "6"), ("c", "Salt", "1")]);
    app.open()?;
    let items = app.items();
    let b = EntityId::new("b");

    app.remote.pause();
    let update = app
        .engine
        .apply(Mutation::update(&items, &b, Patch::new().set("qty", "2")))?;
    app.remote.fail_next(Fault::on(RemoteOp::Remove).entity(&b));
    let delete = app.engine.apply(Mutation::delete(&items, &b))?;

    // The delete captured the entity with the in-flight update applied.
    let pending = app
        .engine
        .executor()
        .in_flight()
        .into_iter()
        .find(|p| p.mutation_id == delete.mutation_id())
        .ok_or("delete not in flight")?;
    let captured = pending.captures[0].previous.as_ref().ok_or("nothing captured")?;
    assert_eq!(captured.text("qty"), Some("2"));
    assert_eq!(pending.captures[0].position, Some(1));

    app.remote.resume();
    update.outcome().await?;
    assert!(delete.outcome().await.is_err());

    assert_eq!(ids(&app, &items), vec!["a", "b", "c"]);
    assert_eq!(app.engine.store().position_of(&items, &b), Some(1));
    assert_eq!(qty(&app, &items, "b").as_deref(), Some("2"));
    Ok(())
}

#[tokio::test]
async fn failed_create_drops_the_staged_entity() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1")]);
    app.open()?;
    let items = app.items();

    app.remote.fail_next(Fault::on(RemoteOp::Create));
    let handle = app
        .engine
        .apply(Mutation::create(&items, Patch::new().set("name", "Bread")))?;
    let temporary = handle.temporary_id().cloned().ok_or("no temporary id")?;
    assert!(temporary.is_temporary());
    assert_eq!(app.snapshot(&items).position(&temporary), Some(0));

    assert!(handle.outcome().await.is_err());
    assert_eq!(ids(&app, &items), vec!["a"]);
    assert!(
        app.notifier
            .messages()
            .contains(&"Add failed. Reverted.".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn create_swaps_temporary_id_for_permanent() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.open()?;
    let items = app.items();

    let committed = app
        .engine
        .execute(Mutation::create(&items, Patch::new().set("name", "Bread")))
        .await?;
    let permanent = committed.entity_id.ok_or("no permanent id")?;
    assert!(!permanent.is_temporary());

    let snapshot = app.snapshot(&items);
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.contains(&permanent));
    assert!(snapshot.ids().iter().all(|id| !id.is_temporary()));
    Ok(())
}

#[tokio::test]
async fn validation_failure_stages_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1")]);
    app.open()?;
    app.frame();
    let items = app.items();
    let before = app.snapshot(&items);

    let err = app
        .engine
        .apply(Mutation::update(&items, &EntityId::new("a"), Patch::new()))
        .err()
        .ok_or("empty patch accepted")?;
    assert!(err.is_validation());
    assert_eq!(app.snapshot(&items), before);
    assert!(!app.engine.scheduler().has_pending());
    assert_eq!(app.engine.executor().in_flight_count(), 0);
    assert_eq!(app.notifier.count(MutationKind::Update, Phase::Rejected), 1);
    assert!(app.remote.commit_log().is_empty());
    Ok(())
}

// ============================================================================
// Concurrent mutations on one entity
// ============================================================================

#[tokio::test]
async fn failed_update_never_resurrects_a_deleted_entity() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1"), ("b", "Eggs", "6")]);
    app.open()?;
    let items = app.items();
    let a = EntityId::new("a");

    app.remote.pause();
    app.remote.fail_next(Fault::on(RemoteOp::Write).entity(&a));
    let update = app.engine.apply(Mutation::update(
        &items,
        &a,
        Patch::new().set("qty", "3").touched(),
    ))?;
    let delete = app.engine.apply(Mutation::delete(&items, &a))?;
    assert_eq!(ids(&app, &items), vec!["b"]);

    app.remote.resume();
    assert!(update.outcome().await.is_err());
    delete.outcome().await?;

    assert_eq!(ids(&app, &items), vec!["b"]);
    assert!(app.remote.document(&items, &a).is_none());
    assert_eq!(app.engine.executor().in_flight_count(), 0);
    Ok(())
}

#[tokio::test]
async fn remote_snapshot_replaces_optimistic_state() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1")]);
    app.open()?;
    let items = app.items();

    app.remote.pause();
    let handle = app.engine.apply(Mutation::update(
        &items,
        &EntityId::new("a"),
        Patch::new().set("qty", "9").touched(),
    ))?;
    // Another device rewrites the list while our write is held.
    app.seed_items(&[("a", "Milk", "4"), ("z", "Tea", "1")]);
    assert_eq!(qty(&app, &items, "a").as_deref(), Some("4"));
    assert_eq!(ids(&app, &items), vec!["a", "z"]);

    app.remote.resume();
    handle.outcome().await?;
    assert_eq!(qty(&app, &items, "a").as_deref(), Some("9"));
    Ok(())
}

// ============================================================================
// Notices
// ============================================================================

#[tokio::test]
async fn each_phase_is_announced_once() -> Result<(), Box<dyn std::error::Error>> {
    let app = TestApp::new()?;
    app.seed_items(&[("a", "Milk", "1")]);
    app.open()?;
    let items = app.items();

    app.engine
        .execute(Mutation::update(
            &items,
            &EntityId::new("a"),
            Patch::new().set("qty", "2"),
        ))
        .await?;
    assert_eq!(app.notifier.messages(), vec!["Saving…", "Saved"]);

    app.notifier.clear();
    app.remote.fail_next(Fault::on(RemoteOp::Remove));
    let _ = app
        .engine
        .execute(Mutation::delete(&items, &EntityId::new("a")))
        .await;
    assert_eq!(app.notifier.messages(), vec!["Deleting…", "Delete failed. Restored."]);
    assert_eq!(app.notifier.terminal().len(), 1);
    Ok(())
}
