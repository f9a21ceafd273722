use std::sync::Arc;

use pantry_core::{CollectionKey, Entity, EntityId, ManualClock, Snapshot};
use pantry_engine::shopping::name_key;
use pantry_engine::{Engine, EngineConfig, EngineError, ShoppingList};
use pantry_storage::SqliteSnapshotCache;

use crate::memory_remote::MemoryRemote;
use crate::recorder::{RecordingNotifier, RecordingRenderer};

pub const HOUSEHOLD: &str = "hh-test";
pub const UID: &str = "user-1";
pub const START_MS: i64 = 1_700_000_000_000;

/// One client wired to an in-memory remote, with every side effect recorded.
pub struct TestApp {
    pub remote: MemoryRemote,
    pub renderer: Arc<RecordingRenderer>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub engine: Arc<Engine>,
}

impl TestApp {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        Self::build(MemoryRemote::new(), config, None)
    }

    /// Another client of the same remote, e.g. a second device or a restart.
    pub fn connect(
        remote: &MemoryRemote,
        config: EngineConfig,
        cache: Option<SqliteSnapshotCache>,
    ) -> Result<Self, EngineError> {
        Self::build(remote.clone(), config, cache)
    }

    fn build(
        remote: MemoryRemote,
        config: EngineConfig,
        cache: Option<SqliteSnapshotCache>,
    ) -> Result<Self, EngineError> {
        let renderer = Arc::new(RecordingRenderer::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(START_MS));

        let mut builder = Engine::builder(Arc::new(remote.clone()), renderer.clone())
            .config(config)
            .notifier(notifier.clone())
            .clock(clock.clone());
        if let Some(cache) = cache {
            builder = builder.cache(cache);
        }
        Ok(Self {
            remote,
            renderer,
            notifier,
            clock,
            engine: Arc::new(builder.build()?),
        })
    }

    pub fn shopping(&self) -> ShoppingList {
        self.engine.shopping(HOUSEHOLD)
    }

    pub fn items(&self) -> CollectionKey {
        CollectionKey::items(HOUSEHOLD)
    }

    pub fn weekly(&self) -> CollectionKey {
        CollectionKey::weekly(HOUSEHOLD)
    }

    pub fn recipes(&self) -> CollectionKey {
        CollectionKey::recipes(HOUSEHOLD)
    }

    /// Sign in and listen to the test household.
    pub fn open(&self) -> Result<(), EngineError> {
        self.engine.open_household(UID, HOUSEHOLD)
    }

    pub fn snapshot(&self, collection: &CollectionKey) -> Snapshot {
        self.engine.snapshot(collection)
    }

    pub fn entity(&self, collection: &CollectionKey, id: &str) -> Option<Entity> {
        self.engine.store().entity(collection, &EntityId::new(id))
    }

    pub fn frame(&self) -> usize {
        self.engine.frame()
    }

    /// Put `(id, name, qty)` items on the server.
    pub fn seed_items(&self, items: &[(&str, &str, &str)]) {
        let docs = items
            .iter()
            .map(|(id, name, qty)| {
                Entity::new(*id)
                    .with_field("name", *name)
                    .with_field("nameKey", name_key(name))
                    .with_field("qty", *qty)
                    .with_field("checked", false)
            })
            .collect();
        self.remote.seed(&self.items(), docs);
    }

    /// Seed weekly staples as `(id, name, qty, checked)`.
    pub fn seed_weekly(&self, staples: &[(&str, &str, &str, bool)]) {
        let docs = staples
            .iter()
            .map(|(id, name, qty, checked)| {
                Entity::new(*id)
                    .with_field("name", *name)
                    .with_field("qty", *qty)
                    .with_field("checked", *checked)
            })
            .collect();
        self.remote.seed(&self.weekly(), docs);
    }
}
