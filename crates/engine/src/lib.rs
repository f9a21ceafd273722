pub mod config;
pub mod error;
pub mod executor;
pub mod notify;
pub mod pending;
pub mod remote;
pub mod scheduler;
pub mod shopping;
pub mod snapshot_store;
pub mod sync;

pub use config::{EngineConfig, RetryPolicy, WritePolicy};
pub use error::{BatchError, ConfigError, EngineError, MutationError, RemoteError};
pub use executor::{Committed, Executor, MutationHandle};
pub use notify::{LogNotifier, Notice, Notifier, Phase};
pub use pending::{MutationStatus, PendingMutation, SettledMutation};
pub use remote::{RemoteStore, SnapshotListener, Subscription};
pub use scheduler::{FrameDriver, RenderScheduler, Renderer};
pub use shopping::{Ingredient, RecipeDraft, ShoppingList};
pub use snapshot_store::SnapshotStore;
pub use sync::{BatchReport, SharedCache, SubscribeOutcome, SyncAdapter};

use std::sync::{Arc, Mutex, PoisonError};

use pantry_core::{Clock, CollectionKey, Mutation, Snapshot, SystemClock};
use pantry_storage::SnapshotCache;

/// Wires the snapshot store, sync adapter, executor and render scheduler
/// around one remote store.
pub struct EngineBuilder {
    remote: Arc<dyn RemoteStore>,
    renderer: Arc<dyn Renderer>,
    config: EngineConfig,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    cache: Option<SharedCache>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache<C: SnapshotCache + 'static>(mut self, cache: C) -> Self {
        let cache: SharedCache = Arc::new(Mutex::new(cache));
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;
        let cache = if self.config.cache_enabled {
            self.cache
        } else {
            None
        };
        let store = SnapshotStore::new(self.clock.clone());
        let scheduler = Arc::new(RenderScheduler::new(self.renderer));
        let sync = SyncAdapter::new(
            self.remote,
            store.clone(),
            scheduler.clone(),
            cache.clone(),
            self.clock.clone(),
            self.config.batch_limit,
        );
        let executor = Executor::new(
            store.clone(),
            scheduler.clone(),
            sync.clone(),
            self.notifier,
            self.clock.clone(),
            &self.config,
        );
        tracing::debug!(
            batch_limit = self.config.batch_limit,
            write_policy = ?self.config.write_policy,
            cache = cache.is_some(),
            "engine built"
        );
        Ok(Engine {
            config: self.config,
            store,
            scheduler,
            sync,
            executor,
            cache,
            clock: self.clock,
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    store: SnapshotStore,
    scheduler: Arc<RenderScheduler>,
    sync: SyncAdapter,
    executor: Executor,
    cache: Option<SharedCache>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn builder(remote: Arc<dyn RemoteStore>, renderer: Arc<dyn Renderer>) -> EngineBuilder {
        EngineBuilder {
            remote,
            renderer,
            config: EngineConfig::default(),
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
            cache: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<RenderScheduler> {
        &self.scheduler
    }

    pub fn sync(&self) -> &SyncAdapter {
        &self.sync
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn snapshot(&self, collection: &CollectionKey) -> Snapshot {
        self.store.get(collection)
    }

    pub fn shopping(&self, household: &str) -> ShoppingList {
        ShoppingList::new(self.executor.clone(), household, &self.config)
    }

    /// Subscribe to every collection of a household, painting from the cache first.
    pub fn open_household(&self, uid: &str, household: &str) -> Result<(), EngineError> {
        if household.trim().is_empty() {
            return Err(MutationError::Validation(shopping::NO_HOUSEHOLD.to_string()).into());
        }
        for collection in [
            CollectionKey::items(household),
            CollectionKey::weekly(household),
            CollectionKey::recipes(household),
        ] {
            self.sync.warm_from_cache(&collection);
            self.sync.subscribe(uid, &collection)?;
        }
        Ok(())
    }

    pub fn subscribe(&self, uid: &str, collection: &CollectionKey) -> Result<SubscribeOutcome, EngineError> {
        self.sync.warm_from_cache(collection);
        Ok(self.sync.subscribe(uid, collection)?)
    }

    pub fn apply(&self, mutation: Mutation) -> Result<MutationHandle, MutationError> {
        self.executor.apply(mutation)
    }

    pub async fn execute(&self, mutation: Mutation) -> Result<Committed, MutationError> {
        self.executor.execute(mutation).await
    }

    /// One frame: render what changed since the last frame.
    ///
    /// Collections changed without an explicit schedule (e.g. by a direct
    /// store edit) are picked up from the store's dirty set.
    pub fn frame(&self) -> usize {
        for collection in self.store.take_dirty() {
            if !self.scheduler.is_scheduled(&collection) {
                self.scheduler.schedule(&collection, self.store.get(&collection));
            }
        }
        self.scheduler.flush()
    }

    /// Drive [`Engine::frame`] from a background task at `frame_interval_ms`.
    pub fn spawn_frame_driver(self: &Arc<Self>) -> FrameDriver {
        let engine = Arc::clone(self);
        FrameDriver::spawn(
            self.scheduler.clone(),
            self.config.frame_interval(),
            move || {
                engine.frame();
            },
        )
    }

    /// Write the current snapshot of `collection` to the local cache.
    /// Failures are logged and reported as `false`.
    pub fn persist(&self, collection: &CollectionKey) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        let snapshot = self.store.get(collection);
        let result = cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .store(collection, &snapshot, self.clock.now_ms());
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "cache write failed");
                false
            }
        }
    }

    /// Tear down all listeners, e.g. on sign-out.
    pub fn close(&self) -> usize {
        self.sync.unsubscribe_all()
    }
}
