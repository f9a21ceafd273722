use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pantry_core::{CollectionKey, Snapshot};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Draws one collection. Receives an immutable snapshot.
pub trait Renderer: Send + Sync {
    fn render(&self, collection: &CollectionKey, snapshot: &Snapshot);
}

/// Coalesces render requests: within one frame each collection is rendered at
/// most once, with the latest snapshot scheduled for it.
pub struct RenderScheduler {
    renderer: Arc<dyn Renderer>,
    // Insertion order = order of first schedule within the frame.
    pending: Mutex<Vec<(CollectionKey, Snapshot)>>,
    wake: Notify,
    frames: AtomicU64,
}

impl RenderScheduler {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            pending: Mutex::new(Vec::new()),
            wake: Notify::new(),
            frames: AtomicU64::new(0),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<(CollectionKey, Snapshot)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(&self, collection: &CollectionKey, snapshot: Snapshot) {
        {
            let mut pending = self.pending();
            match pending.iter_mut().find(|(key, _)| key == collection) {
                Some(slot) => slot.1 = snapshot,
                None => pending.push((collection.clone(), snapshot)),
            }
        }
        self.wake.notify_one();
    }

    pub fn has_pending(&self) -> bool {
        !self.pending().is_empty()
    }

    pub fn is_scheduled(&self, collection: &CollectionKey) -> bool {
        self.pending().iter().any(|(key, _)| key == collection)
    }

    /// Run one frame. Returns the number of collections rendered.
    ///
    /// The queue is drained before rendering, so a renderer that schedules
    /// again lands in the next frame.
    pub fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending());
        if batch.is_empty() {
            return 0;
        }
        self.frames.fetch_add(1, Ordering::Relaxed);
        for (collection, snapshot) in &batch {
            tracing::trace!(collection = %collection, entities = snapshot.len(), "render");
            self.renderer.render(collection, snapshot);
        }
        batch.len()
    }

    /// Frames that rendered at least one collection.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Resolves once something has been scheduled since the last wake-up.
    pub async fn scheduled(&self) {
        self.wake.notified().await
    }
}

/// Background task that flushes a [`RenderScheduler`] on frame boundaries.
///
/// Sleeps while nothing is scheduled. Aborted on drop.
pub struct FrameDriver {
    handle: JoinHandle<()>,
}

impl FrameDriver {
    /// `frame` runs once per frame with pending work; it normally flushes the
    /// scheduler and persists what changed.
    pub fn spawn<F>(scheduler: Arc<RenderScheduler>, period: Duration, frame: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                scheduler.scheduled().await;
                ticker.tick().await;
                frame();
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for FrameDriver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
