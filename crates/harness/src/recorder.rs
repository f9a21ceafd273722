use std::sync::{Mutex, MutexGuard, PoisonError};

use pantry_core::{CollectionKey, MutationKind, Snapshot};
use pantry_engine::{Notice, Notifier, Phase, Renderer};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Renderer that remembers every snapshot it was asked to paint.
#[derive(Default)]
pub struct RecordingRenderer {
    renders: Mutex<Vec<(CollectionKey, Snapshot)>>,
}

impl RecordingRenderer {
    pub fn count(&self) -> usize {
        lock(&self.renders).len()
    }

    pub fn renders_for(&self, collection: &CollectionKey) -> Vec<Snapshot> {
        lock(&self.renders)
            .iter()
            .filter(|(key, _)| key == collection)
            .map(|(_, snapshot)| snapshot.clone())
            .collect()
    }

    pub fn last(&self, collection: &CollectionKey) -> Option<Snapshot> {
        lock(&self.renders)
            .iter()
            .rev()
            .find(|(key, _)| key == collection)
            .map(|(_, snapshot)| snapshot.clone())
    }

    pub fn clear(&self) {
        lock(&self.renders).clear();
    }
}

impl Renderer for RecordingRenderer {
    fn render(&self, collection: &CollectionKey, snapshot: &Snapshot) {
        lock(&self.renders).push((collection.clone(), snapshot.clone()));
    }
}

/// Notifier that keeps every notice for later assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        lock(&self.notices).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.notices).iter().map(Notice::message).collect()
    }

    pub fn count(&self, kind: MutationKind, phase: Phase) -> usize {
        lock(&self.notices)
            .iter()
            .filter(|n| n.kind == kind && n.phase == phase)
            .count()
    }

    pub fn terminal(&self) -> Vec<Notice> {
        lock(&self.notices)
            .iter()
            .filter(|n| n.phase.is_terminal())
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.notices).clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: &Notice) {
        lock(&self.notices).push(notice.clone());
    }
}
