use pantry_core::{CollectionKey, EntityId, MutationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Started,
    Succeeded,
    Failed,
    /// Validation refused the mutation; nothing was applied.
    Rejected,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// User-facing progress message for one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: MutationKind,
    pub phase: Phase,
    pub collection: Option<CollectionKey>,
    pub entity_id: Option<EntityId>,
    /// Validation message for rejected mutations.
    pub detail: Option<String>,
}

impl Notice {
    pub fn new(
        kind: MutationKind,
        phase: Phase,
        collection: Option<&CollectionKey>,
        entity_id: Option<&EntityId>,
    ) -> Self {
        Self {
            kind,
            phase,
            collection: collection.cloned(),
            entity_id: entity_id.cloned(),
            detail: None,
        }
    }

    pub fn rejected(
        kind: MutationKind,
        collection: Option<&CollectionKey>,
        entity_id: Option<&EntityId>,
        reason: &str,
    ) -> Self {
        Self {
            detail: Some(reason.to_string()),
            ..Self::new(kind, Phase::Rejected, collection, entity_id)
        }
    }

    pub fn message(&self) -> String {
        if self.phase == Phase::Rejected {
            return self.detail.clone().unwrap_or_else(|| "Invalid change".into());
        }
        let text = match (self.kind, self.phase) {
            (MutationKind::Update, Phase::Started) => "Saving…",
            (MutationKind::Update, Phase::Succeeded) => "Saved",
            (MutationKind::Update, _) => "Save failed. Reverted.",
            (MutationKind::Delete, Phase::Started) => "Deleting…",
            (MutationKind::Delete, Phase::Succeeded) => "Deleted",
            (MutationKind::Delete, _) => "Delete failed. Restored.",
            (MutationKind::Create, Phase::Started) => "Adding…",
            (MutationKind::Create, Phase::Succeeded) => "Added",
            (MutationKind::Create, _) => "Add failed. Reverted.",
            (MutationKind::Batch, Phase::Started) => "Updating…",
            (MutationKind::Batch, Phase::Succeeded) => "Updated",
            (MutationKind::Batch, _) => "Update failed. Reverted.",
        };
        text.to_string()
    }
}

/// Receives progress and outcome notices, typically to show a toast.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: &Notice) {
        tracing::info!(
            kind = notice.kind.as_str(),
            phase = notice.phase.as_str(),
            collection = notice.collection.as_ref().map(|c| c.as_str()),
            entity = notice.entity_id.as_ref().map(|e| e.as_str()),
            "{}",
            notice.message()
        );
    }
}
