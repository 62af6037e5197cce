//! Realtime change notifications.
//!
//! Row-change events arrive on one channel. The dispatcher maps each event to
//! a reconciliation action: patch a single row in place when the table
//! supports it and the event identifies the row, otherwise refresh the table.
//! Events already queued when a batch starts are coalesced so a burst of
//! changes to one table triggers a single refresh.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row change as published by the backend's realtime feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    #[serde(default, rename = "new")]
    pub new_record: Option<Value>,
    #[serde(default, rename = "old")]
    pub old_record: Option<Value>,
}

impl ChangeEvent {
    /// The `id` of the affected row, from the new image or else the old one.
    #[must_use]
    pub fn record_id(&self) -> Option<String> {
        [&self.new_record, &self.old_record]
            .into_iter()
            .flatten()
            .find_map(|record| match record.get("id")? {
                Value::String(id) if !id.is_empty() => Some(id.clone()),
                Value::Number(id) => Some(id.to_string()),
                _ => None,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile {
    FullRefresh { table: String },
    Patch { table: String, record_id: String },
}

impl Reconcile {
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::FullRefresh { table } | Self::Patch { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeDispatcher {
    patchable: HashSet<String>,
}

impl ChangeDispatcher {
    /// `patchable` lists tables whose views can update a single row in place.
    pub fn new<I, S>(patchable: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patchable: patchable.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn reconcile(&self, event: &ChangeEvent) -> Reconcile {
        match (event.kind, event.record_id()) {
            (ChangeKind::Insert | ChangeKind::Update, Some(record_id))
                if self.patchable.contains(&event.table) =>
            {
                Reconcile::Patch {
                    table: event.table.clone(),
                    record_id,
                }
            }
            _ => Reconcile::FullRefresh {
                table: event.table.clone(),
            },
        }
    }

    /// Map a batch of events to actions, dropping duplicates and any patch
    /// made redundant by a refresh of the same table.
    #[must_use]
    pub fn coalesce(&self, events: &[ChangeEvent]) -> Vec<Reconcile> {
        let actions: Vec<Reconcile> = events.iter().map(|e| self.reconcile(e)).collect();
        let refreshed: HashSet<&str> = actions
            .iter()
            .filter(|a| matches!(a, Reconcile::FullRefresh { .. }))
            .map(Reconcile::table)
            .collect();

        let mut out: Vec<Reconcile> = Vec::with_capacity(actions.len());
        for action in &actions {
            let redundant = matches!(action, Reconcile::Patch { table, .. } if refreshed.contains(table.as_str()));
            if !redundant && !out.contains(action) {
                out.push(action.clone());
            }
        }
        out
    }

    /// Consume `events` until the channel closes, applying each coalesced batch.
    pub async fn run<F>(self, mut events: mpsc::Receiver<ChangeEvent>, mut apply: F)
    where
        F: FnMut(Reconcile),
    {
        while let Some(first) = events.recv().await {
            let mut batch = vec![first];
            while let Ok(next) = events.try_recv() {
                batch.push(next);
            }
            for action in self.coalesce(&batch) {
                tracing::debug!(table = action.table(), ?action, "Reconciling realtime change");
                apply(action);
            }
        }
    }
}
