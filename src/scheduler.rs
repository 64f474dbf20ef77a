//! Per-field debounce scheduler.
//!
//! Prevents a remote write per keystroke: each (row, field) pair owns at
//! most one pending timer, and a new edit cancels the previous timer
//! outright and starts a fresh one carrying only the newest value.
//! Intermediate values are superseded, never queued — last-write-wins
//! per field. Timers for different fields run independently; the engine
//! makes no ordering promise between sibling fields of the same row.
//!
//! While any intent is pending the owning sheet's manual-edit guard is
//! raised so the polling refresher does not overwrite in-flight state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::api::RemoteLedger;
use crate::events::{EventBus, LedgerEvent};
use crate::model::{normalize_product_name, FieldValue, GlobalField, LineField, SheetKey};
use crate::state::SheetRuntime;
use crate::upsert;

/// Reserved row key under which sheet-level fields are scheduled.
const GLOBALS_ROW_KEY: &str = "__globals__";

/// What a fired timer commits.
#[derive(Debug, Clone)]
enum Target {
    Line {
        product: String,
        field: LineField,
        fallback_unit_price: f64,
    },
    Global {
        field: GlobalField,
    },
}

impl Target {
    fn field_name(&self) -> &'static str {
        match self {
            Target::Line { field, .. } => field.as_str(),
            Target::Global { field } => field.as_str(),
        }
    }

    fn row_key(&self) -> String {
        match self {
            Target::Line { product, .. } => product.clone(),
            Target::Global { .. } => GLOBALS_ROW_KEY.to_string(),
        }
    }
}

/// One pending debounced edit. Ephemeral: lives only in the scheduler's
/// table, never persisted.
struct PendingIntent {
    id: Uuid,
    token: CancellationToken,
}

/// Debounce scheduler for one mounted sheet.
pub struct FieldSyncScheduler<R> {
    key: SheetKey,
    remote: Arc<R>,
    runtime: Arc<SheetRuntime>,
    events: Arc<EventBus>,
    actor: String,
    pending: Arc<Mutex<HashMap<(String, &'static str), PendingIntent>>>,
    debounce_override_ms: Option<u64>,
}

impl<R: RemoteLedger + 'static> FieldSyncScheduler<R> {
    pub fn new(
        key: SheetKey,
        remote: Arc<R>,
        runtime: Arc<SheetRuntime>,
        events: Arc<EventBus>,
        actor: &str,
    ) -> Self {
        Self {
            key,
            remote,
            runtime,
            events,
            actor: actor.to_string(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            debounce_override_ms: None,
        }
    }

    /// Test hook: shrink every debounce window to `ms`.
    #[cfg(test)]
    pub(crate) fn override_debounce_ms(&mut self, ms: u64) {
        self.debounce_override_ms = Some(ms);
    }

    /// Schedule a product-line field edit for remote sync.
    pub fn schedule_line(
        &self,
        product: &str,
        field: LineField,
        value: FieldValue,
        fallback_unit_price: f64,
    ) {
        let debounce = self.debounce_override_ms.unwrap_or(field.debounce_ms());
        self.schedule(
            Target::Line {
                product: normalize_product_name(product),
                field,
                fallback_unit_price,
            },
            value,
            debounce,
        );
    }

    /// Schedule a sheet-level field edit for remote sync.
    pub fn schedule_global(&self, field: GlobalField, value: FieldValue) {
        let debounce = self.debounce_override_ms.unwrap_or(field.debounce_ms());
        self.schedule(Target::Global { field }, value, debounce);
    }

    fn schedule(&self, target: Target, value: FieldValue, debounce_ms: u64) {
        let table_key = (target.row_key(), target.field_name());
        let intent_id = Uuid::new_v4();
        let token = CancellationToken::new();

        // Raise the guard before touching the table so it never dips low
        // while a superseded intent is being swapped out.
        self.runtime.intent_scheduled();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(superseded) = pending.insert(
                table_key.clone(),
                PendingIntent {
                    id: intent_id,
                    token: token.clone(),
                },
            ) {
                // Cancel the older timer outright; its value is discarded.
                superseded.token.cancel();
                self.runtime.intent_settled();
                trace!(
                    sheet = %self.key,
                    row = %table_key.0,
                    field = table_key.1,
                    superseded = %superseded.id,
                    "pending intent superseded"
                );
            }
        }
        debug!(
            sheet = %self.key,
            row = %table_key.0,
            field = table_key.1,
            intent = %intent_id,
            debounce_ms,
            "field sync scheduled"
        );

        let key = self.key.clone();
        let remote = self.remote.clone();
        let runtime = self.runtime.clone();
        let events = self.events.clone();
        let actor = self.actor.clone();
        let pending = self.pending.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(debounce_ms)) => {}
            }

            // The pending table arbitrates: if our entry was replaced
            // between the timer expiring and this point, a newer edit
            // owns the pair and we stand down.
            {
                let mut table = pending.lock().unwrap_or_else(|e| e.into_inner());
                match table.get(&table_key) {
                    Some(entry) if entry.id == intent_id => {
                        table.remove(&table_key);
                    }
                    _ => return,
                }
            }

            let outcome = match &target {
                Target::Line {
                    product,
                    field,
                    fallback_unit_price,
                } => {
                    upsert::commit(
                        remote.as_ref(),
                        &key,
                        product,
                        *field,
                        &value,
                        *fallback_unit_price,
                        &actor,
                    )
                    .await
                }
                Target::Global { field } => {
                    upsert::commit_global_field(remote.as_ref(), &key, *field, &value, &actor).await
                }
            };

            events.emit(LedgerEvent::SyncCompleted {
                key,
                product: target.row_key(),
                field: target.field_name(),
                outcome,
            });
            // The guard stays up through the remote round trip: a merge
            // racing the commit must not pull pre-patch rows over the
            // newer local value.
            runtime.intent_settled();
        });
    }

    /// Number of intents still waiting on their timers.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Cancel every pending timer (sheet unmount). Values already in the
    /// local cache are unaffected.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, intent) in pending.drain() {
            intent.token.cancel();
            self.runtime.intent_settled();
        }
    }
}
