//! Typed event bus scoped to one engine instance.
//!
//! The UI layer registers observers instead of listening to a
//! process-wide broadcast; tests can construct independent buses and
//! assert on exactly the events one sheet's lifecycle produced.

use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::model::SheetKey;
use crate::upsert::CommitOutcome;

/// Derived payment totals for one date.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PaymentTotals {
    pub cash: f64,
    pub digital_a: f64,
    pub digital_b: f64,
    pub sale_count: usize,
}

/// Events emitted by the cache, reconciliation, and sync paths.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    /// The cached sheet changed (edit or reconciliation); re-render.
    RowsChanged { key: SheetKey },
    /// A debounced field sync finished, successfully or not.
    SyncCompleted {
        key: SheetKey,
        product: String,
        field: &'static str,
        outcome: CommitOutcome,
    },
    /// The derived payment totals for the active date changed.
    PaymentTotalsChanged { date: String, totals: PaymentTotals },
}

type Listener = Arc<dyn Fn(&LedgerEvent) + Send + Sync>;

/// Observer registry. Emission is synchronous and in registration order.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&LedgerEvent) + Send + Sync + 'static,
    {
        match self.listeners.lock() {
            Ok(mut guard) => guard.push(Arc::new(listener)),
            Err(e) => warn!("event bus listener registry poisoned: {e}"),
        }
    }

    /// Deliver `event` to every listener. The registry lock is released
    /// before any callback runs, so a listener may subscribe or emit
    /// again without deadlocking.
    pub fn emit(&self, event: LedgerEvent) {
        let snapshot: Vec<Listener> = match self.listeners.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(e) => {
                warn!("event bus listener registry poisoned: {e}");
                return;
            }
        };
        for listener in &snapshot {
            listener(&event);
        }
    }
}
