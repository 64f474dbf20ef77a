//! Per-sheet runtime guard state.
//!
//! Each mounted sheet owns one `SheetRuntime`: the manual-edit guard the
//! scheduler raises while intents are pending, the visibility bit the
//! refresher honors, and bookkeeping for the pending-intent count. Kept
//! as explicit sheet-scoped structs (not ambient globals) so tests can
//! construct independent instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::model::SheetKey;

/// Mutable guard flags for one mounted sheet.
#[derive(Debug, Default)]
pub struct SheetRuntime {
    manual_edit: AtomicBool,
    visible: AtomicBool,
    pending_intents: AtomicUsize,
}

impl SheetRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while an edit is in flight; the refresher must not overwrite
    /// local state from remote during this window.
    pub fn manual_edit_active(&self) -> bool {
        self.manual_edit.load(Ordering::SeqCst)
    }

    /// Called by the scheduler when an intent is queued. Raises the
    /// manual-edit guard.
    pub fn intent_scheduled(&self) {
        self.pending_intents.fetch_add(1, Ordering::SeqCst);
        self.manual_edit.store(true, Ordering::SeqCst);
    }

    /// Called when an intent fires or is superseded. Lowers the guard
    /// once the pending table drains.
    pub fn intent_settled(&self) {
        let before = self.pending_intents.fetch_sub(1, Ordering::SeqCst);
        // Saturate rather than wrap if settle/schedule ever mismatch.
        if before == 0 {
            self.pending_intents.store(0, Ordering::SeqCst);
        }
        if before <= 1 {
            self.manual_edit.store(false, Ordering::SeqCst);
        }
    }

    pub fn pending_intent_count(&self) -> usize {
        self.pending_intents.load(Ordering::SeqCst)
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }
}

/// Registry of runtimes keyed by sheet identity.
#[derive(Default)]
pub struct RuntimeRegistry {
    map: Mutex<HashMap<SheetKey, Arc<SheetRuntime>>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: &SheetKey) -> Arc<SheetRuntime> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(SheetRuntime::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_edit_guard_tracks_pending_intents() {
        let runtime = SheetRuntime::new();
        assert!(!runtime.manual_edit_active());

        runtime.intent_scheduled();
        runtime.intent_scheduled();
        assert!(runtime.manual_edit_active());
        assert_eq!(runtime.pending_intent_count(), 2);

        runtime.intent_settled();
        assert!(runtime.manual_edit_active());
        runtime.intent_settled();
        assert!(!runtime.manual_edit_active());
    }

    #[test]
    fn test_registry_returns_same_instance_per_key() {
        let registry = RuntimeRegistry::new();
        let key = SheetKey::new("MARTES", "ID2", "2025-01-07");
        let a = registry.get_or_create(&key);
        a.set_visible(true);

        let b = registry.get_or_create(&key);
        assert!(b.is_visible());
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.get_or_create(&SheetKey::new("MARTES", "ID3", "2025-01-07"));
        assert!(!other.is_visible());
    }
}
