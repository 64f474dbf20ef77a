//! Engine facade: one object the UI layer drives through its lifecycle
//! events (mount, field change, visibility change).
//!
//! Ties the local cache, the debounce scheduler, the upsert protocol,
//! authority decisions, reconciliation, and the polling refresher
//! together per sheet. All writes are optimistic local-first: the cache
//! is updated synchronously and the remote write is debounced behind it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::api::RemoteLedger;
use crate::authority::{self, LoadSource};
use crate::cache;
use crate::catalog::CatalogProvider;
use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, LedgerEvent};
use crate::model::{
    DailyLedgerSheet, FieldValue, GlobalField, LineField, SheetKey, SheetStatus,
};
use crate::reconcile;
use crate::refresher::{PollingRefresher, LEDGER_POLL_INTERVAL, SALES_POLL_INTERVAL};
use crate::scheduler::FieldSyncScheduler;
use crate::state::{RuntimeRegistry, SheetRuntime};

/// What a local edit additionally asks of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EditReceipt {
    /// Stage-2 quantity-affecting edit: the caller should post an
    /// inventory adjustment (inventory itself is external).
    pub inventory_adjustment: bool,
}

struct SheetSession<R> {
    scheduler: Arc<FieldSyncScheduler<R>>,
    refresher: PollingRefresher,
    runtime: Arc<SheetRuntime>,
}

/// Offline-first sync engine for daily load sheets.
pub struct SyncEngine<R: RemoteLedger + 'static> {
    db: Arc<DbState>,
    remote: Arc<R>,
    catalog: Arc<dyn CatalogProvider>,
    registry: RuntimeRegistry,
    events: Arc<EventBus>,
    actor: String,
    ledger_poll: Duration,
    sales_poll: Duration,
    sessions: Mutex<HashMap<SheetKey, Arc<SheetSession<R>>>>,
    #[cfg(test)]
    debounce_override_ms: Option<u64>,
}

impl<R: RemoteLedger + 'static> SyncEngine<R> {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<R>,
        catalog: Arc<dyn CatalogProvider>,
        actor: &str,
    ) -> Self {
        Self {
            db,
            remote,
            catalog,
            registry: RuntimeRegistry::new(),
            events: Arc::new(EventBus::new()),
            actor: actor.to_string(),
            ledger_poll: LEDGER_POLL_INTERVAL,
            sales_poll: SALES_POLL_INTERVAL,
            sessions: Mutex::new(HashMap::new()),
            #[cfg(test)]
            debounce_override_ms: None,
        }
    }

    /// Shrink the refresher intervals (tests, demos).
    pub fn with_poll_intervals(mut self, ledger: Duration, sales: Duration) -> Self {
        self.ledger_poll = ledger;
        self.sales_poll = sales;
        self
    }

    #[cfg(test)]
    pub(crate) fn override_debounce_ms(&mut self, ms: u64) {
        self.debounce_override_ms = Some(ms);
    }

    /// Observer registration for the UI layer.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn session(&self, key: &SheetKey) -> Arc<SheetSession<R>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(key.clone())
            .or_insert_with(|| {
                let runtime = self.registry.get_or_create(key);
                #[allow(unused_mut)]
                let mut scheduler = FieldSyncScheduler::new(
                    key.clone(),
                    self.remote.clone(),
                    runtime.clone(),
                    self.events.clone(),
                    &self.actor,
                );
                #[cfg(test)]
                if let Some(ms) = self.debounce_override_ms {
                    scheduler.override_debounce_ms(ms);
                }
                Arc::new(SheetSession {
                    scheduler: Arc::new(scheduler),
                    refresher: PollingRefresher::new(),
                    runtime,
                })
            })
            .clone()
    }

    fn catalog_len(&self, key: &SheetKey) -> usize {
        self.catalog
            .products_for(&key.sheet_id)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    /// Resolve the price a newly-touched row starts with, following the
    /// same fallback chain reconciliation uses.
    fn fallback_price(&self, key: &SheetKey, sheet: &DailyLedgerSheet, product: &str) -> f64 {
        if let Some(row) = sheet.row(product) {
            if row.unit_price > 0.0 {
                return row.unit_price;
            }
        }
        let cached = cache::cached_price(&self.db, product)
            .ok()
            .flatten()
            .map(|c| c.value);
        let list_price = self
            .catalog
            .products_for(&key.sheet_id)
            .ok()
            .and_then(|products| {
                let wanted = crate::model::normalize_product_name(product);
                products
                    .into_iter()
                    .find(|p| crate::model::normalize_product_name(&p.name) == wanted)
                    .map(|p| p.list_price)
            })
            .unwrap_or(0.0);
        reconcile::pick_unit_price(0.0, cached, list_price)
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Load a sheet for display. Authority-aware: editable sheets come
    /// from the local cache (reconciling when the view is incomplete);
    /// frozen sheets always reconcile from remote.
    pub async fn mount(&self, key: &SheetKey) -> Result<DailyLedgerSheet> {
        let session = self.session(key);
        session.refresher.start(
            key.clone(),
            self.db.clone(),
            self.remote.clone(),
            self.catalog.clone(),
            session.runtime.clone(),
            self.events.clone(),
            self.ledger_poll,
            self.sales_poll,
        );

        let status = cache::read_status(&self.db, key)?;
        match authority::load_source(status) {
            LoadSource::RemoteMerge => {
                reconcile::merge(self.remote.as_ref(), &self.db, self.catalog.as_ref(), key, &self.events)
                    .await
            }
            LoadSource::LocalCache => {
                match cache::read_sheet(&self.db, key)? {
                    Some(mut sheet) => {
                        if authority::needs_remerge(sheet.rows.len(), self.catalog_len(key)) {
                            // An edit created the sheet before its first
                            // full load. The local side stays
                            // authoritative: complete the view from the
                            // catalog instead of pulling remote rows
                            // over pending edits.
                            let catalog_products = self
                                .catalog
                                .products_for(&key.sheet_id)
                                .unwrap_or_default();
                            sheet.rows = reconcile::gap_fill_rows(
                                &sheet.rows,
                                &catalog_products,
                                |product| {
                                    cache::cached_price(&self.db, product)
                                        .ok()
                                        .flatten()
                                        .map(|c| c.value)
                                },
                            );
                            sheet.status = status;
                            cache::write_sheet(&self.db, &sheet)?;
                            self.events.emit(LedgerEvent::RowsChanged { key: key.clone() });
                        }
                        debug!(sheet = %key, rows = sheet.rows.len(), "mounted from local cache");
                        Ok(sheet)
                    }
                    // Cold start: build the gap-filled scaffold.
                    None => {
                        reconcile::merge(
                            self.remote.as_ref(),
                            &self.db,
                            self.catalog.as_ref(),
                            key,
                            &self.events,
                        )
                        .await
                    }
                }
            }
        }
    }

    /// Tear down a sheet's session: cancel pending timers and stop the
    /// refresher. Cached state is untouched.
    pub fn unmount(&self, key: &SheetKey) {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(key)
        };
        if let Some(session) = removed {
            session.scheduler.cancel_all();
            session.refresher.stop();
            info!(sheet = %key, "sheet session unmounted");
        }
    }

    /// The view became visible or hidden; the refresher only polls
    /// while visible.
    pub fn set_visibility(&self, key: &SheetKey, visible: bool) {
        self.registry.get_or_create(key).set_visible(visible);
    }

    /// Read the externally-driven workflow status transition. Freezing
    /// reconciles immediately; re-entering despacho with an incomplete
    /// local view re-merges before edits resume.
    pub async fn set_status(&self, key: &SheetKey, status: SheetStatus) -> Result<()> {
        cache::write_status(&self.db, key, status)?;
        info!(sheet = %key, status = status.as_str(), "sheet status updated");

        let local_rows = cache::read_sheet(&self.db, key)?
            .map(|s| s.rows.len())
            .unwrap_or(0);
        let remerge = match status {
            SheetStatus::Completado => true,
            SheetStatus::Despacho => local_rows < self.catalog_len(key),
            SheetStatus::Alistamiento => false,
        };
        if remerge {
            if self.registry.get_or_create(key).manual_edit_active() {
                // A debounced commit is still in flight; merging now
                // would pull pre-patch remote rows over the newer local
                // value. The next load or refresh tick reconciles.
                debug!(sheet = %key, "edit in flight, deferring post-status reconcile");
                return Ok(());
            }
            reconcile::merge(self.remote.as_ref(), &self.db, self.catalog.as_ref(), key, &self.events)
                .await?;
        }
        Ok(())
    }

    /// Force an immediate reconciliation pass.
    pub async fn refresh(&self, key: &SheetKey) -> Result<DailyLedgerSheet> {
        reconcile::merge(self.remote.as_ref(), &self.db, self.catalog.as_ref(), key, &self.events).await
    }

    // -----------------------------------------------------------------
    // Edits
    // -----------------------------------------------------------------

    /// Apply a product-line field edit: local cache first (synchronous,
    /// always succeeds), then a debounced remote commit.
    pub fn edit_field(
        &self,
        key: &SheetKey,
        product: &str,
        field: LineField,
        value: FieldValue,
    ) -> Result<EditReceipt> {
        let status = cache::read_status(&self.db, key)?;
        if !authority::can_edit_locally(status) {
            return Err(SyncError::Frozen(key.to_string()));
        }

        let mut sheet = cache::read_sheet(&self.db, key)?
            .unwrap_or_else(|| DailyLedgerSheet::empty(key.clone()));
        sheet.status = status;
        let fallback_price = self.fallback_price(key, &sheet, product);

        let row = sheet.row_mut_or_insert(product, fallback_price);
        row.apply(field, &value);
        if row.unit_price > 0.0 {
            let _ = cache::cache_price(&self.db, product, row.unit_price);
        }
        cache::write_sheet(&self.db, &sheet)?;
        self.events.emit(LedgerEvent::RowsChanged { key: key.clone() });

        self.session(key)
            .scheduler
            .schedule_line(product, field, value, fallback_price);

        Ok(EditReceipt {
            inventory_adjustment: authority::triggers_inventory_adjustment(status, field),
        })
    }

    /// Apply a sheet-level field edit (cash box, payments, compliance,
    /// lot registry): local cache first, then a debounced remote commit
    /// onto the sheet's carrier row.
    pub fn edit_global(
        &self,
        key: &SheetKey,
        field: GlobalField,
        value: FieldValue,
    ) -> Result<()> {
        let status = cache::read_status(&self.db, key)?;
        if !authority::can_edit_locally(status) {
            return Err(SyncError::Frozen(key.to_string()));
        }

        let mut globals = cache::read_globals(&self.db, key)?;
        globals.apply(field, &value);
        cache::write_globals(&self.db, key, &globals)?;

        if let Some(mut sheet) = cache::read_sheet(&self.db, key)? {
            sheet.globals = globals;
            cache::write_sheet(&self.db, &sheet)?;
        }
        self.events.emit(LedgerEvent::RowsChanged { key: key.clone() });

        self.session(key).scheduler.schedule_global(field, value);
        Ok(())
    }

    /// Pending debounced intents across a sheet (diagnostics, tests).
    pub fn pending_intents(&self, key: &SheetKey) -> usize {
        self.session(key).scheduler.pending_count()
    }
}
