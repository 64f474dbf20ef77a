//! Background polling refresher.
//!
//! Two loops per mounted sheet, active only while the view is visible:
//! a ledger tick (~15 s) that re-reconciles a frozen sheet until it is
//! fully hydrated and otherwise re-runs the local-load path, and a
//! shorter sales tick (~5 s) that recomputes derived payment totals and
//! notifies only when the aggregate actually changed. Both loops honor
//! the sheet's manual-edit guard so an edit in flight is never clobbered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, trace, warn};

use crate::api::{RemoteLedger, SaleRecord};
use crate::authority;
use crate::cache;
use crate::catalog::CatalogProvider;
use crate::db::DbState;
use crate::events::{EventBus, LedgerEvent, PaymentTotals};
use crate::model::SheetKey;
use crate::reconcile;
use crate::state::SheetRuntime;

/// Default ledger poll interval.
pub const LEDGER_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Default sales poll interval for derived payment totals.
pub const SALES_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Derive payment totals from the day's sale records. Voided and
/// cancelled sales do not count.
pub fn compute_payment_totals(sales: &[SaleRecord]) -> PaymentTotals {
    let mut totals = PaymentTotals::default();
    for sale in sales {
        match sale.status.as_str() {
            "cancelled" | "voided" => continue,
            _ => {}
        }
        match sale.payment_method.as_str() {
            "digital_a" => totals.digital_a += sale.total_amount,
            "digital_b" => totals.digital_b += sale.total_amount,
            _ => totals.cash += sale.total_amount,
        }
        totals.sale_count += 1;
    }
    totals
}

/// Handle for one sheet's polling loops.
pub struct PollingRefresher {
    pub is_running: Arc<AtomicBool>,
    last_totals: Arc<Mutex<Option<PaymentTotals>>>,
}

impl PollingRefresher {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_totals: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the ledger and sales loops. Idempotent per instance:
    /// calling start twice without a stop is a no-op.
    #[allow(clippy::too_many_arguments)]
    pub fn start<R: RemoteLedger + 'static>(
        &self,
        key: SheetKey,
        db: Arc<DbState>,
        remote: Arc<R>,
        catalog: Arc<dyn CatalogProvider>,
        runtime: Arc<SheetRuntime>,
        events: Arc<EventBus>,
        ledger_interval: Duration,
        sales_interval: Duration,
    ) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(sheet = %key, "polling refresher started");

        let is_running = self.is_running.clone();
        {
            let key = key.clone();
            let db = db.clone();
            let remote = remote.clone();
            let runtime = runtime.clone();
            let events = events.clone();
            let is_running = is_running.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(ledger_interval).await;
                    if !is_running.load(Ordering::SeqCst) {
                        break;
                    }
                    ledger_tick(&key, &db, remote.as_ref(), catalog.as_ref(), &runtime, &events)
                        .await;
                }
                trace!(sheet = %key, "ledger poll loop stopped");
            });
        }

        let last_totals = self.last_totals.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sales_interval).await;
                if !is_running.load(Ordering::SeqCst) {
                    break;
                }
                if !runtime.is_visible() {
                    continue;
                }
                sales_tick(&key, remote.as_ref(), &events, &last_totals).await;
            }
            trace!(sheet = %key, "sales poll loop stopped");
        });
    }

    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

impl Default for PollingRefresher {
    fn default() -> Self {
        Self::new()
    }
}

async fn ledger_tick<R: RemoteLedger>(
    key: &SheetKey,
    db: &DbState,
    remote: &R,
    catalog: &dyn CatalogProvider,
    runtime: &SheetRuntime,
    events: &EventBus,
) {
    if !runtime.is_visible() {
        return;
    }
    if runtime.manual_edit_active() {
        trace!(sheet = %key, "manual edit in flight, skipping refresh tick");
        return;
    }

    let status = match cache::read_status(db, key) {
        Ok(s) => s,
        Err(e) => {
            warn!(sheet = %key, "status read failed during refresh: {e}");
            return;
        }
    };
    let local_rows = cache::read_sheet(db, key)
        .ok()
        .flatten()
        .map(|s| s.rows.len())
        .unwrap_or(0);
    let catalog_len = catalog
        .products_for(&key.sheet_id)
        .map(|p| p.len())
        .unwrap_or(0);

    if status.is_frozen() {
        // Cheap completeness check: once the sheet is fully hydrated
        // there is nothing left to pull.
        if authority::needs_remerge(local_rows, catalog_len) {
            if let Err(e) = reconcile::merge(remote, db, catalog, key, events).await {
                warn!(sheet = %key, "periodic reconcile failed: {e}");
            }
        }
        return;
    }

    // Editable states serve the local view, but once the last reconcile
    // falls outside the staleness window a refresh is attempted so rows
    // committed from another terminal surface. The guard check above
    // keeps this from racing the user's pending edits.
    match cache::is_sheet_stale(db, key) {
        Ok(true) => {
            if let Err(e) = reconcile::merge(remote, db, catalog, key, events).await {
                warn!(sheet = %key, "opportunistic reconcile failed: {e}");
            }
        }
        Ok(false) => events.emit(LedgerEvent::RowsChanged { key: key.clone() }),
        Err(e) => warn!(sheet = %key, "staleness check failed during refresh: {e}"),
    }
}

async fn sales_tick<R: RemoteLedger>(
    key: &SheetKey,
    remote: &R,
    events: &EventBus,
    last_totals: &Mutex<Option<PaymentTotals>>,
) {
    let sales = match remote.sales_for_date(&key.date).await {
        Ok(sales) => sales,
        Err(e) => {
            trace!(sheet = %key, "sales poll failed: {e}");
            return;
        }
    };

    let totals = compute_payment_totals(&sales);
    {
        let mut guard = last_totals.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_ref() == Some(&totals) {
            return;
        }
        *guard = Some(totals.clone());
    }

    events.emit(LedgerEvent::PaymentTotalsChanged {
        date: key.date.clone(),
        totals,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockRemote;
    use crate::api::RemoteRow;
    use crate::catalog::{CatalogProduct, StaticCatalog};
    use crate::db;
    use crate::model::SheetStatus;
    use rusqlite::Connection;
    use std::sync::atomic::AtomicUsize;

    fn test_db() -> Arc<DbState> {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        Arc::new(DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        })
    }

    fn sheet_key() -> SheetKey {
        SheetKey::new("LUNES", "ID1", "2025-01-06")
    }

    fn sale(id: &str, amount: f64, method: &str, status: &str) -> SaleRecord {
        SaleRecord {
            id: id.into(),
            date: "2025-01-06".into(),
            total_amount: amount,
            payment_method: method.into(),
            status: status.into(),
        }
    }

    fn catalog_with(n: usize) -> Arc<StaticCatalog> {
        Arc::new(StaticCatalog::new(
            (0..n)
                .map(|i| CatalogProduct {
                    name: format!("PRODUCTO {i}"),
                    list_price: 1000.0,
                })
                .collect(),
        ))
    }

    #[test]
    fn test_compute_payment_totals_buckets_and_skips_voided() {
        let sales = [
            sale("s1", 10_000.0, "cash", "completed"),
            sale("s2", 5_000.0, "digital_a", "completed"),
            sale("s3", 2_000.0, "digital_b", "completed"),
            sale("s4", 9_000.0, "cash", "voided"),
        ];
        let totals = compute_payment_totals(&sales);
        assert_eq!(totals.cash, 10_000.0);
        assert_eq!(totals.digital_a, 5_000.0);
        assert_eq!(totals.digital_b, 2_000.0);
        assert_eq!(totals.sale_count, 3);
    }

    #[tokio::test]
    async fn test_frozen_sheet_remerges_until_hydrated_then_stops() {
        let db = test_db();
        let remote = Arc::new(MockRemote::new());
        let key = sheet_key();
        remote.seed_row(RemoteRow {
            id: Some("r1".into()),
            date: key.date.clone(),
            weekday: key.weekday.clone(),
            product_name: "PRODUCTO 0".into(),
            quantity: 5.0,
            unit_price: 1000.0,
            ..Default::default()
        });
        cache::write_status(&db, &key, SheetStatus::Completado).unwrap();

        let runtime = Arc::new(SheetRuntime::new());
        runtime.set_visible(true);
        let events = Arc::new(EventBus::new());
        let catalog = catalog_with(3);

        let refresher = PollingRefresher::new();
        refresher.start(
            key.clone(),
            db.clone(),
            remote.clone(),
            catalog,
            runtime,
            events,
            Duration::from_millis(30),
            Duration::from_secs(3600),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        let hydrated = cache::read_sheet(&db, &key).unwrap().expect("merged sheet");
        assert_eq!(hydrated.rows.len(), 3);

        // Fully hydrated now: further ticks must not refetch.
        let calls_after_hydration = remote.list_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(remote.list_calls.load(Ordering::SeqCst), calls_after_hydration);

        refresher.stop();
    }

    #[tokio::test]
    async fn test_stale_editable_sheet_reconciles_opportunistically() {
        let db = test_db();
        let remote = Arc::new(MockRemote::new());
        let key = sheet_key();
        remote.seed_row(RemoteRow {
            id: Some("r1".into()),
            date: key.date.clone(),
            weekday: key.weekday.clone(),
            product_name: "PRODUCTO 0".into(),
            quantity: 5.0,
            unit_price: 1000.0,
            ..Default::default()
        });
        // Status stays editable (alistamiento); the sheet has never been
        // reconciled, which counts as stale.

        let runtime = Arc::new(SheetRuntime::new());
        runtime.set_visible(true);
        let refresher = PollingRefresher::new();
        refresher.start(
            key.clone(),
            db.clone(),
            remote.clone(),
            catalog_with(3),
            runtime,
            Arc::new(EventBus::new()),
            Duration::from_millis(30),
            Duration::from_secs(3600),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        let merged = cache::read_sheet(&db, &key).unwrap().expect("merged sheet");
        assert_eq!(merged.rows.len(), 3);
        assert_eq!(merged.rows[0].quantity, 5.0);

        // The merge stamped the sync timestamp; while it is fresh the
        // ticks serve the local view without refetching.
        let calls_after_merge = remote.list_calls.load(Ordering::SeqCst);
        assert!(calls_after_merge >= 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(remote.list_calls.load(Ordering::SeqCst), calls_after_merge);

        refresher.stop();
    }

    #[tokio::test]
    async fn test_manual_edit_guard_blocks_refresh() {
        let db = test_db();
        let remote = Arc::new(MockRemote::new());
        let key = sheet_key();
        cache::write_status(&db, &key, SheetStatus::Completado).unwrap();

        let runtime = Arc::new(SheetRuntime::new());
        runtime.set_visible(true);
        runtime.intent_scheduled(); // edit in flight

        let refresher = PollingRefresher::new();
        refresher.start(
            key.clone(),
            db.clone(),
            remote.clone(),
            catalog_with(3),
            runtime,
            Arc::new(EventBus::new()),
            Duration::from_millis(30),
            Duration::from_secs(3600),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(remote.list_calls.load(Ordering::SeqCst), 0);
        refresher.stop();
    }

    #[tokio::test]
    async fn test_hidden_view_polls_nothing() {
        let db = test_db();
        let remote = Arc::new(MockRemote::new());
        let key = sheet_key();
        cache::write_status(&db, &key, SheetStatus::Completado).unwrap();

        let runtime = Arc::new(SheetRuntime::new());
        // visible defaults to false

        let refresher = PollingRefresher::new();
        refresher.start(
            key.clone(),
            db,
            remote.clone(),
            catalog_with(3),
            runtime,
            Arc::new(EventBus::new()),
            Duration::from_millis(30),
            Duration::from_millis(30),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(remote.list_calls.load(Ordering::SeqCst), 0);
        refresher.stop();
    }

    #[tokio::test]
    async fn test_sales_tick_emits_only_on_change() {
        let db = test_db();
        let remote = Arc::new(MockRemote::new());
        let key = sheet_key();
        remote
            .sales
            .lock()
            .unwrap()
            .push(sale("s1", 10_000.0, "cash", "completed"));

        let runtime = Arc::new(SheetRuntime::new());
        runtime.set_visible(true);
        let events = Arc::new(EventBus::new());
        let emitted = Arc::new(AtomicUsize::new(0));
        let emitted_clone = emitted.clone();
        events.subscribe(move |event| {
            if matches!(event, LedgerEvent::PaymentTotalsChanged { .. }) {
                emitted_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let refresher = PollingRefresher::new();
        refresher.start(
            key.clone(),
            db,
            remote.clone(),
            catalog_with(0),
            runtime,
            events,
            Duration::from_secs(3600),
            Duration::from_millis(30),
        );

        // Several ticks over an unchanged aggregate: exactly one event.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(emitted.load(Ordering::SeqCst), 1);

        // A new sale changes the aggregate: a second event follows.
        remote
            .sales
            .lock()
            .unwrap()
            .push(sale("s2", 5_000.0, "digital_a", "completed"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(emitted.load(Ordering::SeqCst), 2);

        refresher.stop();
    }
}
