//! Reconciliation: merge remote rows with the product catalog into a
//! complete, gap-filled local ledger.
//!
//! Runs on load, whenever a sheet is frozen, and whenever the local row
//! count falls short of the catalog. Every merged row gets its derived
//! totals recomputed regardless of source, so the ledger invariants hold
//! even when the remote data is stale or partially written. Unit prices
//! follow a defensive fallback chain — positive remote price, else a
//! previously-cached positive price, else a fraction of catalog list
//! price — so one inconsistent read never downgrades a good price.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::api::{RemoteLedger, RemoteRow};
use crate::cache;
use crate::catalog::{CatalogProduct, CatalogProvider, CATALOG_PRICE_RATIO};
use crate::db::DbState;
use crate::error::Result;
use crate::events::{EventBus, LedgerEvent};
use crate::model::{
    normalize_product_name, DailyLedgerSheet, GlobalFields, ProductLine, SheetKey,
};

/// Resolve the unit price for a merged row.
pub fn pick_unit_price(remote_price: f64, cached_price: Option<f64>, list_price: f64) -> f64 {
    if remote_price > 0.0 {
        return remote_price;
    }
    if let Some(cached) = cached_price.filter(|p| *p > 0.0) {
        return cached;
    }
    list_price * CATALOG_PRICE_RATIO
}

/// Convert a remote row into a product line, recomputing derived totals
/// rather than trusting whatever the remote store holds.
fn line_from_remote(row: &RemoteRow, unit_price: f64) -> ProductLine {
    let mut line = ProductLine {
        product_name: normalize_product_name(&row.product_name),
        quantity: row.quantity,
        discounts: row.discounts,
        additions: row.additions,
        returns: row.returns,
        expired: row.expired,
        expired_lots: row.expired_lots.clone(),
        unit_price,
        seller_checked: row.seller_checked,
        dispatcher_checked: row.dispatcher_checked,
        total: 0.0,
        net: 0,
    };
    line.recompute();
    line
}

/// Merge remote rows with the catalog. Pure so the merge semantics are
/// testable without a database: `cached_price` answers the fallback
/// chain's second link.
pub fn merge_rows(
    remote_rows: &[RemoteRow],
    catalog: &[CatalogProduct],
    cached_price: impl Fn(&str) -> Option<f64>,
) -> Vec<ProductLine> {
    let mut by_name: HashMap<String, &RemoteRow> = HashMap::new();
    for row in remote_rows {
        if row.is_placeholder() {
            continue;
        }
        // First row wins on duplicates; the upsert protocol patches the
        // first match too, so this is the live one.
        by_name
            .entry(normalize_product_name(&row.product_name))
            .or_insert(row);
    }

    let mut merged = Vec::with_capacity(catalog.len().max(remote_rows.len()));
    let mut consumed: Vec<String> = Vec::new();

    for product in catalog {
        let name = normalize_product_name(&product.name);
        match by_name.get(&name) {
            Some(row) => {
                let price = pick_unit_price(row.unit_price, cached_price(&name), product.list_price);
                merged.push(line_from_remote(row, price));
                consumed.push(name);
            }
            None => {
                let price = pick_unit_price(0.0, cached_price(&name), product.list_price);
                merged.push(ProductLine::zeroed(&name, price));
            }
        }
    }

    // Remote products the catalog does not know are kept, appended after
    // catalog order — data never silently disappears from the ledger.
    for name in consumed {
        by_name.remove(&name);
    }
    let mut extras: Vec<&RemoteRow> = by_name.into_values().collect();
    extras.sort_by(|a, b| a.product_name.cmp(&b.product_name));
    for row in extras {
        let name = normalize_product_name(&row.product_name);
        let price = pick_unit_price(row.unit_price, cached_price(&name), 0.0);
        merged.push(line_from_remote(row, price));
    }

    merged
}

/// Complete a locally-authoritative sheet against the catalog without
/// touching the remote store: existing rows keep their values, missing
/// catalog products are zero-filled in catalog order, local-only rows
/// are appended after. Used when an editable sheet was created
/// implicitly by an edit before its first full load.
pub fn gap_fill_rows(
    local_rows: &[ProductLine],
    catalog: &[CatalogProduct],
    cached_price: impl Fn(&str) -> Option<f64>,
) -> Vec<ProductLine> {
    let mut by_name: HashMap<String, &ProductLine> = HashMap::new();
    for row in local_rows {
        by_name.entry(row.product_name.clone()).or_insert(row);
    }

    let mut merged = Vec::with_capacity(catalog.len().max(local_rows.len()));
    let mut consumed: Vec<String> = Vec::new();

    for product in catalog {
        let name = normalize_product_name(&product.name);
        match by_name.get(&name) {
            Some(row) => {
                merged.push((*row).clone());
                consumed.push(name);
            }
            None => {
                let price = pick_unit_price(0.0, cached_price(&name), product.list_price);
                merged.push(ProductLine::zeroed(&name, price));
            }
        }
    }

    for name in consumed {
        by_name.remove(&name);
    }
    let mut extras: Vec<&ProductLine> = by_name.into_values().collect();
    extras.sort_by(|a, b| a.product_name.cmp(&b.product_name));
    merged.extend(extras.into_iter().cloned());

    merged
}

/// Extract denormalized sheet-level fields from the remote rows: the
/// first row carrying each field wins.
fn globals_from_rows(rows: &[RemoteRow]) -> GlobalFields {
    let mut globals = GlobalFields::default();
    for row in rows {
        if globals.base_cash_box == 0.0 {
            if let Some(v) = row.base_cash_box {
                globals.base_cash_box = v;
            }
        }
        if globals.payment_rows.is_empty() {
            if let Some(v) = &row.payment_rows {
                globals.payment_rows = v.clone();
            }
        }
        if globals.compliance.is_empty() {
            if let Some(v) = &row.compliance {
                globals.compliance = v.clone();
            }
        }
        if globals.batch_registry.is_empty() {
            if let Some(v) = &row.batch_registry {
                globals.batch_registry = v.clone();
            }
        }
    }
    globals
}

/// Fetch, merge, recompute, persist, notify.
///
/// If the catalog is unavailable the merge degrades to exactly the
/// remote rows (no zero-filling) instead of failing outright.
pub async fn merge<R: RemoteLedger>(
    remote: &R,
    db: &DbState,
    catalog: &dyn CatalogProvider,
    key: &SheetKey,
    events: &EventBus,
) -> Result<DailyLedgerSheet> {
    let remote_rows = remote
        .list_rows(&key.sheet_id, &key.weekday, &key.date)
        .await?;

    let catalog_products = match catalog.products_for(&key.sheet_id) {
        Ok(products) => products,
        Err(e) => {
            warn!(sheet = %key, "catalog unavailable, merging remote rows only: {e}");
            Vec::new()
        }
    };

    let merged = merge_rows(&remote_rows, &catalog_products, |product| {
        cache::cached_price(db, product)
            .ok()
            .flatten()
            .map(|c| c.value)
    });

    // Keep the price cache warm from known-good remote prices so a later
    // transient empty read cannot reset a price the field has seen.
    for row in &remote_rows {
        if row.unit_price > 0.0 {
            let _ = cache::cache_price(db, &row.product_name, row.unit_price);
        }
    }
    if let Some(carrier) = remote_rows.iter().find(|r| !r.is_placeholder()) {
        if carrier.seller_name.is_some() || carrier.dispatcher_name.is_some() {
            let _ = cache::cache_responsible(
                db,
                key,
                carrier.seller_name.as_deref(),
                carrier.dispatcher_name.as_deref(),
            );
        }
    }

    let status = cache::read_status(db, key)?;
    let globals = {
        let from_remote = globals_from_rows(&remote_rows);
        if from_remote == GlobalFields::default() {
            // Nothing denormalized remotely yet; keep the local values.
            cache::read_globals(db, key)?
        } else {
            from_remote
        }
    };

    let mut sheet = DailyLedgerSheet {
        key: key.clone(),
        status,
        rows: merged,
        globals,
    };
    sheet.recompute_all();

    cache::write_sheet(db, &sheet)?;
    cache::write_globals(db, key, &sheet.globals)?;
    cache::mark_synced(db, key)?;
    events.emit(LedgerEvent::RowsChanged { key: key.clone() });

    if remote_rows.is_empty() {
        debug!(sheet = %key, rows = sheet.rows.len(), "reconciled from catalog scaffold only");
    } else {
        info!(
            sheet = %key,
            remote_rows = remote_rows.len(),
            merged_rows = sheet.rows.len(),
            "sheet reconciled"
        );
    }

    Ok(sheet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockRemote;
    use crate::catalog::StaticCatalog;
    use crate::db;
    use crate::error::SyncError;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn sheet_key() -> SheetKey {
        SheetKey::new("LUNES", "ID1", "2025-01-06")
    }

    fn remote_row(product: &str, quantity: f64, unit_price: f64) -> RemoteRow {
        RemoteRow {
            id: Some(format!("row-{product}")),
            date: "2025-01-06".into(),
            weekday: "LUNES".into(),
            product_name: product.into(),
            quantity,
            unit_price,
            ..Default::default()
        }
    }

    fn catalog_of(names: &[(&str, f64)]) -> Vec<CatalogProduct> {
        names
            .iter()
            .map(|(name, list_price)| CatalogProduct {
                name: (*name).into(),
                list_price: *list_price,
            })
            .collect()
    }

    #[test]
    fn test_price_fallback_chain_ordering() {
        assert_eq!(pick_unit_price(1600.0, Some(1500.0), 3200.0), 1600.0);
        assert_eq!(pick_unit_price(0.0, Some(1500.0), 3200.0), 1500.0);
        assert_eq!(
            pick_unit_price(0.0, None, 3200.0),
            3200.0 * CATALOG_PRICE_RATIO
        );
        // A cached zero never beats the catalog fraction.
        assert_eq!(
            pick_unit_price(0.0, Some(0.0), 3200.0),
            3200.0 * CATALOG_PRICE_RATIO
        );
    }

    #[test]
    fn test_merge_zero_fills_catalog_gaps() {
        let remote = vec![remote_row("AREPA MEDIANA", 12.0, 1600.0)];
        let catalog = catalog_of(&[
            ("AREPA MEDIANA", 3200.0),
            ("PAN BLANDITO", 1000.0),
            ("QUESO", 6000.0),
        ]);

        let merged = merge_rows(&remote, &catalog, |_| None);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].product_name, "AREPA MEDIANA");
        assert_eq!(merged[0].quantity, 12.0);
        assert_eq!(merged[0].net, 19_200);
        assert_eq!(merged[1].quantity, 0.0);
        assert_eq!(merged[1].unit_price, 1000.0 * CATALOG_PRICE_RATIO);
        assert_eq!(merged[2].net, 0);
    }

    #[test]
    fn test_gap_fill_preserves_local_values() {
        let mut local = ProductLine::zeroed("AREPA MEDIANA", 1600.0);
        local.quantity = 10.0;
        local.recompute();

        let filled = gap_fill_rows(
            &[local],
            &catalog_of(&[("AREPA MEDIANA", 3200.0), ("PAN BLANDITO", 1000.0)]),
            |_| None,
        );
        assert_eq!(filled.len(), 2);
        assert_eq!(filled[0].quantity, 10.0);
        assert_eq!(filled[0].net, 16_000);
        assert_eq!(filled[1].quantity, 0.0);
        assert_eq!(filled[1].unit_price, 1000.0 * CATALOG_PRICE_RATIO);
    }

    #[test]
    fn test_gap_fill_keeps_local_only_rows() {
        let local = ProductLine::zeroed("PRODUCTO RETIRADO", 900.0);
        let filled = gap_fill_rows(&[local], &catalog_of(&[("PAN BLANDITO", 1000.0)]), |_| None);
        assert_eq!(filled.len(), 2);
        assert_eq!(filled[0].product_name, "PAN BLANDITO");
        assert_eq!(filled[1].product_name, "PRODUCTO RETIRADO");
    }

    #[test]
    fn test_merge_recomputes_stale_remote_totals() {
        let mut row = remote_row("AREPA MEDIANA", 12.0, 1600.0);
        row.total = 99.0;
        row.net = 1;

        let merged = merge_rows(&[row], &catalog_of(&[("AREPA MEDIANA", 3200.0)]), |_| None);
        assert_eq!(merged[0].total, 12.0);
        assert_eq!(merged[0].net, 19_200);
    }

    #[test]
    fn test_merge_keeps_remote_rows_unknown_to_catalog() {
        let remote = vec![remote_row("PRODUCTO RETIRADO", 4.0, 900.0)];
        let merged = merge_rows(&remote, &catalog_of(&[("PAN BLANDITO", 1000.0)]), |_| None);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].product_name, "PRODUCTO RETIRADO");
        assert_eq!(merged[1].net, 3_600);
    }

    #[test]
    fn test_merge_uses_cached_price_for_zero_priced_remote_row() {
        let remote = vec![remote_row("AREPA MEDIANA", 5.0, 0.0)];
        let merged = merge_rows(
            &remote,
            &catalog_of(&[("AREPA MEDIANA", 3200.0)]),
            |name| (name == "AREPA MEDIANA").then_some(1600.0),
        );
        assert_eq!(merged[0].unit_price, 1600.0);
        assert_eq!(merged[0].net, 8_000);
    }

    #[tokio::test]
    async fn test_full_merge_persists_and_notifies() {
        let db = test_db();
        let remote = MockRemote::new();
        let key = sheet_key();
        remote.seed_row(remote_row("AREPA MEDIANA", 12.0, 1600.0));

        // 41-product catalog: one populated row, forty zero-filled.
        let mut products = vec![("AREPA MEDIANA".to_string(), 3200.0)];
        for i in 0..40 {
            products.push((format!("PRODUCTO {i}"), 1000.0));
        }
        let catalog = StaticCatalog::new(
            products
                .iter()
                .map(|(name, list_price)| CatalogProduct {
                    name: name.clone(),
                    list_price: *list_price,
                })
                .collect(),
        );

        let events = EventBus::new();
        let notified = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let notified_clone = notified.clone();
        events.subscribe(move |event| {
            if matches!(event, LedgerEvent::RowsChanged { .. }) {
                notified_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let sheet = merge(&remote, &db, &catalog, &key, &events).await.unwrap();
        assert_eq!(sheet.rows.len(), 41);
        assert_eq!(sheet.rows[0].net, 19_200);
        assert_eq!(sheet.rows.iter().filter(|r| r.net == 0).count(), 40);
        assert_eq!(notified.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Persisted and immediately visible.
        let cached = cache::read_sheet(&db, &key).unwrap().expect("cached sheet");
        assert_eq!(cached.rows.len(), 41);
        assert!(cache::last_synced(&db, &key).unwrap().is_some());

        // The remote price warmed the price cache.
        let price = cache::cached_price(&db, "AREPA MEDIANA").unwrap().unwrap();
        assert_eq!(price.value, 1600.0);
    }

    #[tokio::test]
    async fn test_missing_catalog_degrades_to_remote_rows() {
        struct BrokenCatalog;
        impl CatalogProvider for BrokenCatalog {
            fn products_for(&self, _sheet_id: &str) -> crate::error::Result<Vec<CatalogProduct>> {
                Err(SyncError::MissingCatalog("config service down".into()))
            }
        }

        let db = test_db();
        let remote = MockRemote::new();
        let key = sheet_key();
        remote.seed_row(remote_row("AREPA MEDIANA", 12.0, 1600.0));

        let events = EventBus::new();
        let sheet = merge(&remote, &db, &BrokenCatalog, &key, &events)
            .await
            .unwrap();
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.rows[0].product_name, "AREPA MEDIANA");
    }

    #[tokio::test]
    async fn test_merge_extracts_denormalized_globals() {
        let db = test_db();
        let remote = MockRemote::new();
        let key = sheet_key();

        let mut carrier = remote_row("AREPA MEDIANA", 12.0, 1600.0);
        carrier.base_cash_box = Some(50_000.0);
        carrier.batch_registry = Some(vec!["L-204".into()]);
        carrier.seller_name = Some("MARIA".into());
        remote.seed_row(carrier);

        let events = EventBus::new();
        let sheet = merge(
            &remote,
            &db,
            &StaticCatalog::default(),
            &key,
            &events,
        )
        .await
        .unwrap();

        assert_eq!(sheet.globals.base_cash_box, 50_000.0);
        assert_eq!(sheet.globals.batch_registry, vec!["L-204".to_string()]);
        let responsible = cache::cached_responsible(&db, &key).unwrap().unwrap();
        assert_eq!(responsible.value.seller.as_deref(), Some("MARIA"));
    }
}
