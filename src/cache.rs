//! Local cache layer for load sheet state.
//!
//! A synchronous key-value store over SQLite: writes are immediately
//! visible to readers in the same process, and an edit is never lost to
//! a failed remote call because it lands here first. Keys follow the
//! `{kind}_{weekday}_{sheetId}_{date}` scheme. Two side caches (unit
//! prices, responsible-party names) carry timestamps and are treated as
//! stale after a fixed window; stale values are still served while a
//! refresh is attempted (stale-while-revalidate).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::warn;

use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::model::{normalize_product_name, DailyLedgerSheet, GlobalFields, SheetKey, SheetStatus};

/// Staleness window for the timestamped side caches.
pub const STALE_AFTER_MINUTES: i64 = 5;

/// A value read from a timestamped cache scope, with its staleness bit.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub is_stale: bool,
}

/// Cached seller/dispatcher names for one sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsibleParties {
    pub seller: Option<String>,
    pub dispatcher: Option<String>,
}

fn cache_key(kind: &str, key: &SheetKey) -> String {
    format!("{}_{}", kind, key.cache_suffix())
}

fn is_stale(updated_at: &str) -> bool {
    match DateTime::parse_from_rfc3339(updated_at) {
        Ok(ts) => Utc::now() - ts.with_timezone(&Utc) > ChronoDuration::minutes(STALE_AFTER_MINUTES),
        Err(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Raw key-value access
// ---------------------------------------------------------------------------

fn write_raw(db: &DbState, key: &str, value: &Value) -> Result<()> {
    let conn = db.conn.lock().map_err(|e| SyncError::Db(e.to_string()))?;
    let json = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO local_cache (cache_key, data, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(cache_key) DO UPDATE SET
            data = excluded.data,
            updated_at = excluded.updated_at",
        params![key, json, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn read_raw(db: &DbState, key: &str) -> Result<Option<Value>> {
    let conn = db.conn.lock().map_err(|e| SyncError::Db(e.to_string()))?;
    let json: Option<String> = conn
        .query_row(
            "SELECT data FROM local_cache WHERE cache_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    match json {
        Some(s) => match serde_json::from_str(&s) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                // A corrupt entry behaves like a miss; reconciliation rebuilds it.
                warn!(cache_key = key, "local_cache entry is not valid JSON: {e}");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Sheet state
// ---------------------------------------------------------------------------

/// Persist the full merged sheet (rows + globals) under the `ledger` kind.
pub fn write_sheet(db: &DbState, sheet: &DailyLedgerSheet) -> Result<()> {
    write_raw(db, &cache_key("ledger", &sheet.key), &serde_json::to_value(sheet)?)
}

/// Read the cached sheet, or `None` when this (sheet, date) has never
/// been edited or reconciled on this terminal.
pub fn read_sheet(db: &DbState, key: &SheetKey) -> Result<Option<DailyLedgerSheet>> {
    match read_raw(db, &cache_key("ledger", key))? {
        Some(v) => match serde_json::from_value::<DailyLedgerSheet>(v) {
            Ok(sheet) => Ok(Some(sheet)),
            Err(e) => {
                warn!(sheet = %key, "cached sheet failed to deserialize: {e}");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

/// Persist the workflow status under the `status` kind.
pub fn write_status(db: &DbState, key: &SheetKey, status: SheetStatus) -> Result<()> {
    write_raw(
        db,
        &cache_key("status", key),
        &Value::String(status.as_str().to_string()),
    )
}

/// Read the cached workflow status; absent defaults to stage-1 editing.
pub fn read_status(db: &DbState, key: &SheetKey) -> Result<SheetStatus> {
    Ok(match read_raw(db, &cache_key("status", key))? {
        Some(Value::String(s)) => SheetStatus::parse(&s),
        _ => SheetStatus::Alistamiento,
    })
}

/// Persist sheet-level fields under the `globals` kind.
pub fn write_globals(db: &DbState, key: &SheetKey, globals: &GlobalFields) -> Result<()> {
    write_raw(db, &cache_key("globals", key), &serde_json::to_value(globals)?)
}

/// Read cached sheet-level fields; absent yields defaults.
pub fn read_globals(db: &DbState, key: &SheetKey) -> Result<GlobalFields> {
    Ok(match read_raw(db, &cache_key("globals", key))? {
        Some(v) => serde_json::from_value(v).unwrap_or_default(),
        None => GlobalFields::default(),
    })
}

// ---------------------------------------------------------------------------
// Unit price cache (timestamped)
// ---------------------------------------------------------------------------

/// Remember a known-good unit price for a product. Only positive prices
/// are worth caching — a zero would poison the fallback chain.
pub fn cache_price(db: &DbState, product: &str, unit_price: f64) -> Result<()> {
    if unit_price <= 0.0 {
        return Ok(());
    }
    let conn = db.conn.lock().map_err(|e| SyncError::Db(e.to_string()))?;
    conn.execute(
        "INSERT INTO price_cache (product_name, unit_price, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(product_name) DO UPDATE SET
            unit_price = excluded.unit_price,
            updated_at = excluded.updated_at",
        params![
            normalize_product_name(product),
            unit_price,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Last known unit price for a product, with its staleness bit. A stale
/// price is still served; the caller decides whether to refresh.
pub fn cached_price(db: &DbState, product: &str) -> Result<Option<Cached<f64>>> {
    let conn = db.conn.lock().map_err(|e| SyncError::Db(e.to_string()))?;
    let row: Option<(f64, String)> = conn
        .query_row(
            "SELECT unit_price, updated_at FROM price_cache WHERE product_name = ?1",
            params![normalize_product_name(product)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(row.map(|(unit_price, updated_at)| Cached {
        value: unit_price,
        is_stale: is_stale(&updated_at),
    }))
}

// ---------------------------------------------------------------------------
// Responsible-party cache (timestamped)
// ---------------------------------------------------------------------------

/// Remember who sold and who dispatched for a sheet.
pub fn cache_responsible(
    db: &DbState,
    key: &SheetKey,
    seller: Option<&str>,
    dispatcher: Option<&str>,
) -> Result<()> {
    let conn = db.conn.lock().map_err(|e| SyncError::Db(e.to_string()))?;
    conn.execute(
        "INSERT INTO responsible_cache (sheet_key, seller_name, dispatcher_name, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(sheet_key) DO UPDATE SET
            seller_name = COALESCE(excluded.seller_name, seller_name),
            dispatcher_name = COALESCE(excluded.dispatcher_name, dispatcher_name),
            updated_at = excluded.updated_at",
        params![
            key.cache_suffix(),
            seller,
            dispatcher,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Cached responsible parties for a sheet, with staleness.
pub fn cached_responsible(
    db: &DbState,
    key: &SheetKey,
) -> Result<Option<Cached<ResponsibleParties>>> {
    let conn = db.conn.lock().map_err(|e| SyncError::Db(e.to_string()))?;
    let row: Option<(Option<String>, Option<String>, String)> = conn
        .query_row(
            "SELECT seller_name, dispatcher_name, updated_at
             FROM responsible_cache WHERE sheet_key = ?1",
            params![key.cache_suffix()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    Ok(row.map(|(seller, dispatcher, updated_at)| Cached {
        value: ResponsibleParties { seller, dispatcher },
        is_stale: is_stale(&updated_at),
    }))
}

// ---------------------------------------------------------------------------
// Sync timestamps
// ---------------------------------------------------------------------------

/// Record that a sheet was reconciled against the remote store just now.
pub fn mark_synced(db: &DbState, key: &SheetKey) -> Result<()> {
    let conn = db.conn.lock().map_err(|e| SyncError::Db(e.to_string()))?;
    conn.execute(
        "INSERT INTO sheet_sync_meta (sheet_key, last_synced_at)
         VALUES (?1, ?2)
         ON CONFLICT(sheet_key) DO UPDATE SET
            last_synced_at = excluded.last_synced_at",
        params![key.cache_suffix(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Whether the sheet's last reconcile is beyond the staleness window,
/// or has never happened. A stale sheet is still served from the cache;
/// the refresher uses this to attempt an opportunistic reconcile.
pub fn is_sheet_stale(db: &DbState, key: &SheetKey) -> Result<bool> {
    Ok(match last_synced(db, key)? {
        Some(ts) => Utc::now() - ts > ChronoDuration::minutes(STALE_AFTER_MINUTES),
        None => true,
    })
}

/// When this sheet was last reconciled, if ever.
pub fn last_synced(db: &DbState, key: &SheetKey) -> Result<Option<DateTime<Utc>>> {
    let conn = db.conn.lock().map_err(|e| SyncError::Db(e.to_string()))?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT last_synced_at FROM sheet_sync_meta WHERE sheet_key = ?1",
            params![key.cache_suffix()],
            |row| row.get(0),
        )
        .optional()?;

    Ok(raw
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|ts| ts.with_timezone(&Utc)))
}
