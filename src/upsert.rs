//! Idempotent upsert protocol for single-field remote writes.
//!
//! "Search, then patch-or-create": a commit first queries the remote
//! store for the (date, weekday, normalized product) row and patches the
//! one field onto it; only when no row exists is a full default row
//! created. The search step is what makes replaying the same commit safe
//! — it never creates a second row, provided normalization is stable.
//!
//! No local state is touched here; the local cache was already updated
//! at edit time. A failed commit is logged and dropped; the next edit to
//! the field or the next reconciliation pass converges.

use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{RemoteLedger, RemoteRow};
use crate::model::{normalize_product_name, FieldValue, GlobalField, LineField, SheetKey};

/// Result of one commit attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// An existing row was patched (the common path once a row exists).
    Updated { remote_id: String },
    /// No row existed; a full default row carrying the field was created.
    Created { remote_id: String },
    /// Nothing to patch yet (global field with no product row); the local
    /// cache already holds the value, it is pushed once a row exists.
    Deferred,
    /// Network or server error; logged, no retry queue.
    Failed { error: String },
}

/// Build the full default row a create carries: all numerics 0, flags
/// false, price from the fallback, plus the one field being set.
fn default_row(key: &SheetKey, product: &str, field: LineField, value: &FieldValue, fallback_unit_price: f64) -> RemoteRow {
    let mut row = RemoteRow {
        date: key.date.clone(),
        weekday: key.weekday.clone(),
        product_name: product.to_string(),
        unit_price: fallback_unit_price,
        ..Default::default()
    };
    match field {
        LineField::Quantity => row.quantity = value.as_number(),
        LineField::Discounts => row.discounts = value.as_number(),
        LineField::Additions => row.additions = value.as_number(),
        LineField::Returns => row.returns = value.as_number(),
        LineField::Expired => row.expired = value.as_number(),
        LineField::ExpiredLots => row.expired_lots = value.as_lots(),
        LineField::UnitPrice => row.unit_price = value.as_number(),
        LineField::SellerFlag => row.seller_checked = value.as_flag(),
        LineField::DispatcherFlag => row.dispatcher_checked = value.as_flag(),
    }
    row.total = row.quantity - row.discounts + row.additions - row.returns - row.expired;
    row.net = (row.total * row.unit_price).round() as i64;
    row
}

/// Commit one product-line field to the remote store.
pub async fn commit<R: RemoteLedger>(
    remote: &R,
    key: &SheetKey,
    product: &str,
    field: LineField,
    value: &FieldValue,
    fallback_unit_price: f64,
    actor: &str,
) -> CommitOutcome {
    let product = normalize_product_name(product);

    let matches = match remote
        .find_rows(&key.sheet_id, &key.weekday, &key.date, &product)
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!(sheet = %key, %product, field = field.as_str(), "row query failed: {e}");
            return CommitOutcome::Failed {
                error: e.to_string(),
            };
        }
    };

    if let Some(existing) = matches.first() {
        if matches.len() > 1 {
            // The protocol prevents new duplicates but cannot repair old
            // ones; patch the first and leave the rest for cleanup.
            warn!(
                sheet = %key,
                %product,
                count = matches.len(),
                "duplicate remote rows for product; patching the first"
            );
        }
        let Some(remote_id) = existing.id.clone() else {
            return CommitOutcome::Failed {
                error: "remote row is missing an id".to_string(),
            };
        };
        let patch = serde_json::json!({
            field.as_str(): value.to_wire(),
            "updatedBy": actor,
        });
        return match remote.patch_row(&key.sheet_id, &remote_id, &patch).await {
            Ok(_) => {
                debug!(sheet = %key, %product, field = field.as_str(), %remote_id, "row patched");
                CommitOutcome::Updated { remote_id }
            }
            Err(e) => {
                warn!(sheet = %key, %product, field = field.as_str(), "patch failed: {e}");
                CommitOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
    }

    let row = default_row(key, &product, field, value, fallback_unit_price);
    match remote.create_row(&key.sheet_id, &row).await {
        Ok(created) => {
            let remote_id = created.id.unwrap_or_default();
            debug!(sheet = %key, %product, field = field.as_str(), %remote_id, "row created");
            CommitOutcome::Created { remote_id }
        }
        Err(e) => {
            warn!(sheet = %key, %product, field = field.as_str(), "create failed: {e}");
            CommitOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}

/// Commit one sheet-level field.
///
/// Globals are denormalized onto a product row: the first non-placeholder
/// row for the (sheet, date) carries them. With no product row yet the
/// write is deferred — the local cache already holds it, and it is pushed
/// once any product row is created.
pub async fn commit_global_field<R: RemoteLedger>(
    remote: &R,
    key: &SheetKey,
    field: GlobalField,
    value: &FieldValue,
    actor: &str,
) -> CommitOutcome {
    let rows = match remote.list_rows(&key.sheet_id, &key.weekday, &key.date).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(sheet = %key, field = field.as_str(), "row list failed: {e}");
            return CommitOutcome::Failed {
                error: e.to_string(),
            };
        }
    };

    let Some(carrier) = rows.iter().find(|r| !r.is_placeholder()) else {
        debug!(sheet = %key, field = field.as_str(), "no carrier row yet; deferring global write");
        return CommitOutcome::Deferred;
    };
    let Some(remote_id) = carrier.id.clone() else {
        return CommitOutcome::Failed {
            error: "carrier row is missing an id".to_string(),
        };
    };

    let patch = serde_json::json!({
        field.as_str(): value.to_wire(),
        "updatedBy": actor,
    });
    match remote.patch_row(&key.sheet_id, &remote_id, &patch).await {
        Ok(_) => {
            debug!(sheet = %key, field = field.as_str(), %remote_id, "global field patched");
            CommitOutcome::Updated { remote_id }
        }
        Err(e) => {
            warn!(sheet = %key, field = field.as_str(), "global patch failed: {e}");
            CommitOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockRemote;
    use std::sync::atomic::Ordering;

    fn sheet_key() -> SheetKey {
        SheetKey::new("LUNES", "ID1", "2025-01-06")
    }

    #[tokio::test]
    async fn test_first_commit_creates_with_defaults() {
        let remote = MockRemote::new();
        let key = sheet_key();

        let outcome = commit(
            &remote,
            &key,
            "AREPA MEDIANA",
            LineField::Quantity,
            &FieldValue::Number(10.0),
            1600.0,
            "terminal-1",
        )
        .await;

        assert!(matches!(outcome, CommitOutcome::Created { .. }));
        let row = remote.row_for("AREPA MEDIANA").expect("created row");
        assert_eq!(row.quantity, 10.0);
        assert_eq!(row.unit_price, 1600.0);
        assert_eq!(row.discounts, 0.0);
        assert!(!row.seller_checked);
        assert_eq!(row.total, 10.0);
        assert_eq!(row.net, 16_000);
    }

    #[tokio::test]
    async fn test_replayed_commit_is_idempotent() {
        let remote = MockRemote::new();
        let key = sheet_key();

        for _ in 0..2 {
            commit(
                &remote,
                &key,
                "AREPA MEDIANA",
                LineField::Quantity,
                &FieldValue::Number(12.0),
                1600.0,
                "terminal-1",
            )
            .await;
        }

        assert_eq!(remote.row_count(), 1);
        assert_eq!(remote.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(remote.patch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(remote.row_for("AREPA MEDIANA").unwrap().quantity, 12.0);
    }

    #[tokio::test]
    async fn test_inconsistent_whitespace_resolves_to_one_row() {
        let remote = MockRemote::new();
        let key = sheet_key();

        commit(
            &remote,
            &key,
            "AREPA  MEDIANA",
            LineField::Quantity,
            &FieldValue::Number(5.0),
            1600.0,
            "terminal-1",
        )
        .await;
        let outcome = commit(
            &remote,
            &key,
            "AREPA MEDIANA",
            LineField::Discounts,
            &FieldValue::Number(1.0),
            1600.0,
            "terminal-1",
        )
        .await;

        assert!(matches!(outcome, CommitOutcome::Updated { .. }));
        assert_eq!(remote.row_count(), 1);
        let row = remote.row_for("AREPA MEDIANA").unwrap();
        assert_eq!(row.quantity, 5.0);
        assert_eq!(row.discounts, 1.0);
    }

    #[tokio::test]
    async fn test_sibling_fields_converge_regardless_of_order() {
        let remote = MockRemote::new();
        let key = sheet_key();

        // Field B's timer fires before field A's.
        commit(
            &remote,
            &key,
            "PAN BLANDITO",
            LineField::Discounts,
            &FieldValue::Number(2.0),
            500.0,
            "terminal-1",
        )
        .await;
        commit(
            &remote,
            &key,
            "PAN BLANDITO",
            LineField::Quantity,
            &FieldValue::Number(30.0),
            500.0,
            "terminal-1",
        )
        .await;

        let row = remote.row_for("PAN BLANDITO").unwrap();
        assert_eq!(row.quantity, 30.0);
        assert_eq!(row.discounts, 2.0);
        assert_eq!(remote.row_count(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_reports_failed_without_side_effects() {
        let remote = MockRemote::new();
        let key = sheet_key();
        remote.fail_next.store(true, Ordering::SeqCst);

        let outcome = commit(
            &remote,
            &key,
            "QUESO",
            LineField::Quantity,
            &FieldValue::Number(3.0),
            3000.0,
            "terminal-1",
        )
        .await;

        assert!(matches!(outcome, CommitOutcome::Failed { .. }));
        assert_eq!(remote.row_count(), 0);
    }

    #[tokio::test]
    async fn test_global_field_defers_without_carrier_row() {
        let remote = MockRemote::new();
        let key = sheet_key();

        let outcome = commit_global_field(
            &remote,
            &key,
            GlobalField::BaseCashBox,
            &FieldValue::Number(50_000.0),
            "terminal-1",
        )
        .await;
        assert_eq!(outcome, CommitOutcome::Deferred);

        // Once any product row exists, the global patch lands on it.
        commit(
            &remote,
            &key,
            "AREPA MEDIANA",
            LineField::Quantity,
            &FieldValue::Number(1.0),
            1600.0,
            "terminal-1",
        )
        .await;
        let outcome = commit_global_field(
            &remote,
            &key,
            GlobalField::BaseCashBox,
            &FieldValue::Number(50_000.0),
            "terminal-1",
        )
        .await;
        assert!(matches!(outcome, CommitOutcome::Updated { .. }));
        let row = remote.row_for("AREPA MEDIANA").unwrap();
        assert_eq!(row.base_cash_box, Some(50_000.0));
    }
}
