//! Core data model for daily load sheets.
//!
//! A sheet is one vendor's product movements for one day, identified by
//! (weekday, sheetId, date). Rows are product lines keyed by normalized
//! product name; sheet-level fields (cash box, payments, compliance,
//! lot registry) are denormalized onto rows on the remote side but kept
//! as a separate struct locally.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Debounce window for fast-changing structured fields (lot annotations,
/// checkboxes) — short, the value stabilizes quickly.
pub const DEBOUNCE_FAST_MS: u64 = 500;
/// Debounce window for freeform numeric/text fields — longer, so bursts
/// of keystrokes coalesce into a single remote call.
pub const DEBOUNCE_SLOW_MS: u64 = 1_500;

// ---------------------------------------------------------------------------
// Sheet identity and status
// ---------------------------------------------------------------------------

/// Identity of one vendor's daily sheet: uppercase Spanish weekday name
/// (matches the remote store), sheet/route id, and `YYYY-MM-DD` date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SheetKey {
    pub weekday: String,
    pub sheet_id: String,
    pub date: String,
}

impl SheetKey {
    pub fn new(weekday: &str, sheet_id: &str, date: &str) -> Self {
        Self {
            weekday: weekday.trim().to_uppercase(),
            sheet_id: sheet_id.trim().to_string(),
            date: date.trim().to_string(),
        }
    }

    /// Cache key component: `{weekday}_{sheetId}_{date}`.
    pub fn cache_suffix(&self) -> String {
        format!("{}_{}_{}", self.weekday, self.sheet_id, self.date)
    }
}

impl std::fmt::Display for SheetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.sheet_id, self.weekday, self.date)
    }
}

/// Workflow status of a sheet. Progression is monotonic and driven by an
/// external workflow action; the engine only reads it to pick authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SheetStatus {
    /// Stage-1 editing ("alistamiento") — freely editable in the field.
    Alistamiento,
    /// Stage-2 editing ("despacho") — editable; quantity-affecting edits
    /// carry an inventory-adjustment side effect.
    Despacho,
    /// Frozen ("completado") — remote is the source of truth.
    Completado,
}

impl SheetStatus {
    /// Wire name used by the remote store and the local cache.
    pub fn as_str(&self) -> &'static str {
        match self {
            SheetStatus::Alistamiento => "alistamiento",
            SheetStatus::Despacho => "despacho",
            SheetStatus::Completado => "completado",
        }
    }

    /// Parse a stored status string. Unknown values fall back to stage-1
    /// so a garbled cache never locks the user out of editing.
    pub fn parse(raw: &str) -> SheetStatus {
        match raw.trim().to_lowercase().as_str() {
            "despacho" => SheetStatus::Despacho,
            "completado" => SheetStatus::Completado,
            _ => SheetStatus::Alistamiento,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, SheetStatus::Completado)
    }
}

// ---------------------------------------------------------------------------
// Product name normalization
// ---------------------------------------------------------------------------

/// Normalize a product name: trim and collapse internal whitespace runs
/// to a single space, case preserved.
///
/// Row uniqueness per (sheet, date) is defined over this normalized form;
/// the upsert protocol relies on it being stable to stay idempotent.
pub fn normalize_product_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Product lines
// ---------------------------------------------------------------------------

/// One expired-product lot annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiredLot {
    pub lot: String,
    pub reason_code: String,
}

/// One product's quantities and derived totals within a sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductLine {
    pub product_name: String,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub discounts: f64,
    #[serde(default)]
    pub additions: f64,
    #[serde(default)]
    pub returns: f64,
    #[serde(default)]
    pub expired: f64,
    #[serde(default)]
    pub expired_lots: Vec<ExpiredLot>,
    #[serde(default)]
    pub unit_price: f64,
    #[serde(default)]
    pub seller_checked: bool,
    #[serde(default)]
    pub dispatcher_checked: bool,
    /// Derived: quantity - discounts + additions - returns - expired.
    #[serde(default)]
    pub total: f64,
    /// Derived: round(total * unit_price), in whole currency units.
    #[serde(default)]
    pub net: i64,
}

impl ProductLine {
    /// A zero-valued line for a product that has no remote row yet.
    pub fn zeroed(product_name: &str, unit_price: f64) -> Self {
        let mut line = ProductLine {
            product_name: normalize_product_name(product_name),
            quantity: 0.0,
            discounts: 0.0,
            additions: 0.0,
            returns: 0.0,
            expired: 0.0,
            expired_lots: Vec::new(),
            unit_price,
            seller_checked: false,
            dispatcher_checked: false,
            total: 0.0,
            net: 0,
        };
        line.recompute();
        line
    }

    /// Re-derive `total` and `net` from the base quantities. Called after
    /// every mutation path (edit, merge, reconciliation) so the invariants
    /// hold even when remote data arrives stale or partially written.
    pub fn recompute(&mut self) {
        self.total = self.quantity - self.discounts + self.additions - self.returns - self.expired;
        self.net = (self.total * self.unit_price).round() as i64;
    }

    /// Apply one field edit and recompute. Numeric coercion is lenient:
    /// malformed input becomes 0 so the ledger stays computable.
    pub fn apply(&mut self, field: LineField, value: &FieldValue) {
        match field {
            LineField::Quantity => self.quantity = value.as_number(),
            LineField::Discounts => self.discounts = value.as_number(),
            LineField::Additions => self.additions = value.as_number(),
            LineField::Returns => self.returns = value.as_number(),
            LineField::Expired => self.expired = value.as_number(),
            LineField::ExpiredLots => {
                self.expired_lots = value.as_lots();
            }
            LineField::UnitPrice => self.unit_price = value.as_number(),
            LineField::SellerFlag => self.seller_checked = value.as_flag(),
            LineField::DispatcherFlag => self.dispatcher_checked = value.as_flag(),
        }
        self.recompute();
    }
}

/// Editable fields on a product line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineField {
    Quantity,
    Discounts,
    Additions,
    Returns,
    Expired,
    ExpiredLots,
    UnitPrice,
    SellerFlag,
    DispatcherFlag,
}

impl LineField {
    /// Wire name on the remote row (camelCase JSON key).
    pub fn as_str(&self) -> &'static str {
        match self {
            LineField::Quantity => "quantity",
            LineField::Discounts => "discounts",
            LineField::Additions => "additions",
            LineField::Returns => "returns",
            LineField::Expired => "expired",
            LineField::ExpiredLots => "expiredLots",
            LineField::UnitPrice => "unitPrice",
            LineField::SellerFlag => "sellerChecked",
            LineField::DispatcherFlag => "dispatcherChecked",
        }
    }

    /// Debounce window for this field class. Structured fields that
    /// change in one gesture settle fast; typed numerics get a longer
    /// window to coalesce keystroke bursts.
    pub fn debounce_ms(&self) -> u64 {
        match self {
            LineField::ExpiredLots | LineField::SellerFlag | LineField::DispatcherFlag => {
                DEBOUNCE_FAST_MS
            }
            _ => DEBOUNCE_SLOW_MS,
        }
    }

    /// True when an edit to this field changes physical stock and should
    /// trigger an inventory-adjustment side effect during stage-2.
    pub fn affects_inventory(&self) -> bool {
        matches!(
            self,
            LineField::Quantity
                | LineField::Discounts
                | LineField::Additions
                | LineField::Returns
                | LineField::Expired
        )
    }
}

// ---------------------------------------------------------------------------
// Sheet-level (global) fields
// ---------------------------------------------------------------------------

/// Compliance checklist mark: conforme / no conforme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplianceMark {
    C,
    #[serde(rename = "NC")]
    Nc,
}

/// One manual payment/discount row in the sheet footer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRow {
    pub concept: String,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub digital_payment_a: f64,
    #[serde(default)]
    pub digital_payment_b: f64,
}

/// Sheet-level fields, denormalized onto a product row on the remote
/// side but edited and cached as a unit locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GlobalFields {
    #[serde(default)]
    pub base_cash_box: f64,
    #[serde(default)]
    pub payment_rows: Vec<PaymentRow>,
    #[serde(default)]
    pub compliance: BTreeMap<String, ComplianceMark>,
    #[serde(default)]
    pub batch_registry: Vec<String>,
}

impl GlobalFields {
    /// Apply one sheet-level field edit. Structured payloads arrive as
    /// JSON; anything malformed leaves the previous value in place for
    /// lists/maps and clamps numerics to 0.
    pub fn apply(&mut self, field: GlobalField, value: &FieldValue) {
        match field {
            GlobalField::BaseCashBox => self.base_cash_box = value.as_number(),
            GlobalField::PaymentRows => {
                if let FieldValue::Json(v) = value {
                    if let Ok(rows) = serde_json::from_value(v.clone()) {
                        self.payment_rows = rows;
                    }
                }
            }
            GlobalField::Compliance => {
                if let FieldValue::Json(v) = value {
                    if let Ok(map) = serde_json::from_value(v.clone()) {
                        self.compliance = map;
                    }
                }
            }
            GlobalField::BatchRegistry => {
                if let FieldValue::Json(v) = value {
                    if let Ok(lots) = serde_json::from_value(v.clone()) {
                        self.batch_registry = lots;
                    }
                }
            }
        }
    }
}

/// Editable sheet-level fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalField {
    BaseCashBox,
    PaymentRows,
    Compliance,
    BatchRegistry,
}

impl GlobalField {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlobalField::BaseCashBox => "baseCashBox",
            GlobalField::PaymentRows => "paymentRows",
            GlobalField::Compliance => "compliance",
            GlobalField::BatchRegistry => "batchRegistry",
        }
    }

    pub fn debounce_ms(&self) -> u64 {
        match self {
            // Checklist marks and lot registry entries settle in one gesture.
            GlobalField::Compliance | GlobalField::BatchRegistry => DEBOUNCE_FAST_MS,
            _ => DEBOUNCE_SLOW_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// A single field edit's payload. One commit path carries any field
/// type; coercion is lenient so malformed input clamps to a safe zero
/// instead of rejecting the edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Number(f64),
    Text(String),
    Json(Value),
}

impl FieldValue {
    pub fn as_number(&self) -> f64 {
        let n = match self {
            FieldValue::Number(n) => *n,
            FieldValue::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            FieldValue::Flag(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            FieldValue::Json(v) => v.as_f64().unwrap_or(0.0),
        };
        if n.is_finite() {
            n
        } else {
            0.0
        }
    }

    pub fn as_flag(&self) -> bool {
        match self {
            FieldValue::Flag(b) => *b,
            FieldValue::Number(n) => *n != 0.0,
            FieldValue::Text(s) => matches!(s.trim(), "true" | "1"),
            FieldValue::Json(v) => v.as_bool().unwrap_or(false),
        }
    }

    pub fn as_lots(&self) -> Vec<ExpiredLot> {
        match self {
            FieldValue::Json(v) => serde_json::from_value(v.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// JSON wire value sent to the remote store.
    pub fn to_wire(&self) -> Value {
        match self {
            FieldValue::Flag(b) => Value::Bool(*b),
            FieldValue::Number(n) => serde_json::json!(n),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Json(v) => v.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Full sheet
// ---------------------------------------------------------------------------

/// One vendor's daily ledger: ordered product lines (unique by
/// normalized name) plus sheet-level fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyLedgerSheet {
    pub key: SheetKey,
    pub status: SheetStatus,
    pub rows: Vec<ProductLine>,
    #[serde(default)]
    pub globals: GlobalFields,
}

impl DailyLedgerSheet {
    pub fn empty(key: SheetKey) -> Self {
        Self {
            key,
            status: SheetStatus::Alistamiento,
            rows: Vec::new(),
            globals: GlobalFields::default(),
        }
    }

    /// Find a row by normalized product name.
    pub fn row(&self, product: &str) -> Option<&ProductLine> {
        let wanted = normalize_product_name(product);
        self.rows.iter().find(|r| r.product_name == wanted)
    }

    /// Find or lazily create the row for a product. Lines are created
    /// the first time any field is touched and never deleted afterwards.
    pub fn row_mut_or_insert(&mut self, product: &str, fallback_price: f64) -> &mut ProductLine {
        let wanted = normalize_product_name(product);
        if let Some(idx) = self.rows.iter().position(|r| r.product_name == wanted) {
            return &mut self.rows[idx];
        }
        let idx = self.rows.len();
        self.rows.push(ProductLine::zeroed(&wanted, fallback_price));
        &mut self.rows[idx]
    }

    /// Recompute every row's derived totals.
    pub fn recompute_all(&mut self) {
        for row in &mut self.rows {
            row.recompute();
        }
    }
}
