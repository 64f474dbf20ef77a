//! Remote ledger service client.
//!
//! Provides authenticated HTTP access to the system of record behind a
//! narrow contract: query rows for a sheet/day, patch one row, create
//! one row, and read sale records for payment totals. The contract is
//! expressed as the [`RemoteLedger`] trait so the upsert and
//! reconciliation paths can be exercised against an in-memory fake.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::{ComplianceMark, ExpiredLot, PaymentRow};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One product row as stored by the remote service. Sheet-level fields
/// (cash box, payments, compliance, lot registry) are denormalized onto
/// rows, so they appear here as optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub date: String,
    pub weekday: String,
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
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub net: i64,
    // Denormalized sheet-level fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_cash_box: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_rows: Option<Vec<PaymentRow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<BTreeMap<String, ComplianceMark>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_registry: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatcher_name: Option<String>,
}

impl RemoteRow {
    /// A placeholder row carries no product; global-field patches must
    /// land on a real product row instead.
    pub fn is_placeholder(&self) -> bool {
        self.product_name.trim().is_empty()
    }
}

/// One order/sale record for a date, consumed read-only to derive
/// payment totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleRecord {
    pub id: String,
    pub date: String,
    #[serde(default)]
    pub total_amount: f64,
    #[serde(default)]
    pub payment_method: String,
    #[serde(default)]
    pub status: String,
}

// ---------------------------------------------------------------------------
// Remote contract
// ---------------------------------------------------------------------------

/// The narrow upsert/query contract the engine consumes. Implemented by
/// [`ApiClient`] for production and by an in-memory fake in tests.
pub trait RemoteLedger: Send + Sync {
    /// Rows matching (date, weekday, normalized product) for a sheet.
    /// 0 or 1 expected; duplicates are a residual-risk signal.
    fn find_rows(
        &self,
        sheet_id: &str,
        weekday: &str,
        date: &str,
        product: &str,
    ) -> impl Future<Output = Result<Vec<RemoteRow>>> + Send;

    /// All rows for a sheet/day.
    fn list_rows(
        &self,
        sheet_id: &str,
        weekday: &str,
        date: &str,
    ) -> impl Future<Output = Result<Vec<RemoteRow>>> + Send;

    /// Apply a partial field map to one row.
    fn patch_row(
        &self,
        sheet_id: &str,
        row_id: &str,
        patch: &Value,
    ) -> impl Future<Output = Result<RemoteRow>> + Send;

    /// Create a full row; the service assigns the id.
    fn create_row(
        &self,
        sheet_id: &str,
        row: &RemoteRow,
    ) -> impl Future<Output = Result<RemoteRow>> + Send;

    /// Sale records for a date (payment totals, read-only).
    fn sales_for_date(&self, date: &str) -> impl Future<Output = Result<Vec<SaleRecord>>> + Send;
}

// ---------------------------------------------------------------------------
// URL normalisation and error mapping
// ---------------------------------------------------------------------------

/// Normalise the ledger service URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_connect() {
        return SyncError::Network(format!("Cannot reach ledger service at {url}"));
    }
    if err.is_timeout() {
        return SyncError::Network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return SyncError::Network(format!("Invalid ledger service URL: {url}"));
    }
    SyncError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Ledger service endpoint not found".to_string(),
        s if s >= 500 => format!("Ledger service server error (HTTP {s})"),
        s => format!("Unexpected response from ledger service (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Authenticated client for the remote ledger service.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let api_key = api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(SyncError::NotConfigured("missing API key".into()));
        }
        let base_url = normalize_base_url(base_url);
        if base_url.is_empty() {
            return Err(SyncError::NotConfigured("missing ledger service URL".into()));
        }
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let full_url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-Ledger-API-Key", &self.api_key)
            .header("Content-Type", "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();

        if !status.is_success() {
            // Preserve service-provided detail for diagnostics.
            let body_text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|json| {
                    json.get("error")
                        .or_else(|| json.get("message"))
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                })
                .unwrap_or_else(|| status_message(status));
            return Err(SyncError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        // Return the JSON body, or null for empty 204 responses.
        let body_text = resp.text().await.unwrap_or_default();
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| SyncError::Network(format!("Invalid JSON from ledger service: {e}")))
    }

    fn rows_from(value: Value) -> Result<Vec<RemoteRow>> {
        // Accept both a bare array and a `{ rows: [...] }` wrapper.
        let arr = match value {
            Value::Array(a) => Value::Array(a),
            Value::Object(mut o) => o.remove("rows").unwrap_or(Value::Array(Vec::new())),
            _ => Value::Array(Vec::new()),
        };
        Ok(serde_json::from_value(arr)?)
    }
}

impl RemoteLedger for ApiClient {
    fn find_rows(
        &self,
        sheet_id: &str,
        weekday: &str,
        date: &str,
        product: &str,
    ) -> impl Future<Output = Result<Vec<RemoteRow>>> + Send {
        let path = format!("/api/sheets/{sheet_id}/rows");
        let weekday = weekday.to_string();
        let date = date.to_string();
        let product = product.to_string();
        async move {
            debug!(sheet = sheet_id, %date, %product, "querying rows by product");
            let value = self
                .request(
                    reqwest::Method::GET,
                    &path,
                    &[
                        ("date", date.as_str()),
                        ("weekday", weekday.as_str()),
                        ("product", product.as_str()),
                    ],
                    None,
                )
                .await?;
            Self::rows_from(value)
        }
    }

    fn list_rows(
        &self,
        sheet_id: &str,
        weekday: &str,
        date: &str,
    ) -> impl Future<Output = Result<Vec<RemoteRow>>> + Send {
        let path = format!("/api/sheets/{sheet_id}/rows");
        let weekday = weekday.to_string();
        let date = date.to_string();
        async move {
            let value = self
                .request(
                    reqwest::Method::GET,
                    &path,
                    &[("date", date.as_str()), ("weekday", weekday.as_str())],
                    None,
                )
                .await?;
            Self::rows_from(value)
        }
    }

    fn patch_row(
        &self,
        sheet_id: &str,
        row_id: &str,
        patch: &Value,
    ) -> impl Future<Output = Result<RemoteRow>> + Send {
        let path = format!("/api/sheets/{sheet_id}/rows/{row_id}");
        let patch = patch.clone();
        async move {
            let value = self
                .request(reqwest::Method::PATCH, &path, &[], Some(&patch))
                .await?;
            Ok(serde_json::from_value(value)?)
        }
    }

    fn create_row(
        &self,
        sheet_id: &str,
        row: &RemoteRow,
    ) -> impl Future<Output = Result<RemoteRow>> + Send {
        let path = format!("/api/sheets/{sheet_id}/rows");
        let body = serde_json::to_value(row);
        async move {
            let value = self
                .request(reqwest::Method::POST, &path, &[], Some(&body?))
                .await?;
            Ok(serde_json::from_value(value)?)
        }
    }

    fn sales_for_date(&self, date: &str) -> impl Future<Output = Result<Vec<SaleRecord>>> + Send {
        let date = date.to_string();
        async move {
            let value = self
                .request(
                    reqwest::Method::GET,
                    "/api/sales",
                    &[("date", date.as_str())],
                    None,
                )
                .await?;
            let arr = match value {
                Value::Array(a) => Value::Array(a),
                Value::Object(mut o) => o.remove("sales").unwrap_or(Value::Array(Vec::new())),
                _ => Value::Array(Vec::new()),
            };
            Ok(serde_json::from_value(arr)?)
        }
    }
}

// ---------------------------------------------------------------------------
// Test fake
// ---------------------------------------------------------------------------
