//! Offline-first synchronization engine for daily vendor load sheets.
//!
//! Keeps a per-vendor, per-day ledger of product movements consistent
//! between a fast local SQLite cache and a remote system of record,
//! under intermittent connectivity and concurrent edits from multiple
//! terminals. Edits land in the local cache synchronously, are debounced
//! per (row, field), and converge remotely through an idempotent
//! search-then-patch-or-create upsert. Once a sheet's workflow freezes
//! it, the remote store becomes the source of truth and loads go
//! through catalog-aware reconciliation.
//!
//! The crate has no command-line surface; it is driven entirely by the
//! UI layer's lifecycle events through [`engine::SyncEngine`].

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod authority;
pub mod cache;
pub mod catalog;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod reconcile;
pub mod refresher;
pub mod scheduler;
pub mod state;
pub mod upsert;

pub use api::{ApiClient, RemoteLedger};
pub use engine::{EditReceipt, SyncEngine};
pub use error::{Result, SyncError};
pub use events::{EventBus, LedgerEvent, PaymentTotals};
pub use model::{
    DailyLedgerSheet, FieldValue, GlobalField, GlobalFields, LineField, ProductLine, SheetKey,
    SheetStatus,
};

/// Initialize structured logging (console + rolling file).
///
/// Returns the appender guard; drop it and buffered file output is lost.
pub fn init_tracing(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,loadsheet_sync=debug"));

    let file_appender = tracing_appender::rolling::daily(log_dir, "loadsheet");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().json().with_writer(non_blocking))
        .init();

    guard
}
