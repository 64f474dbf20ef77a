//! Authority decisions over the sheet workflow status.
//!
//! The workflow moves alistamiento → despacho → completado; the frozen
//! transition is set by an external action and is one-directional per
//! (sheet, date). This module only reads the status and answers which
//! side — local cache or remote store — is trusted for reads and writes.

use crate::model::{LineField, SheetStatus};

/// Which side is treated as correct at a given time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Local,
    Remote,
}

/// Where a load for this sheet should source its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Local cache, falling back to an empty scaffold from the catalog.
    LocalCache,
    /// Remote merge (reconciliation).
    RemoteMerge,
}

/// Who may write while the sheet is in `status`.
pub fn write_authority(status: SheetStatus) -> Authority {
    match status {
        SheetStatus::Alistamiento | SheetStatus::Despacho => Authority::Local,
        SheetStatus::Completado => Authority::Remote,
    }
}

/// Whether local field edits are accepted at all.
pub fn can_edit_locally(status: SheetStatus) -> bool {
    write_authority(status) == Authority::Local
}

/// Which side a fresh load reads from.
pub fn load_source(status: SheetStatus) -> LoadSource {
    match status {
        SheetStatus::Alistamiento | SheetStatus::Despacho => LoadSource::LocalCache,
        SheetStatus::Completado => LoadSource::RemoteMerge,
    }
}

/// Whether the sheet view is incomplete and due for reconciliation:
/// the local view holds fewer rows than the catalog knows products
/// (cheap completeness check). Sheets are created implicitly on first
/// edit, so an editable sheet can legitimately sit at one row against
/// a full catalog until a load completes it.
pub fn needs_remerge(local_rows: usize, catalog_len: usize) -> bool {
    if catalog_len == 0 {
        return false;
    }
    local_rows < catalog_len
}

/// Whether an edit to `field` during `status` should raise an
/// inventory-adjustment side effect. Only quantity-affecting fields
/// during stage-2 (despacho) move physical stock.
pub fn triggers_inventory_adjustment(status: SheetStatus, field: LineField) -> bool {
    status == SheetStatus::Despacho && field.affects_inventory()
}
