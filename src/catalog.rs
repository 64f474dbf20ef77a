//! Product catalog seam.
//!
//! The canonical catalog (which products a sheet carries and their list
//! prices) is an external collaborator; the engine consumes it through
//! this trait so reconciliation can zero-fill gaps and complete the
//! price fallback chain.

use crate::error::Result;

/// Fraction of catalog list price used as the last resort of the price
/// fallback chain when neither a remote nor a cached unit price exists.
/// Vendor unit prices run at roughly half of list.
pub const CATALOG_PRICE_RATIO: f64 = 0.5;

/// One catalog entry relevant to a sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogProduct {
    pub name: String,
    pub list_price: f64,
}

/// Source of the canonical product catalog for a sheet.
pub trait CatalogProvider: Send + Sync {
    /// Products this sheet carries, in display order. An error means the
    /// catalog is unavailable; reconciliation then degrades to showing
    /// exactly what remote/local holds instead of failing.
    fn products_for(&self, sheet_id: &str) -> Result<Vec<CatalogProduct>>;
}

/// Fixed in-memory catalog, useful for tests and static configurations.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    pub products: Vec<CatalogProduct>,
}

impl StaticCatalog {
    pub fn new(products: Vec<CatalogProduct>) -> Self {
        Self { products }
    }
}

impl CatalogProvider for StaticCatalog {
    fn products_for(&self, _sheet_id: &str) -> Result<Vec<CatalogProduct>> {
        Ok(self.products.clone())
    }
}
