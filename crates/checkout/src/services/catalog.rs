//! Catalog service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{OfferId, VariantId};
use domain::Offer;
use serde::Deserialize;

use crate::error::{CheckoutError, Result};

/// Read-only view of the connected storefront's catalog.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Current stock of a variant, or None if the catalog does not know it.
    async fn get_variant_stock(&self, variant_id: &VariantId) -> Result<Option<u32>>;

    /// Loads an offer.
    async fn get_offer(&self, offer_id: OfferId) -> Result<Option<Offer>>;
}

#[derive(Debug, Default)]
struct InMemoryCatalogState {
    stock: HashMap<VariantId, u32>,
    offers: HashMap<OfferId, Offer>,
    unavailable: bool,
}

/// Catalog seed file contents.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub offers: Vec<Offer>,
    #[serde(default)]
    pub stock: HashMap<String, u32>,
}

/// In-memory catalog for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    state: Arc<RwLock<InMemoryCatalogState>>,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog pre-filled from a seed.
    pub fn from_seed(seed: CatalogSeed) -> Self {
        let catalog = Self::new();
        for offer in seed.offers {
            catalog.put_offer(offer);
        }
        for (variant_id, quantity) in seed.stock {
            catalog.set_stock(variant_id, quantity);
        }
        catalog
    }

    /// Sets the stock snapshot of a variant.
    pub fn set_stock(&self, variant_id: impl Into<VariantId>, quantity: u32) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .stock
            .insert(variant_id.into(), quantity);
    }

    /// Adds or replaces an offer.
    pub fn put_offer(&self, offer: Offer) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .offers
            .insert(offer.id, offer);
    }

    /// Makes every lookup fail, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unavailable = unavailable;
    }
}

#[async_trait]
impl CatalogService for InMemoryCatalog {
    async fn get_variant_stock(&self, variant_id: &VariantId) -> Result<Option<u32>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.unavailable {
            return Err(CheckoutError::Catalog("catalog unavailable".to_string()));
        }
        Ok(state.stock.get(variant_id).copied())
    }

    async fn get_offer(&self, offer_id: OfferId) -> Result<Option<Offer>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.unavailable {
            return Err(CheckoutError::Catalog("catalog unavailable".to_string()));
        }
        Ok(state.offers.get(&offer_id).cloned())
    }
}
