//! Issuing and revoking short links.

use std::sync::Arc;

use checkout_store::{CheckoutStore, StoreError};
use chrono::{DateTime, Utc};
use common::{Clock, CreatorId, OfferId};
use domain::{AttributionContext, ShortLink};
use rand::Rng;
use serde::Deserialize;

use crate::error::{CheckoutError, Result};
use crate::services::CatalogService;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Length of generated codes.
pub const CODE_LEN: usize = 7;

const MAX_CODE_ATTEMPTS: u32 = 5;
const VANITY_LEN: std::ops::RangeInclusive<usize> = 3..=64;

/// Optional settings for a new link.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkOptions {
    /// Vanity code; generated when absent.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_clicks: Option<u32>,
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn validate_vanity(code: &str) -> Result<()> {
    let well_formed = VANITY_LEN.contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(CheckoutError::InvalidRequest(format!(
            "code {code:?} must be 3 to 64 characters of [A-Za-z0-9_-]"
        )))
    }
}

/// Creates short links on behalf of creators.
pub struct ShortLinkService<S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    store: S,
    catalog: C,
    clock: Arc<dyn Clock>,
}

impl<S, C> ShortLinkService<S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    /// Creates a new link service.
    pub fn new(store: S, catalog: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    /// Issues a link to `offer_id`, recording `attribution` as its origin.
    #[tracing::instrument(skip(self, attribution, options), fields(surface = %attribution.surface))]
    pub async fn create(
        &self,
        creator_id: CreatorId,
        offer_id: OfferId,
        attribution: AttributionContext,
        options: LinkOptions,
    ) -> Result<ShortLink> {
        let now = self.clock.now();

        if attribution.creator_id != creator_id {
            return Err(CheckoutError::InvalidRequest(
                "attribution context belongs to another creator".to_string(),
            ));
        }
        if options.max_clicks == Some(0) {
            return Err(CheckoutError::InvalidRequest(
                "max_clicks must be greater than 0".to_string(),
            ));
        }
        if options.expires_at.is_some_and(|at| at <= now) {
            return Err(CheckoutError::InvalidRequest(
                "expires_at must be in the future".to_string(),
            ));
        }
        if let Some(code) = &options.code {
            validate_vanity(code)?;
        }

        let offer = self
            .catalog
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("offer", offer_id))?;
        if offer.creator_id != creator_id {
            return Err(CheckoutError::InvalidRequest(format!(
                "offer {offer_id} belongs to another creator"
            )));
        }

        let attribution_context_id = attribution.id;
        self.store.insert_attribution_context(attribution).await?;

        let build = |code: String| {
            let mut link = ShortLink::new(code, creator_id, offer_id, attribution_context_id, now);
            link.expires_at = options.expires_at;
            link.max_clicks = options.max_clicks;
            link
        };

        let link = match &options.code {
            Some(code) => {
                let link = build(code.clone());
                match self.store.insert_short_link(link.clone()).await {
                    Ok(()) => link,
                    Err(StoreError::DuplicateKey(_)) => {
                        return Err(CheckoutError::InvalidRequest(format!(
                            "code {code} is already taken"
                        )));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => self.insert_generated(build).await?,
        };

        metrics::counter!("short_links_created_total").increment(1);
        tracing::info!(code = %link.code, "short link created");
        Ok(link)
    }

    async fn insert_generated(&self, build: impl Fn(String) -> ShortLink) -> Result<ShortLink> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let link = build(generate_code());
            match self.store.insert_short_link(link.clone()).await {
                Ok(()) => return Ok(link),
                Err(StoreError::DuplicateKey(_)) => {
                    tracing::debug!(attempt, "short link code collision");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Corrupt(format!(
            "no free short link code after {MAX_CODE_ATTEMPTS} attempts"
        ))
        .into())
    }

    /// Loads a link without counting a click.
    pub async fn get(&self, code: &str) -> Result<ShortLink> {
        self.store
            .get_short_link(code)
            .await?
            .ok_or_else(|| CheckoutError::not_found("short link", code))
    }

    /// Revokes a link. Revoking twice is harmless.
    #[tracing::instrument(skip(self))]
    pub async fn revoke(&self, code: &str) -> Result<ShortLink> {
        let link = self
            .store
            .revoke_short_link(code, self.clock.now())
            .await?
            .ok_or_else(|| CheckoutError::not_found("short link", code))?;
        tracing::info!("short link revoked");
        Ok(link)
    }
}
