//! Short-link resolution.

use std::sync::Arc;

use checkout_store::{CheckoutStore, ClickOutcome};
use common::Clock;
use domain::{AttributionContext, LinkUnavailableReason, Offer, ShortLink};
use serde::Serialize;

use crate::error::{CheckoutError, Result};
use crate::services::CatalogService;

/// What a successful click resolves to.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub offer: Offer,
    pub attribution_context: AttributionContext,
    pub short_link: ShortLink,
}

/// Converts a short-link code into the offer and attribution context behind it.
pub struct AttributionResolver<S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    store: S,
    catalog: C,
    clock: Arc<dyn Clock>,
}

impl<S, C> AttributionResolver<S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    /// Creates a new resolver.
    pub fn new(store: S, catalog: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    /// Resolves `code`, counting one click.
    ///
    /// The availability gate and the click increment are one store call, so
    /// a link with `max_clicks = n` resolves at most `n` times.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, code: &str) -> Result<Resolution> {
        let now = self.clock.now();

        let short_link = match self.store.record_click(code, now).await? {
            ClickOutcome::Recorded(link) => link,
            ClickOutcome::NotFound => return Err(CheckoutError::not_found("short link", code)),
            ClickOutcome::Unavailable(reason) => return Err(Self::refused(code, reason)),
        };
        metrics::counter!("short_link_clicks_total").increment(1);

        self.expand(short_link).await
    }

    /// Resolves `code` for a checkout without counting a click.
    ///
    /// Revoked and expired links are refused. The click cap is not applied,
    /// since the shopper's click was already counted by [`Self::resolve`].
    #[tracing::instrument(skip(self))]
    pub async fn lookup(&self, code: &str) -> Result<Resolution> {
        let short_link = self
            .store
            .get_short_link(code)
            .await?
            .ok_or_else(|| CheckoutError::not_found("short link", code))?;
        short_link
            .is_usable(self.clock.now())
            .map_err(|reason| Self::refused(code, reason))?;

        self.expand(short_link).await
    }

    fn refused(code: &str, reason: LinkUnavailableReason) -> CheckoutError {
        metrics::counter!("short_link_rejections_total", "reason" => reason.to_string())
            .increment(1);
        tracing::warn!(%reason, "short link refused");
        CheckoutError::LinkUnavailable {
            code: code.to_string(),
            reason,
        }
    }

    async fn expand(&self, short_link: ShortLink) -> Result<Resolution> {
        let attribution_context = self
            .store
            .get_attribution_context(short_link.attribution_context_id)
            .await?
            .ok_or_else(|| {
                CheckoutError::not_found("attribution context", short_link.attribution_context_id)
            })?;

        let offer = self
            .catalog
            .get_offer(short_link.offer_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("offer", short_link.offer_id))?;

        tracing::debug!(
            surface = %attribution_context.surface,
            offer_id = %offer.id,
            clicks = short_link.click_count,
            "short link resolved"
        );

        Ok(Resolution {
            offer,
            attribution_context,
            short_link,
        })
    }
}
