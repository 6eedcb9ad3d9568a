//! Short links issued by creators.

use chrono::{DateTime, Utc};
use common::{AttributionContextId, CreatorId, OfferId, ShortLinkId};
use serde::{Deserialize, Serialize};

/// Why a short link refused to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkUnavailableReason {
    Revoked,
    Expired,
    ClickLimitReached,
}

impl std::fmt::Display for LinkUnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkUnavailableReason::Revoked => "revoked",
            LinkUnavailableReason::Expired => "expired",
            LinkUnavailableReason::ClickLimitReached => "click limit reached",
        };
        f.write_str(s)
    }
}

/// Maps a public code to an offer and the attribution context that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortLink {
    pub id: ShortLinkId,
    pub code: String,
    pub creator_id: CreatorId,
    pub offer_id: OfferId,
    pub attribution_context_id: AttributionContextId,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub max_clicks: Option<u32>,
    pub click_count: u32,
    pub last_clicked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ShortLink {
    /// Creates a fresh, never-clicked link.
    pub fn new(
        code: impl Into<String>,
        creator_id: CreatorId,
        offer_id: OfferId,
        attribution_context_id: AttributionContextId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ShortLinkId::new(),
            code: code.into(),
            creator_id,
            offer_id,
            attribution_context_id,
            expires_at: None,
            revoked: false,
            revoked_at: None,
            max_clicks: None,
            click_count: 0,
            last_clicked_at: None,
            created_at,
        }
    }

    /// Check if the link is past its expiry.
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Check if the link has used up its click allowance.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.max_clicks
            .is_some_and(|max_clicks| self.click_count >= max_clicks)
    }

    /// Returns `Ok` while the link is neither revoked nor expired at `now`.
    ///
    /// Ignores the click cap: a checkout started from an already counted
    /// click passes this gate even when that click used the last slot.
    pub fn is_usable(&self, now: DateTime<Utc>) -> Result<(), LinkUnavailableReason> {
        if self.revoked {
            return Err(LinkUnavailableReason::Revoked);
        }
        if self.is_expired(now) {
            return Err(LinkUnavailableReason::Expired);
        }
        Ok(())
    }

    /// Returns `Ok` when one more click may resolve at `now`.
    pub fn availability(&self, now: DateTime<Utc>) -> Result<(), LinkUnavailableReason> {
        self.is_usable(now)?;
        if self.is_exhausted() {
            return Err(LinkUnavailableReason::ClickLimitReached);
        }
        Ok(())
    }

    /// Counts a successful resolution.
    ///
    /// Callers must have checked [`ShortLink::availability`] inside the same
    /// atomic unit.
    pub fn record_click(&mut self, now: DateTime<Utc>) {
        self.click_count = self.click_count.saturating_add(1);
        self.last_clicked_at = Some(now);
    }

    /// Marks the link revoked. Returns false if it already was.
    pub fn revoke(&mut self, now: DateTime<Utc>) -> bool {
        if self.revoked {
            return false;
        }
        self.revoked = true;
        self.revoked_at = Some(now);
        true
    }
}
