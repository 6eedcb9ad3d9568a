//! Inventory reservations.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{ReservationId, SessionId, VariantId};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// The state of a reservation.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Confirmed ──► Released (completed | cancelled)
///           ├──► Released (cancelled)
///           └──► Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    #[default]
    Pending,
    Confirmed,
    Released,
    Expired,
}

impl ReservationStatus {
    /// Returns true if the reserved quantity still counts against stock.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "released" => Ok(ReservationStatus::Released),
            "expired" => Ok(ReservationStatus::Expired),
            other => Err(ParseError::new("reservation status", other)),
        }
    }
}

/// Why a reservation stopped holding stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Expired,
    Cancelled,
    Completed,
}

impl ReleaseReason {
    /// Returns the reason name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Expired => "expired",
            ReleaseReason::Cancelled => "cancelled",
            ReleaseReason::Completed => "completed",
        }
    }

    /// The status a reservation lands in when released for this reason.
    pub fn terminal_status(&self) -> ReservationStatus {
        match self {
            ReleaseReason::Expired => ReservationStatus::Expired,
            ReleaseReason::Cancelled | ReleaseReason::Completed => ReservationStatus::Released,
        }
    }
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseReason {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expired" => Ok(ReleaseReason::Expired),
            "cancelled" => Ok(ReleaseReason::Cancelled),
            "completed" => Ok(ReleaseReason::Completed),
            other => Err(ParseError::new("release reason", other)),
        }
    }
}

/// An exclusive, time-bounded claim on a quantity of one variant's stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub variant_id: VariantId,
    pub session_id: SessionId,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub release_reason: Option<ReleaseReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// Creates a pending reservation expiring at `expires_at`.
    pub fn pending(
        variant_id: VariantId,
        session_id: SessionId,
        quantity: u32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            variant_id,
            session_id,
            quantity,
            status: ReservationStatus::Pending,
            expires_at,
            release_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once `now` has reached `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns true if the reservation may be confirmed at `now`.
    pub fn is_confirmable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && !self.is_expired_at(now)
    }

    /// Returns true if the reservation still holds stock that a live checkout relies on.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ReservationStatus::Confirmed => true,
            ReservationStatus::Pending => !self.is_expired_at(now),
            ReservationStatus::Released | ReservationStatus::Expired => false,
        }
    }

    /// Returns true if `reason` may release the reservation from its current state.
    ///
    /// A confirmed reservation never lapses on its own; it is handed off on
    /// completion or returned to stock when its session is cancelled.
    pub fn can_release(&self, reason: ReleaseReason) -> bool {
        match self.status {
            ReservationStatus::Pending => true,
            ReservationStatus::Confirmed => reason != ReleaseReason::Expired,
            ReservationStatus::Released | ReservationStatus::Expired => false,
        }
    }

    /// Marks the reservation confirmed.
    pub fn confirm(&mut self, now: DateTime<Utc>) {
        self.status = ReservationStatus::Confirmed;
        self.updated_at = now;
    }

    /// Marks the reservation released for `reason`.
    pub fn release(&mut self, reason: ReleaseReason, now: DateTime<Utc>) {
        self.status = reason.terminal_status();
        self.release_reason = Some(reason);
        self.updated_at = now;
    }
}
