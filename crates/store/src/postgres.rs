use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    AttributionContextId, ConnectionId, CreatorId, OfferId, ReservationId, SessionId, ShortLinkId,
    VariantId,
};
use domain::{
    AttributionContext, CheckoutSession, Currency, LineItem, LinkUnavailableReason, Money,
    ReleaseReason, Reservation, ReservationStatus, SessionStatus, ShortLink,
};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{
        CheckoutStore, ClaimOutcome, ClaimState, ClickOutcome, ConfirmOutcome, IdempotencyClaim,
        ReleaseOutcome, ReserveOutcome, SessionTransition,
    },
};

/// Advisory lock namespace serializing stock checks per variant.
const VARIANT_LOCK_NAMESPACE: i32 = 0x5641;

const LINK_COLUMNS: &str = "id, code, creator_id, offer_id, attribution_context_id, expires_at, \
     revoked, revoked_at, max_clicks, click_count, last_clicked_at, created_at";

const SESSION_COLUMNS: &str = "id, creator_id, idempotency_key, short_link_id, \
     attribution_context_id, offer_id, connection_id, status, line_items, subtotal_cents, \
     discount_cents, total_cents, currency, reservation_ids, external_order_ref, cancel_reason, \
     created_at, updated_at, expires_at, closed_at";

const RESERVATION_COLUMNS: &str = "id, variant_id, session_id, quantity, status, expires_at, \
     release_reason, created_at, updated_at";

/// PostgreSQL-backed checkout store.
///
/// Each trait method runs in its own transaction. Row locks (`FOR UPDATE`)
/// guard existing rows; a transaction-scoped advisory lock per variant guards
/// the stock check, where there is no single row to lock.
#[derive(Clone)]
pub struct PostgresCheckoutStore {
    pool: PgPool,
}

impl PostgresCheckoutStore {
    /// Creates a new PostgreSQL checkout store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_context(row: PgRow) -> Result<AttributionContext> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;
        let surface: String = row.try_get("surface")?;

        Ok(AttributionContext {
            id: AttributionContextId::from_uuid(row.try_get("id")?),
            creator_id: CreatorId::from_uuid(row.try_get("creator_id")?),
            surface: surface.parse()?,
            platform: row.try_get("platform")?,
            live_session_id: row.try_get("live_session_id")?,
            stream_id: row.try_get("stream_id")?,
            replay_id: row.try_get("replay_id")?,
            moment_id: row.try_get("moment_id")?,
            campaign: row.try_get("campaign")?,
            source: row.try_get("source")?,
            medium: row.try_get("medium")?,
            metadata,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_link(row: PgRow) -> Result<ShortLink> {
        let max_clicks: Option<i32> = row.try_get("max_clicks")?;
        let click_count: i32 = row.try_get("click_count")?;

        Ok(ShortLink {
            id: ShortLinkId::from_uuid(row.try_get("id")?),
            code: row.try_get("code")?,
            creator_id: CreatorId::from_uuid(row.try_get("creator_id")?),
            offer_id: OfferId::from_uuid(row.try_get("offer_id")?),
            attribution_context_id: AttributionContextId::from_uuid(
                row.try_get("attribution_context_id")?,
            ),
            expires_at: row.try_get("expires_at")?,
            revoked: row.try_get("revoked")?,
            revoked_at: row.try_get("revoked_at")?,
            max_clicks: max_clicks.map(from_i32).transpose()?,
            click_count: from_i32(click_count)?,
            last_clicked_at: row.try_get("last_clicked_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_claim(row: PgRow) -> Result<IdempotencyClaim> {
        let state: String = row.try_get("state")?;
        let state = match state.as_str() {
            "in_progress" => ClaimState::InProgress,
            "completed" => ClaimState::Completed,
            other => return Err(StoreError::Corrupt(format!("unknown claim state {other}"))),
        };

        Ok(IdempotencyClaim {
            key: row.try_get("idempotency_key")?,
            creator_id: CreatorId::from_uuid(row.try_get("creator_id")?),
            session_id: SessionId::from_uuid(row.try_get("session_id")?),
            state,
            claimed_at: row.try_get("claimed_at")?,
        })
    }

    fn row_to_session(row: PgRow) -> Result<CheckoutSession> {
        let line_items_json: serde_json::Value = row.try_get("line_items")?;
        let line_items: Vec<LineItem> = serde_json::from_value(line_items_json)?;
        let status: String = row.try_get("status")?;
        let currency: String = row.try_get("currency")?;
        let reservation_ids: Vec<Uuid> = row.try_get("reservation_ids")?;
        let connection_id: Option<Uuid> = row.try_get("connection_id")?;

        Ok(CheckoutSession {
            id: SessionId::from_uuid(row.try_get("id")?),
            creator_id: CreatorId::from_uuid(row.try_get("creator_id")?),
            idempotency_key: row.try_get("idempotency_key")?,
            short_link_id: ShortLinkId::from_uuid(row.try_get("short_link_id")?),
            attribution_context_id: AttributionContextId::from_uuid(
                row.try_get("attribution_context_id")?,
            ),
            offer_id: OfferId::from_uuid(row.try_get("offer_id")?),
            connection_id: connection_id.map(ConnectionId::from_uuid),
            status: status.parse()?,
            line_items,
            subtotal: Money::from_cents(row.try_get("subtotal_cents")?),
            discount: Money::from_cents(row.try_get("discount_cents")?),
            total: Money::from_cents(row.try_get("total_cents")?),
            currency: Currency::new(currency),
            reservation_ids: reservation_ids
                .into_iter()
                .map(ReservationId::from_uuid)
                .collect(),
            external_order_ref: row.try_get("external_order_ref")?,
            cancel_reason: row.try_get("cancel_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expires_at: row.try_get("expires_at")?,
            closed_at: row.try_get("closed_at")?,
        })
    }

    fn row_to_reservation(row: PgRow) -> Result<Reservation> {
        let variant_id: String = row.try_get("variant_id")?;
        let quantity: i32 = row.try_get("quantity")?;
        let status: String = row.try_get("status")?;
        let release_reason: Option<String> = row.try_get("release_reason")?;

        Ok(Reservation {
            id: ReservationId::from_uuid(row.try_get("id")?),
            variant_id: VariantId::new(variant_id),
            session_id: SessionId::from_uuid(row.try_get("session_id")?),
            quantity: from_i32(quantity)?,
            status: status.parse()?,
            expires_at: row.try_get("expires_at")?,
            release_reason: release_reason.map(|r| r.parse()).transpose()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn lock_session(
        tx: &mut Transaction<'_, Postgres>,
        id: SessionId,
    ) -> Result<Option<CheckoutSession>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Self::row_to_session).transpose()
    }

    async fn save_session_status(
        tx: &mut Transaction<'_, Postgres>,
        session: &CheckoutSession,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE checkout_sessions
            SET status = $2, updated_at = $3, closed_at = $4,
                external_order_ref = $5, cancel_reason = $6
            WHERE id = $1
            "#,
        )
        .bind(session.id.as_uuid())
        .bind(session.status.as_str())
        .bind(session.updated_at)
        .bind(session.closed_at)
        .bind(&session.external_order_ref)
        .bind(&session.cancel_reason)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Expires pending reservations of `variant_id` that are past their TTL.
    ///
    /// Rows are locked in id order so this cannot deadlock against a
    /// concurrent multi-row confirmation.
    async fn expire_stale(
        tx: &mut Transaction<'_, Postgres>,
        variant_id: &VariantId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET status = 'expired', release_reason = 'expired', updated_at = $2
            WHERE id IN (
                SELECT id FROM reservations
                WHERE variant_id = $1 AND status = 'pending' AND expires_at <= $2
                ORDER BY id
                FOR UPDATE
            )
            "#,
        )
        .bind(variant_id.as_str())
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn live_quantity<'e, E>(
        executor: E,
        variant_id: &VariantId,
        now: DateTime<Utc>,
    ) -> Result<u32>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let sum: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM reservations
            WHERE variant_id = $1
              AND (status = 'confirmed' OR (status = 'pending' AND expires_at > $2))
            "#,
        )
        .bind(variant_id.as_str())
        .bind(now)
        .fetch_one(executor)
        .await?;

        u32::try_from(sum).map_err(|_| StoreError::Corrupt(format!("reserved quantity {sum}")))
    }
}

fn from_i32(value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative count {value}")))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("count {value} out of range")))
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Maps a unique violation on `constraint` to `DuplicateKey`.
fn duplicate_on(constraint: &'static str, what: String) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.constraint() == Some(constraint)
        {
            return StoreError::DuplicateKey(what);
        }
        StoreError::Database(e)
    }
}

#[async_trait]
impl CheckoutStore for PostgresCheckoutStore {
    async fn insert_attribution_context(&self, context: AttributionContext) -> Result<()> {
        let metadata_json = serde_json::to_value(&context.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO attribution_contexts (id, creator_id, surface, platform, live_session_id,
                stream_id, replay_id, moment_id, campaign, source, medium, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(context.id.as_uuid())
        .bind(context.creator_id.as_uuid())
        .bind(context.surface.as_str())
        .bind(&context.platform)
        .bind(&context.live_session_id)
        .bind(&context.stream_id)
        .bind(&context.replay_id)
        .bind(&context.moment_id)
        .bind(&context.campaign)
        .bind(&context.source)
        .bind(&context.medium)
        .bind(metadata_json)
        .bind(context.created_at)
        .execute(&self.pool)
        .await
        .map_err(duplicate_on(
            "attribution_contexts_pkey",
            format!("attribution context {}", context.id),
        ))?;
        Ok(())
    }

    async fn get_attribution_context(
        &self,
        id: AttributionContextId,
    ) -> Result<Option<AttributionContext>> {
        let row = sqlx::query("SELECT * FROM attribution_contexts WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_context).transpose()
    }

    async fn insert_short_link(&self, link: ShortLink) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO short_links (id, code, creator_id, offer_id, attribution_context_id,
                expires_at, revoked, revoked_at, max_clicks, click_count, last_clicked_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(link.id.as_uuid())
        .bind(&link.code)
        .bind(link.creator_id.as_uuid())
        .bind(link.offer_id.as_uuid())
        .bind(link.attribution_context_id.as_uuid())
        .bind(link.expires_at)
        .bind(link.revoked)
        .bind(link.revoked_at)
        .bind(link.max_clicks.map(to_i32).transpose()?)
        .bind(to_i32(link.click_count)?)
        .bind(link.last_clicked_at)
        .bind(link.created_at)
        .execute(&self.pool)
        .await
        .map_err(duplicate_on(
            "unique_short_link_code",
            format!("short link {}", link.code),
        ))?;
        Ok(())
    }

    async fn get_short_link(&self, code: &str) -> Result<Option<ShortLink>> {
        let row = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM short_links WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_link).transpose()
    }

    async fn record_click(&self, code: &str, now: DateTime<Utc>) -> Result<ClickOutcome> {
        // The predicate and the increment run as one statement, so concurrent
        // clicks against a capped link serialize on the row.
        let row = sqlx::query(&format!(
            r#"
            UPDATE short_links
            SET click_count = click_count + 1, last_clicked_at = $2
            WHERE code = $1
              AND NOT revoked
              AND (expires_at IS NULL OR expires_at > $2)
              AND (max_clicks IS NULL OR click_count < max_clicks)
            RETURNING {LINK_COLUMNS}
            "#
        ))
        .bind(code)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(ClickOutcome::Recorded(Self::row_to_link(row)?));
        }

        match self.get_short_link(code).await? {
            None => Ok(ClickOutcome::NotFound),
            Some(link) => Ok(ClickOutcome::Unavailable(
                link.availability(now)
                    .err()
                    .unwrap_or(LinkUnavailableReason::ClickLimitReached),
            )),
        }
    }

    async fn revoke_short_link(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ShortLink>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE short_links
            SET revoked = TRUE, revoked_at = COALESCE(revoked_at, $2)
            WHERE code = $1
            RETURNING {LINK_COLUMNS}
            "#
        ))
        .bind(code)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_link).transpose()
    }

    async fn claim_idempotency_key(
        &self,
        creator_id: CreatorId,
        key: &str,
        session_id: SessionId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        // The holder may release its claim between our insert and our read,
        // in which case the insert is simply retried.
        let existing = loop {
            let inserted = sqlx::query(
                r#"
                INSERT INTO idempotency_keys (idempotency_key, creator_id, session_id, state, claimed_at)
                VALUES ($1, $2, $3, 'in_progress', $4)
                ON CONFLICT (idempotency_key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(creator_id.as_uuid())
            .bind(session_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 1 {
                tx.commit().await?;
                return Ok(ClaimOutcome::Claimed);
            }

            let row = sqlx::query(
                "SELECT * FROM idempotency_keys WHERE idempotency_key = $1 FOR UPDATE",
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                break Self::row_to_claim(row)?;
            }
        };

        let stale = existing.state == ClaimState::InProgress
            && existing.claimed_at < stale_before
            && existing.creator_id == creator_id;
        if !stale {
            tx.commit().await?;
            return Ok(ClaimOutcome::Held(existing));
        }

        sqlx::query(
            "UPDATE idempotency_keys SET session_id = $2, claimed_at = $3 WHERE idempotency_key = $1",
        )
        .bind(key)
        .bind(session_id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(key, session_id = %session_id, "took over stale idempotency claim");
        Ok(ClaimOutcome::Claimed)
    }

    async fn release_idempotency_claim(&self, key: &str, session_id: SessionId) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE idempotency_key = $1 AND session_id = $2 AND state = 'in_progress'
            "#,
        )
        .bind(key)
        .bind(session_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_session(&self, session: CheckoutSession) -> Result<()> {
        let key = session.idempotency_key.clone();
        let mut tx = self.pool.begin().await?;

        let claim = sqlx::query("SELECT * FROM idempotency_keys WHERE idempotency_key = $1 FOR UPDATE")
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await?
            .map(Self::row_to_claim)
            .transpose()?;

        match claim {
            Some(claim) if claim.session_id != session.id => {
                return Err(StoreError::DuplicateKey(format!(
                    "idempotency key {key} is claimed by session {}",
                    claim.session_id
                )));
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE idempotency_keys SET state = 'completed' WHERE idempotency_key = $1",
                )
                .bind(&key)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO idempotency_keys (idempotency_key, creator_id, session_id, state, claimed_at)
                    VALUES ($1, $2, $3, 'completed', $4)
                    "#,
                )
                .bind(&key)
                .bind(session.creator_id.as_uuid())
                .bind(session.id.as_uuid())
                .bind(session.created_at)
                .execute(&mut *tx)
                .await
                .map_err(duplicate_on(
                    "idempotency_keys_pkey",
                    format!("idempotency key {key}"),
                ))?;
            }
        }

        let line_items_json = serde_json::to_value(&session.line_items)?;
        let reservation_ids: Vec<Uuid> = session
            .reservation_ids
            .iter()
            .map(ReservationId::as_uuid)
            .collect();

        sqlx::query(
            r#"
            INSERT INTO checkout_sessions (id, creator_id, idempotency_key, short_link_id,
                attribution_context_id, offer_id, connection_id, status, line_items,
                subtotal_cents, discount_cents, total_cents, currency, reservation_ids,
                external_order_ref, cancel_reason, created_at, updated_at, expires_at, closed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20)
            "#,
        )
        .bind(session.id.as_uuid())
        .bind(session.creator_id.as_uuid())
        .bind(&key)
        .bind(session.short_link_id.as_uuid())
        .bind(session.attribution_context_id.as_uuid())
        .bind(session.offer_id.as_uuid())
        .bind(session.connection_id.map(|c| c.as_uuid()))
        .bind(session.status.as_str())
        .bind(line_items_json)
        .bind(session.subtotal.cents())
        .bind(session.discount.cents())
        .bind(session.total.cents())
        .bind(session.currency.code())
        .bind(reservation_ids)
        .bind(&session.external_order_ref)
        .bind(&session.cancel_reason)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .bind(session.closed_at)
        .execute(&mut *tx)
        .await
        .map_err(duplicate_on(
            "unique_session_idempotency_key",
            format!("idempotency key {key}"),
        ))?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<CheckoutSession>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_session).transpose()
    }

    async fn find_session_by_key(
        &self,
        creator_id: CreatorId,
        key: &str,
    ) -> Result<Option<CheckoutSession>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions \
             WHERE creator_id = $1 AND idempotency_key = $2"
        ))
        .bind(creator_id.as_uuid())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_session).transpose()
    }

    async fn transition_session(
        &self,
        id: SessionId,
        to: SessionStatus,
        now: DateTime<Utc>,
        external_order_ref: Option<String>,
        reason: Option<String>,
    ) -> Result<SessionTransition> {
        let mut tx = self.pool.begin().await?;
        let Some(mut session) = Self::lock_session(&mut tx, id).await? else {
            return Ok(SessionTransition::NotFound);
        };

        if !session.apply_transition(to, now, external_order_ref, reason) {
            tx.commit().await?;
            return Ok(SessionTransition::Rejected(session));
        }

        Self::save_session_status(&mut tx, &session).await?;
        tx.commit().await?;
        Ok(SessionTransition::Applied(session))
    }

    async fn expire_session_if_drained(
        &self,
        id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition> {
        let mut tx = self.pool.begin().await?;
        let Some(mut session) = Self::lock_session(&mut tx, id).await? else {
            return Ok(SessionTransition::NotFound);
        };

        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE session_id = $1 ORDER BY id FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;
        let mut drained = true;
        for row in rows {
            if Self::row_to_reservation(row)?.is_live_at(now) {
                drained = false;
            }
        }

        if !drained || !session.apply_transition(SessionStatus::Expired, now, None, None) {
            tx.commit().await?;
            return Ok(SessionTransition::Rejected(session));
        }

        Self::save_session_status(&mut tx, &session).await?;
        tx.commit().await?;
        Ok(SessionTransition::Applied(session))
    }

    async fn expired_pending_sessions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CheckoutSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions \
             WHERE status = 'pending' AND expires_at <= $1 \
             ORDER BY expires_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_session).collect()
    }

    async fn try_reserve(
        &self,
        reservation: Reservation,
        stock: u32,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2))")
            .bind(VARIANT_LOCK_NAMESPACE)
            .bind(reservation.variant_id.as_str())
            .execute(&mut *tx)
            .await?;

        let expired = Self::expire_stale(&mut tx, &reservation.variant_id, now).await?;
        if expired > 0 {
            metrics::counter!("reservations_lazily_expired_total").increment(expired);
            tracing::debug!(
                variant_id = %reservation.variant_id,
                expired,
                "expired stale reservations before stock check"
            );
        }

        let reserved = Self::live_quantity(&mut *tx, &reservation.variant_id, now).await?;
        let available = stock.saturating_sub(reserved);
        if reservation.quantity > available {
            tx.commit().await?;
            return Ok(ReserveOutcome::Insufficient { available });
        }

        sqlx::query(
            r#"
            INSERT INTO reservations (id, variant_id, session_id, quantity, status, expires_at,
                release_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.variant_id.as_str())
        .bind(reservation.session_id.as_uuid())
        .bind(to_i32(reservation.quantity)?)
        .bind(reservation.status.as_str())
        .bind(reservation.expires_at)
        .bind(reservation.release_reason.map(|r| r.as_str()))
        .bind(reservation.created_at)
        .bind(reservation.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(duplicate_on(
            "reservations_pkey",
            format!("reservation {}", reservation.id),
        ))?;

        tx.commit().await?;
        Ok(ReserveOutcome::Reserved(reservation))
    }

    async fn confirm_reservations(
        &self,
        ids: &[ReservationId],
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome> {
        let uuids: Vec<Uuid> = ids.iter().map(ReservationId::as_uuid).collect();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        ))
        .bind(&uuids)
        .fetch_all(&mut *tx)
        .await?;
        let mut locked: HashMap<ReservationId, Reservation> = HashMap::with_capacity(rows.len());
        for row in rows {
            let r = Self::row_to_reservation(row)?;
            locked.insert(r.id, r);
        }

        let mut confirmed = Vec::with_capacity(ids.len());
        for id in ids {
            match locked.get(id) {
                Some(r) if r.is_confirmable_at(now) => {
                    let mut r = r.clone();
                    r.confirm(now);
                    confirmed.push(r);
                }
                other => {
                    tx.rollback().await?;
                    return Ok(ConfirmOutcome::Conflict {
                        reservation_id: *id,
                        status: other.map(|r| r.status),
                    });
                }
            }
        }

        sqlx::query("UPDATE reservations SET status = 'confirmed', updated_at = $2 WHERE id = ANY($1)")
            .bind(&uuids)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(ConfirmOutcome::Confirmed(confirmed))
    }

    async fn release_reservation(
        &self,
        id: ReservationId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(mut reservation) = row.map(Self::row_to_reservation).transpose()? else {
            return Ok(ReleaseOutcome::NotFound);
        };

        if !reservation.status.is_outstanding() {
            tx.commit().await?;
            return Ok(ReleaseOutcome::AlreadyReleased(reservation));
        }
        if !reservation.can_release(reason) {
            tx.commit().await?;
            return Ok(ReleaseOutcome::Rejected(reservation));
        }

        reservation.release(reason, now);
        sqlx::query(
            "UPDATE reservations SET status = $2, release_reason = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(reservation.status.as_str())
        .bind(reason.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReleaseOutcome::Released(reservation))
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_reservation).transpose()
    }

    async fn reservations_for_session(&self, session_id: SessionId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE session_id = $1 ORDER BY created_at ASC"
        ))
        .bind(session_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_reservation).collect()
    }

    async fn outstanding_quantity(
        &self,
        variant_id: &VariantId,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        Self::live_quantity(&self.pool, variant_id, now).await
    }

    async fn expired_pending_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE status = 'pending' AND expires_at <= $1 \
             ORDER BY expires_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_reservation).collect()
    }
}
