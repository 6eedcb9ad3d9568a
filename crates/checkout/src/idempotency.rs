//! Idempotent checkout-session creation.
//!
//! A start request first claims its idempotency key. Only the claim holder
//! runs the builder; everyone else either gets the finished session or
//! waits (bounded) for the holder to finish.

use std::sync::Arc;

use async_trait::async_trait;
use checkout_store::{CheckoutStore, ClaimOutcome, ClaimState, StoreError};
use common::{Clock, CreatorId, SessionId};
use domain::CheckoutSession;
use tokio::time::Instant;

use crate::config::CheckoutConfig;
use crate::error::{CheckoutError, Result};

/// Builds (but does not persist) a new session under a claimed key.
#[async_trait]
pub trait SessionBuilder: Send {
    /// Constructs the session with id `session_id`, holding whatever resources it needs.
    async fn build(&mut self, session_id: SessionId) -> Result<CheckoutSession>;

    /// Gives back the resources of a built session that could not be persisted.
    async fn discard(&mut self, session: &CheckoutSession);
}

/// Result of [`IdempotencyGuard::get_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// This call built and persisted the session.
    Created(CheckoutSession),
    /// A session already existed for the key; nothing was built.
    Existing(CheckoutSession),
}

impl SessionOutcome {
    /// Returns true if this call created the session.
    pub fn is_created(&self) -> bool {
        matches!(self, SessionOutcome::Created(_))
    }

    /// Borrows the session.
    pub fn session(&self) -> &CheckoutSession {
        match self {
            SessionOutcome::Created(s) | SessionOutcome::Existing(s) => s,
        }
    }

    /// Unwraps the session.
    pub fn into_session(self) -> CheckoutSession {
        match self {
            SessionOutcome::Created(s) | SessionOutcome::Existing(s) => s,
        }
    }
}

/// Deduplicates checkout-start requests by `(creator, idempotency key)`.
pub struct IdempotencyGuard<S: CheckoutStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: CheckoutConfig,
}

impl<S: CheckoutStore> IdempotencyGuard<S> {
    /// Creates a new guard.
    pub fn new(store: S, clock: Arc<dyn Clock>, config: CheckoutConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Returns the session for `key`, building it with `builder` if none exists.
    ///
    /// Concurrent calls with the same key never both build: the loser waits
    /// for the winner's session, up to the configured bound.
    #[tracing::instrument(skip(self, builder))]
    pub async fn get_or_create<B: SessionBuilder>(
        &self,
        creator_id: CreatorId,
        key: &str,
        mut builder: B,
    ) -> Result<SessionOutcome> {
        let session_id = SessionId::new();
        // Wall-clock bound on real waiting, independent of the injected Clock.
        let deadline = Instant::now() + self.config.idempotency_wait;

        loop {
            let now = self.clock.now();
            let stale_before = now - self.config.idempotency_lease;
            let claim = self
                .store
                .claim_idempotency_key(creator_id, key, session_id, now, stale_before)
                .await?;

            let held = match claim {
                ClaimOutcome::Claimed => break,
                ClaimOutcome::Held(held) => held,
            };

            if held.creator_id != creator_id {
                tracing::warn!("idempotency key reused across creators");
                return Err(CheckoutError::KeyConflict {
                    key: key.to_string(),
                });
            }

            if held.state == ClaimState::Completed {
                let existing = self.store.get_session(held.session_id).await?.ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "idempotency key {key} points at missing session {}",
                        held.session_id
                    ))
                })?;
                metrics::counter!("checkout_deduplicated_total").increment(1);
                tracing::debug!(session_id = %existing.id, "returning existing session");
                return Ok(SessionOutcome::Existing(existing));
            }

            if Instant::now() >= deadline {
                return Err(CheckoutError::RequestInProgress {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(self.config.idempotency_poll_interval).await;
        }

        let session = match builder.build(session_id).await {
            Ok(session) => session,
            Err(e) => {
                self.abandon(key, session_id).await;
                return Err(e);
            }
        };

        match self.store.insert_session(session.clone()).await {
            Ok(()) => Ok(SessionOutcome::Created(session)),
            Err(StoreError::DuplicateKey(detail)) => {
                // The claim went stale and another request took it over.
                tracing::warn!(%detail, "idempotency claim lost before persisting");
                builder.discard(&session).await;
                Err(CheckoutError::RequestInProgress {
                    key: key.to_string(),
                })
            }
            Err(e) => {
                builder.discard(&session).await;
                self.abandon(key, session_id).await;
                Err(e.into())
            }
        }
    }

    async fn abandon(&self, key: &str, session_id: SessionId) {
        if let Err(e) = self.store.release_idempotency_claim(key, session_id).await {
            tracing::error!(error = %e, "failed to release idempotency claim");
        }
    }
}
