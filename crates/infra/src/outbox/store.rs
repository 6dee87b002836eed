use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use supplyline_core::{Page, Pagination};

use crate::store::StoreError;

use super::types::{OutboxMessage, OutboxStatus};

/// Storage side of the outbox. Messages are enqueued through the owning
/// store's unit of work; this trait covers the relay's needs.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due messages, oldest first, taking a `lease` on
    /// each (see [`OutboxMessage::claim`]). Concurrent relays never claim the
    /// same message while its lease is running.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Persist the outcome of a delivery attempt.
    async fn save_outcome(&self, message: &OutboxMessage) -> Result<(), StoreError>;

    async fn outbox_messages(
        &self,
        status: Option<OutboxStatus>,
        page: Pagination,
    ) -> Result<Page<OutboxMessage>, StoreError>;
}

#[async_trait::async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        (**self).claim_due(now, lease, limit).await
    }

    async fn save_outcome(&self, message: &OutboxMessage) -> Result<(), StoreError> {
        (**self).save_outcome(message).await
    }

    async fn outbox_messages(
        &self,
        status: Option<OutboxStatus>,
        page: Pagination,
    ) -> Result<Page<OutboxMessage>, StoreError> {
        (**self).outbox_messages(status, page).await
    }
}
