//! Transactional outbox for logistics notifications.
//!
//! A message is written in the same unit of work as the dispatch task it
//! announces, then delivered by [`OutboxRelay`] with retry, backoff and a
//! dead-letter state. A failing logistics endpoint never affects the
//! committed task.

pub mod notifier;
pub mod relay;
pub mod store;
pub mod types;

pub use notifier::{HttpLogisticsNotifier, LoggingNotifier, LogisticsNotifier, NotifyError};
pub use relay::{OutboxRelay, RelayConfig, RelayStats};
pub use store::OutboxStore;
pub use types::{BackoffStrategy, OutboxMessage, OutboxStatus, RetryPolicy, TaskCreatedNotice};
