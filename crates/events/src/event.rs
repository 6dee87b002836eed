use chrono::{DateTime, Utc};

/// A fact published on an [`EventBus`](crate::EventBus).
///
/// Signals are immutable and carry a stable type name so subscribers can
/// route on it without matching on the concrete type.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable type identifier (e.g. "stock.low_stock").
    fn event_type(&self) -> &'static str;

    /// When the underlying change was committed.
    fn occurred_at(&self) -> DateTime<Utc>;
}
