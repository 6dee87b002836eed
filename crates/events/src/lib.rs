//! Signals published by the services after a unit of work commits.
//!
//! Delivery is best-effort: a publisher must never fail its own operation
//! because a signal could not be delivered.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
