//! Notification transport: publish/subscribe mechanics for job events.
//!
//! The bus carries progress and lifecycle notifications to external
//! subscribers (UI, operators). It is a distribution channel only; the job
//! record store stays the source of truth.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
