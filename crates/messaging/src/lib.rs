//! Broker-facing side of the sales backend.
//!
//! The [`EventPublisher`] trait is the seam between the outbox and the
//! broker. [`RabbitPublisher`] implements it over AMQP with publisher
//! confirms and a supervised reconnect loop; [`MemoryPublisher`] is
//! the test double. [`OutboxProcessor`] drains outbox rows through a
//! publisher in three background loops (fresh rows, retries, cleanup).

pub mod error;
pub mod processor;
pub mod publisher;
pub mod rabbit;

pub use error::PublishError;
pub use processor::{DrainStats, OutboxProcessor, ProcessorConfig, ProcessorHandle};
pub use publisher::{EventPublisher, MemoryPublisher};
pub use rabbit::{RabbitConfig, RabbitPublisher};
