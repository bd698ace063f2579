//! Persistence layer for the sales backend.
//!
//! Provides the [`Store`] and [`Uow`] abstractions, a PostgreSQL
//! implementation, and an in-memory double for unit tests. All
//! aggregate updates go through the version-conditioned write path;
//! domain events are enqueued to the outbox inside the same unit of
//! work as the mutation they describe.

pub mod error;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use outbox::{OutboxClaim, OutboxEntry};
pub use postgres::PostgresStore;
pub use store::{Store, Uow};
