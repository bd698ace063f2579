//! Lead-to-opportunity conversion.
//!
//! [`ConversionEngine`] orchestrates the saga: it validates and
//! persists new sagas under an idempotency key, drives their steps
//! through the handlers in the [`StepRegistry`], retries transient
//! failures, and compensates completed steps when a failure is
//! terminal. [`ResumeSweeper`] picks up sagas a crashed or slow worker
//! left behind and runs the retention janitors.

pub mod engine;
pub mod error;
pub mod services;
pub mod steps;
pub mod sweeper;

pub use engine::{ConversionEngine, EngineConfig, InitiateOutcome, ResumeReport};
pub use error::ConversionError;
pub use services::{
    ContactDirectory, ContactRecord, CustomerDirectory, CustomerRecord, MemoryContactDirectory,
    MemoryCustomerDirectory, NewContact, NewCustomer,
};
pub use steps::{StepHandler, StepRegistry};
pub use sweeper::{ResumeSweeper, SweeperConfig, SweeperHandle};
