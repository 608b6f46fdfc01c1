//! `bus` crate — the message bus contract.
//!
//! The engine never talks to a broker directly; it publishes and subscribes
//! through the [`Bus`] trait.  The in-memory backend drives the test suites
//! and the CLI simulator; production deployments plug a broker-backed
//! implementation in at wiring time.

pub mod consumer;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod topics;
pub mod traits;

pub use consumer::{run_consumer, run_dlq_processor, ConsumerOptions};
pub use envelope::{DeadLetter, Envelope, MessageMetadata};
pub use error::BusError;
pub use memory::InMemoryBus;
pub use traits::{Bus, Delivery};
