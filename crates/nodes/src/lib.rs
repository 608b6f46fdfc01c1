//! `nodes` crate — node-type metadata and the executor contract.
//!
//! The engine only dispatches typed requests; real executors live in other
//! services.  This crate owns what the engine must know about each node
//! type (its request topic, its external service, its default retry
//! policy, its synthesized compensation) plus a scripted executor used by
//! the test suites and the CLI simulator.

pub mod executor;
pub mod mock;
pub mod types;

pub use executor::{ExecutorError, NodeExecutor};
pub use mock::{MockExecutorService, RecordedCall, ScriptedExecutor, ScriptedResponse};
pub use types::{
    compensation_for, default_retry_policy, service_for, topic_for, CompensationType,
    SynthesizedCompensation,
};
