//! Shared contract between the phasegate orchestrator and phase executors.
//!
//! An executor implementation depends on this crate alone: it receives a
//! [`PhaseInput`] carrying the workflow description and a token ceiling, and
//! reports a [`PhaseOutput`] (or an [`ExecutorError`]) back to the orchestrator.

pub mod depth;
pub mod executor;

pub use depth::DepthTier;
pub use executor::{ExecutorError, PhaseExecutor, PhaseInput, PhaseOutput};
