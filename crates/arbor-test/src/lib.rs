//! Arbor Test Harness - sequencing simulation and replica fixtures
//!
//! This crate models the external sequencer collaborator: a total order
//! over submitted operations, broadcast to every replica including the
//! origin. It provides:
//! - An in-memory sequencer with explicit interleaving control
//! - Instrumented replica fixtures that record change events
//! - Randomized convergence fuzzing

pub mod convergence;
pub mod replica;
pub mod sequencer;

pub use convergence::*;
pub use replica::*;
pub use sequencer::*;
