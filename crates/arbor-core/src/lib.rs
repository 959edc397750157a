//! Arbor Core - Fundamental types for the replicated directory
//!
//! This crate defines the types shared by every Arbor component:
//! - Identities (ReplicaId)
//! - Tree paths and stored values
//! - The operation vocabulary exchanged with the sequencer
//! - Change events and apply outcomes
//! - Error taxonomy

pub mod id;
pub mod path;
pub mod value;
pub mod op;
pub mod event;
pub mod error;

pub use id::*;
pub use path::*;
pub use value::*;
pub use op::*;
pub use event::*;
pub use error::*;
