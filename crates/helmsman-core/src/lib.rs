//! Core types for the helmsman cluster controller.
//!
//! This crate provides the building blocks shared by every controller
//! component:
//! - Process identity and locality ([`types`])
//! - Process classes, roles, and the fitness lattice ([`class`])
//! - The controller error taxonomy ([`error`])
//! - Operator-tunable knobs ([`knobs`])
//! - Broadcast variables and rewindable reply slots ([`sync`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod class;
pub mod error;
pub mod knobs;
pub mod sync;
pub mod types;

pub use class::{ClassSource, ClassType, DcFitness, Fitness, PriorityInfo, ProcessClass, Role};
pub use error::{Error, Result};
pub use knobs::Knobs;
pub use sync::{AsyncVar, ReplySlot};
pub use types::{AddressExclusion, Clock, DcId, Locality, LocalityScope, ProcessId};
