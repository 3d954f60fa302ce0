//! Core domain types and traits for the dockrun build worker.
//!
//! This crate contains:
//! - Build job and run identifiers
//! - Event and command result types published to the event queue
//! - The container runtime and event sink traits
//! - The error taxonomy shared by every stage

pub mod error;
pub mod event;
pub mod id;
pub mod job;
pub mod runtime;

pub use error::{Error, Result};
pub use event::{CommandResult, Event, EventContent, EventSink, EventType, Subject};
pub use id::RunId;
pub use job::BuildJob;
pub use runtime::{BuildLine, BuildOutcome, BuildOutput, ContainerRuntime, ExecOutput};
