//! Core types shared by all Conductor crates.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for the orchestration engine.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`Event`]: Typed lifecycle notification (`agent:deployed`, `workflow:complete`, ...).
//! - [`EventBus`]: Bounded broadcast channel the host drains events from.

/// Error taxonomy.
pub mod error;
/// Typed events and the broadcast bus.
pub mod event;

pub use error::{ConductorError, ConductorResult};
pub use event::{Event, EventBus};
