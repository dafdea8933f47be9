//! Autonomous task-execution control loop.
//!
//! A [`Session`] repeatedly asks a [`Planner`] for the next action, dispatches it
//! through the [`ToolRegistry`] inside a confined [`LocalSandbox`], records the
//! outcome in an append-only [`Transcript`], and only finishes once the
//! [`QualityGate`] accepts the proposed completion. The [`Coordinator`] fans a
//! goal out to specialist sessions with bounded parallelism.

pub mod action;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod planner;
pub mod quality;
pub mod retry;
pub mod sandbox;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod truncation;

pub use action::*;
pub use config::*;
pub use coordinator::*;
pub use errors::*;
pub use events::*;
pub use ledger::*;
pub use planner::*;
pub use quality::*;
pub use retry::*;
pub use sandbox::*;
pub use session::*;
pub use tools::*;
pub use transcript::*;
pub use truncation::*;
