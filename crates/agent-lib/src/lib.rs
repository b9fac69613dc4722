//! Agent runtime library
//!
//! This crate provides the core functionality for:
//! - Command scheduling through the process manager
//! - Long-poll command intake from remote controllers
//! - Container lifecycle and per-container command dispatch
//! - Message/result/stats fan-out with metric aggregation
//! - Log delivery to console and controller endpoints

pub mod builtin;
pub mod containers;
pub mod controller;
pub mod error;
pub mod logging;
pub mod models;
pub mod pm;

pub use error::{AgentError, Result};
pub use models::{Command, CommandArgs, JobResult, Message, State};
pub use pm::{PmConfig, ProcessManager};
