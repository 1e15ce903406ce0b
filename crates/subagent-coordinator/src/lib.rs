//! Subagent coordinator: the process-driving half of the workspace. Wires
//! [`coordinator_core`]'s policy and state types to a real child process
//! (`pi`, run opaquely via [`child_driver`]) through the [`orchestrator`].

#![allow(clippy::uninlined_format_args)]

pub mod child_driver;
pub mod config;
pub mod orchestrator;

pub use child_driver::{AgentSource, ChildLaunchSpec, ChildResult, StopReason};
pub use config::CoordinatorConfig;
pub use orchestrator::{AgentDescriptor, ExecuteRequest, ExecutionReport, Orchestrator, Update, UpdateSender};
