//! # Conductor Core
//!
//! Domain types, collaborator traits, and error definitions for the
//! Conductor control-loop engine. This crate has **no execution logic**;
//! it defines the model every strategy in `conductor-engine` works against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here:
//! - [`CompletionService`] for the text-completion backend
//! - [`Tool`] behind a [`ToolRegistry`] for named capabilities
//!
//! This keeps backends swappable and lets tests drive the engine with
//! scripted stand-ins.

pub mod completion;
pub mod error;
pub mod event;
pub mod plan;
pub mod task;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use completion::{
    BackendTier, Completion, CompletionChunk, CompletionProfile, CompletionRequest,
    CompletionService, Usage, spawn_completion,
};
pub use error::{ClassificationError, CompletionError, Error, PlanError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use plan::Plan;
pub use task::{Task, TaskId, TaskResult, TaskStatus};
pub use tool::{Tool, ToolCall, ToolOutput, ToolRegistry, ToolSignature};
