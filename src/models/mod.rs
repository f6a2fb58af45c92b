// Core domain models for flowkeeper
// Plain, serializable records the engine reads and writes

//! # Domain Models Module
//!
//! The data the engine persists and passes around. Nothing in here knows
//! about locking, storage or node behaviour.
//!
//! - [`Token`] / [`SplitTokenSource`]: branch lineage for split/join
//! - [`TaskStatus`], [`ProcessStatus`], [`Transition`]: the status machines
//! - [`Task`], [`Process`]: persisted records
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements below let callers write
//! `flowkeeper::models::Task` instead of `flowkeeper::models::task::Task`.

pub mod ids;
pub mod process;
pub mod status;
pub mod task;
pub mod token;

pub use ids::{ProcessId, TaskId};
pub use process::Process;
pub use status::{ProcessStatus, TaskStatus, Transition};
pub use task::Task;
pub use token::{SplitTokenSource, Token};
