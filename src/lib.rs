#![forbid(unsafe_code)]
//! # smelter
//!
//! Task-graph build orchestration for smart-contract projects.
//!
//! A build invocation is described by a [`Blueprint`]: the plugins to load,
//! the user's configuration, and the external collaborators (compiler, RPC
//! transport, verification service, test harness). [`Blueprint::finish`]
//! turns it into a [`Runtime`] by
//!
//! 1. collecting schema fragments, default layers and tasks from every
//!    [`Plugin`], in registration order,
//! 2. resolving the frozen [`Configuration`] from framework defaults, plugin
//!    defaults and the user's layer,
//! 3. registering every network and checking the default one exists,
//! 4. finalizing the [`TaskGraph`], rejecting cycles and unknown
//!    dependencies.
//!
//! Any of these failing stops the build before a single task runs.
//!
//! [`Runtime::run_task`] then executes a named task and everything it
//! depends on, independent branches in parallel, and maps the outcome to an
//! exit status.
//!
//! ```rust,no_run
//! use smelter::{Blueprint, TaskArgs};
//! use serde_json::json;
//!
//! let mut blueprint = Blueprint::new();
//! blueprint
//!     .user_config(json!({ "solidity": { "version": "0.7.6" } }))
//!     .tasks(|tasks| {
//!         tasks
//!             .define("hello")
//!             .describe("Prints the active network")
//!             .depends_on("compile")
//!             .run(|ctx| {
//!                 println!("compiled for {}", ctx.network().name);
//!                 Ok(())
//!             });
//!     });
//!
//! let runtime = blueprint.finish().unwrap();
//! std::process::exit(runtime.run_task("hello", &TaskArgs::new(), None));
//! ```
//!
//! The built-in `simulated` network runs in-process, so a project without a
//! `defaultNetwork` never touches the outside world.

mod blueprint;
pub mod compiler;
pub mod config;
mod core;
mod engine;
pub mod error;
mod harness;
pub mod network;
pub mod plugin;
mod utils;
mod verify;

#[cfg(test)]
mod testing;

pub use crate::blueprint::{Blueprint, Runtime};
pub use crate::config::{ConfigResolver, Configuration};
pub use crate::core::{CancellationToken, Hash32};
pub use crate::engine::{
    RunReport, SkipReason, TaskArgs, TaskContext, TaskDef, TaskDefinition,
    TaskGraph, TaskGraphBuilder, TaskReport, TaskStatus,
};
pub use crate::error::{SmelterError, exit};
pub use crate::harness::{TestHarness, TestSummary};
pub use crate::plugin::{Plugin, PluginRegistry};
pub use crate::verify::Verifier;

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
