#![warn(missing_docs)]

//! Sandboxed Rhai script sessions.
//!
//! A [`Session`] bundles script source with everything that controls how it
//! runs:
//!
//! - **Capabilities**: host types and functions reach the script only when
//!   their [`CapabilityId`] is registered in the session's default-deny
//!   [`CapabilityFilter`].
//! - **Includes**: lines of the form `#include <reference>` are expanded by the
//!   first matching [`SourceProvider`], recursively, with every fragment
//!   expanded at most once.
//! - **Deadline**: each evaluation runs on a worker supervised by a watchdog.
//!   Scripts exceeding `max_runtime` (3 seconds by default) are stopped at the
//!   engine's next safe point and reported as forcibly terminated.
//!
//! ```no_run
//! # async fn demo() -> scriptgate::Result<()> {
//! use scriptgate::{MemoryProvider, Session};
//!
//! let provider = MemoryProvider::new(r"lib/\w+")?
//!     .with_source("lib/math", "fn sq(x) { x * x }");
//! let session = Session::builder()
//!     .with_provider(provider)
//!     .with_variable("n", 7_i64)
//!     .build("#include lib/math\nsq(n)");
//! let report = session.evaluate()?.report().await;
//! assert_eq!(report.outcome.value().and_then(|v| v.as_int().ok()), Some(49));
//! # Ok(())
//! # }
//! ```

/// Capability identifiers, the allow-list and host surfaces.
mod capability;
/// Execution limits.
mod config;
/// Engine construction.
mod engine;
/// Error types and Result alias.
mod error;
/// `#include` expansion.
mod include;
/// Include source providers.
mod provider;
/// Session and builder.
mod session;
/// Worker and watchdog orchestration.
mod supervisor;

pub mod testutils;

pub use capability::{
    Capability, CapabilityFilter, CapabilityId, CapabilityTable, FnCapability, TypeCapability,
};
pub use config::{DEFAULT_MAX_RUNTIME, ScriptConfig};
pub use error::{Error, Result, ScriptError, ScriptErrorInfo, format_error};
pub use include::{
    DEFAULT_MAX_INCLUDE_DEPTH, INCLUDE_DIRECTIVE, IncludeResolver, Resolution, VisitedSet,
};
pub use provider::{MemoryProvider, PatternProvider, SourceProvider};
pub use session::{Session, SessionBuilder};
pub use supervisor::{
    ErrorCallback, ExecutionHandle, ExecutionOutcome, ExecutionReport, ExecutionState,
    ExecutionSummary, Supervisor, Termination,
};
