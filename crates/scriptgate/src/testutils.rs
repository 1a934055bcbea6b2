//! Test utilities for `scriptgate`.
//!
//! Small helpers shared by the unit and integration tests, and usable by
//! downstream crates through `use scriptgate::testutils::*`.

use std::sync::{Arc, Mutex};

use crate::{
    error::{Result, ScriptError},
    provider::MemoryProvider,
    session::Session,
    supervisor::{ErrorCallback, ExecutionReport},
};

/// Records every invocation of an error callback.
#[derive(Debug, Clone, Default)]
pub struct ErrorRecorder {
    errors: Arc<Mutex<Vec<ScriptError>>>,
}

impl ErrorRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback that records into this recorder.
    pub fn callback(&self) -> ErrorCallback {
        let errors = self.errors.clone();
        Box::new(move |err: &ScriptError| {
            errors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(err.clone());
        })
    }

    /// Number of times the callback ran.
    pub fn calls(&self) -> usize {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Errors received so far.
    pub fn errors(&self) -> Vec<ScriptError> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Build a [`MemoryProvider`] from `(token, source)` pairs.
///
/// Panics if `pattern` is not a valid regex.
pub fn memory_provider(pattern: &str, sources: &[(&str, &str)]) -> MemoryProvider {
    let provider = match MemoryProvider::new(pattern) {
        Ok(provider) => provider,
        Err(err) => panic!("invalid test pattern: {err}"),
    };
    sources
        .iter()
        .fold(provider, |p, (token, source)| p.with_source(*token, *source))
}

/// Execute `session` on the current runtime and wait for its report.
pub async fn run_to_report(session: &Session) -> Result<ExecutionReport> {
    Ok(session.evaluate()?.report().await)
}
