use std::{collections::HashMap, fmt};

use regex::Regex;

use crate::error::{Error, Result};

/// Host-supplied source for `#include` directives.
///
/// Providers are consulted in registration order. The first one whose
/// [`find`](SourceProvider::find) returns a substring of the reference is asked
/// to [`fetch`](SourceProvider::fetch) that substring.
pub trait SourceProvider: Send + Sync + 'static {
    /// Return the part of `reference` this provider recognises, if any.
    fn find<'r>(&self, reference: &'r str) -> Option<&'r str>;

    /// Produce source text for a token previously returned by `find`.
    fn fetch(&self, token: &str) -> Result<String>;
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| Error::InvalidPattern {
        pattern: pattern.to_string(),
        message: err.to_string(),
    })
}

/// Provider that matches with a regex and fetches through a closure.
pub struct PatternProvider<F> {
    pattern: Regex,
    fetch: F,
}

impl<F> PatternProvider<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync + 'static,
{
    /// Create a provider. The pattern is searched anywhere in the reference.
    pub fn new(pattern: &str, fetch: F) -> Result<Self> {
        Ok(Self {
            pattern: compile(pattern)?,
            fetch,
        })
    }
}

impl<F> SourceProvider for PatternProvider<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync + 'static,
{
    fn find<'r>(&self, reference: &'r str) -> Option<&'r str> {
        self.pattern.find(reference).map(|m| m.as_str())
    }

    fn fetch(&self, token: &str) -> Result<String> {
        (self.fetch)(token)
    }
}

impl<F> fmt::Debug for PatternProvider<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternProvider")
            .field("pattern", &self.pattern.as_str())
            .finish_non_exhaustive()
    }
}

/// Provider serving fragments from an in-memory table.
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    pattern: Regex,
    sources: HashMap<String, String>,
}

impl MemoryProvider {
    /// Create an empty provider matching `pattern`.
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: compile(pattern)?,
            sources: HashMap::new(),
        })
    }

    /// Add or replace a fragment.
    pub fn with_source(mut self, token: impl Into<String>, source: impl Into<String>) -> Self {
        self.sources.insert(token.into(), source.into());
        self
    }
}

impl SourceProvider for MemoryProvider {
    fn find<'r>(&self, reference: &'r str) -> Option<&'r str> {
        self.pattern.find(reference).map(|m| m.as_str())
    }

    fn fetch(&self, token: &str) -> Result<String> {
        self.sources
            .get(token)
            .cloned()
            .ok_or_else(|| Error::SourceNotFound {
                token: token.to_string(),
            })
    }
}
