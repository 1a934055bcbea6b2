//! Expansion of `#include` directives.
//!
//! Resolution walks the source line by line. A line starting with
//! [`INCLUDE_DIRECTIVE`] is replaced by the fully expanded text of the fragment
//! it names; every other line is copied through. Each matched token is expanded
//! at most once per top-level call, which also makes include cycles terminate.

use std::{collections::BTreeSet, sync::Arc};

use crate::provider::SourceProvider;

/// Line prefix that marks an include directive. The trailing space is required.
pub const INCLUDE_DIRECTIVE: &str = "#include ";

/// Default nesting limit for include expansion.
pub const DEFAULT_MAX_INCLUDE_DEPTH: usize = 64;

/// Tokens already expanded during one top-level resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitedSet {
    tokens: BTreeSet<String>,
}

impl VisitedSet {
    /// Check whether a token has been expanded.
    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    /// Record a token. Returns `false` if it was already present.
    pub fn insert(&mut self, token: impl Into<String>) -> bool {
        self.tokens.insert(token.into())
    }

    /// Number of recorded tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token has been recorded.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Iterate recorded tokens in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }
}

/// Result of a detailed resolution.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Source with every resolvable directive expanded.
    pub text: String,
    /// Tokens expanded along the way.
    pub visited: VisitedSet,
    /// Directive references that were dropped, in encounter order.
    pub unresolved: Vec<String>,
}

/// Bookkeeping threaded by value through the depth-first expansion.
#[derive(Default)]
struct Trail {
    visited: VisitedSet,
    unresolved: Vec<String>,
}

/// A provider paired with the token it matched.
struct Match<'p, 'r> {
    provider: &'p dyn SourceProvider,
    token: &'r str,
}

/// Expands include directives using an ordered list of providers.
pub struct IncludeResolver<'p> {
    providers: &'p [Arc<dyn SourceProvider>],
    max_depth: usize,
}

impl<'p> IncludeResolver<'p> {
    /// Create a resolver over providers in priority order.
    pub fn new(providers: &'p [Arc<dyn SourceProvider>]) -> Self {
        Self {
            providers,
            max_depth: DEFAULT_MAX_INCLUDE_DEPTH,
        }
    }

    /// Limit directive nesting. Directives deeper than `max_depth` are dropped.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Expand all directives in `source`.
    pub fn resolve(&self, source: &str) -> String {
        self.resolve_detailed(source).text
    }

    /// Expand all directives, reporting visited tokens and dropped references.
    pub fn resolve_detailed(&self, source: &str) -> Resolution {
        let (text, trail) = self.expand(source, Trail::default(), 0);
        Resolution {
            text,
            visited: trail.visited,
            unresolved: trail.unresolved,
        }
    }

    /// Expand `source` continuing from an existing visited set, returning the
    /// set extended with every token expanded here.
    pub fn resolve_with(&self, source: &str, visited: VisitedSet) -> (String, VisitedSet) {
        let trail = Trail {
            visited,
            unresolved: Vec::new(),
        };
        let (text, trail) = self.expand(source, trail, 0);
        (text, trail.visited)
    }

    fn find_match<'r>(&self, reference: &'r str) -> Option<Match<'p, 'r>> {
        self.providers.iter().find_map(|provider| {
            provider.find(reference).map(|token| Match {
                provider: &**provider,
                token,
            })
        })
    }

    fn expand(&self, source: &str, mut trail: Trail, depth: usize) -> (String, Trail) {
        let mut out = String::with_capacity(source.len());
        for line in source.split('\n') {
            let Some(reference) = line.strip_prefix(INCLUDE_DIRECTIVE) else {
                out.push_str(line);
                out.push('\n');
                continue;
            };
            let reference = reference.trim_end_matches('\r');

            let Some(found) = self.find_match(reference) else {
                tracing::debug!(reference, "no provider matched include; dropped");
                trail.unresolved.push(reference.to_string());
                continue;
            };
            if trail.visited.contains(found.token) {
                continue;
            }
            if depth >= self.max_depth {
                tracing::warn!(
                    reference,
                    max_depth = self.max_depth,
                    "include nesting too deep; dropped"
                );
                trail.unresolved.push(reference.to_string());
                continue;
            }
            trail.visited.insert(found.token);

            let fragment = match found.provider.fetch(found.token) {
                Ok(fragment) => fragment,
                Err(err) => {
                    tracing::warn!(
                        token = found.token,
                        error = %err,
                        "include fetch failed; dropped"
                    );
                    trail.unresolved.push(reference.to_string());
                    continue;
                }
            };
            let (expanded, next) = self.expand(&fragment, trail, depth + 1);
            trail = next;
            out.push_str(&expanded);
            out.push('\n');
        }
        (out.trim().to_string(), trail)
    }
}
