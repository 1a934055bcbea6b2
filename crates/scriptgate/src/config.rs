use std::time::Duration;

/// Default wall-clock budget for a single execution.
pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(3);

/// Limits and configuration for script execution.
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Maximum wall-clock duration for a script run before it is terminated.
    pub max_runtime: Duration,
    /// Maximum number of operations the engine may perform. Zero means unlimited,
    /// leaving `max_runtime` as the only bound.
    pub max_operations: u64,
    /// Maximum call stack depth.
    pub max_call_levels: usize,
    /// Maximum expression nesting depth.
    pub max_expr_depth: usize,
    /// Maximum depth for function expressions.
    pub max_function_expr_depth: usize,
    /// Maximum size of any string value.
    pub max_string_size: usize,
    /// Maximum size of any array.
    pub max_array_size: usize,
    /// Maximum size of any map.
    pub max_map_size: usize,
    /// Maximum number of variables in scope.
    pub max_variables: usize,
    /// Maximum number of functions allowed.
    pub max_functions: usize,
    /// Maximum number of modules that can be loaded.
    pub max_modules: usize,
    /// Maximum nesting of `#include` directives. Deeper directives are dropped.
    pub max_include_depth: usize,
    /// Fail an execution whose source dropped any `#include` directive instead
    /// of evaluating what remains.
    pub strict_includes: bool,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_runtime: DEFAULT_MAX_RUNTIME,
            max_operations: 0,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
            max_string_size: 1_000_000,
            max_array_size: 100_000,
            max_map_size: 100_000,
            max_variables: 10_000,
            max_functions: 1_000,
            max_modules: 10,
            max_include_depth: 64,
            strict_includes: false,
        }
    }
}

impl ScriptConfig {
    /// Replace the wall-clock budget.
    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    /// Toggle strict include handling.
    pub fn with_strict_includes(mut self, strict: bool) -> Self {
        self.strict_includes = strict;
        self
    }
}
