use thiserror::Error;

/// Canonical brook error taxonomy used across crates.
///
/// Classification guidance:
/// - [`BrookError::InvalidConfig`]: execution-context/engine-option contract violations
/// - [`BrookError::Graph`]: structural plan problems (cycles, arity mismatch, bad node ids,
///   lifecycle misuse such as adding nodes after start)
/// - [`BrookError::Expression`]: construction-time expression binding failures
/// - [`BrookError::Execution`]: runtime evaluation/kernel failures on a particular batch
/// - [`BrookError::FactoryNotFound`] / [`BrookError::FactoryExists`]: node registry lookups/inserts
/// - [`BrookError::Cancelled`]: observer saw teardown before any result was produced
///
/// The enum is `Clone` on purpose: completion futures are many-reader, so a
/// node's terminal error is observed by every waiter plus the plan aggregate.
#[derive(Debug, Clone, Error)]
pub enum BrookError {
    /// Invalid execution context or engine configuration.
    ///
    /// Examples:
    /// - zero target batch size
    /// - sink watermark pair where resume >= pause
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Structural problems in the node graph.
    ///
    /// Examples:
    /// - a node (transitively) feeding itself
    /// - declared output arity not matching wired edges
    /// - mutating or restarting a plan that already started
    #[error("graph error: {0}")]
    Graph(String),

    /// Expression binding failures at node construction time.
    ///
    /// Examples:
    /// - unknown column name in a predicate, projection, or aggregate spec
    /// - operand types with no common comparison/arithmetic kernel
    #[error("expression error: {0}")]
    Expression(String),

    /// Runtime execution failures after the graph started.
    ///
    /// Examples:
    /// - evaluator/kernel failure on a particular batch
    /// - row assembly failing while finalizing aggregate output
    #[error("execution error: {0}")]
    Execution(String),

    /// Node factory lookup for an unregistered name.
    #[error("node factory not found: {0}")]
    FactoryNotFound(String),

    /// Node factory registration under a name that is already taken.
    #[error("node factory already registered: {0}")]
    FactoryExists(String),

    /// The producing side was torn down before a result was available.
    #[error("cancelled")]
    Cancelled,
}

/// Standard brook result alias.
pub type Result<T> = std::result::Result<T, BrookError>;
