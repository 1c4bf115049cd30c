//! Error taxonomy shared by the entity store, message stores, filters, and
//! router.
//!
//! Entity and lock errors are returned synchronously to the caller and never
//! retried internally. Reaching the max delivery count is *not* an error —
//! it surfaces as an automatic dead-letter transition.

use uuid::Uuid;

/// Broker engine error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Entity (or deferred sequence number) lookup failed.
    #[error("'{0}' not found")]
    NotFound(String),

    /// An entity with the same name already exists in this scope.
    #[error("'{0}' already exists")]
    AlreadyExists(String),

    /// A SQL filter expression failed to compile.
    #[error("filter syntax error at position {position}: {message}")]
    FilterSyntax { position: usize, message: String },

    /// A correlation filter exceeded a size limit.
    #[error("correlation filter limit exceeded: {0}")]
    FilterLimitExceeded(String),

    /// A subscription already holds the maximum number of rules.
    #[error("rule limit exceeded on subscription '{0}'")]
    RuleLimitExceeded(String),

    /// The lock token is unknown or its lock has already expired.
    #[error("lock {0} not found or expired")]
    LockLost(Uuid),

    /// The entity requires a session and none was supplied.
    #[error("entity '{0}' requires a session")]
    SessionRequired(String),

    /// Topology configuration could not be parsed or applied.
    #[error("invalid topology: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
