//! Error types for the planning and execution engine.

use thiserror::Error;

/// Result type alias for recordplan operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Error kinds produced while compiling or executing a DBO.
///
/// These map directly onto the kinds described in the error handling design:
/// illegal usage, typed validation failures, cross-record integrity
/// failures, and errors surfaced verbatim from the database driver.
/// `TestFailed` (a JSON-patch `test` op failing) is not an error — it is
/// reported in the update result — and has no variant here.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Illegal call sequence, missing required parameter, inactive/finished
    /// transaction, unknown record type, invalid inclusion pattern, arity
    /// mismatch in a filter test, missing non-optional property on insert,
    /// invalid polymorphic discriminator.
    #[error("usage error: {0}")]
    Usage(String),

    /// Typed value rejected: type mismatch, NaN/Infinity, invalid datetime
    /// syntax, malformed reference, list where scalar expected.
    #[error("validation error: {0}")]
    Validation(String),

    /// Generated parameter resolves to NULL where forbidden; entangled
    /// target references nonexistent records.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Surfaced verbatim from the database driver.
    #[error("driver error: {0}")]
    Driver(#[from] tokio_postgres::Error),

    /// A referenced filter/generated parameter has no resolvable value.
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// A referenced parameter resolved to an unsupported value (NaN,
    /// infinite, or otherwise not representable as a SQL literal).
    #[error("invalid parameter {0}: {1}")]
    InvalidParameter(String, String),

    /// The supplied value's type conflicts with the parameter's declared
    /// value function.
    #[error("type mismatch for parameter {0}: {1}")]
    TypeMismatch(String, String),

    /// A reference string (`Type#id`) targets the wrong record type, or its
    /// id segment does not coerce to the target's id property type.
    #[error("invalid reference: {0}")]
    InvalidReference(String),
}

impl PlanError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(feature = "pool")]
impl From<deadpool_postgres::PoolError> for PlanError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Usage(format!("pool error: {err}"))
    }
}
