//! ECS error types and diagnostics.
//!
//! Recoverable user errors are returned as [`EcsError`] (or as a `false` /
//! `None` sentinel on the mutation and read paths) and logged through
//! `tracing`. Broken internal bookkeeping is never returned: it aborts via
//! [`fatal!`].

use std::panic::Location;

use thiserror::Error;

use crate::{entity::Entity, id::Id};

/// ECS error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// The entity is not alive (deleted, or a stale handle).
    #[error("entity {0} is not alive")]
    DeadEntity(Entity),

    /// The id can not be used here (wildcard stored as data, dead half, ...).
    #[error("invalid id {0}")]
    InvalidId(Id),

    /// A parameter is malformed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The operation is not allowed in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A query was built without terms.
    #[error("query has no terms")]
    EmptyQuery,

    /// A term can not be compiled.
    #[error("term {index}: {reason}")]
    InvalidTerm { index: usize, reason: String },

    /// A relationship constraint rejected the operation.
    #[error("constraint violated: {0}")]
    ConstraintViolated(String),

    /// A component was accessed with the wrong Rust type.
    #[error("type mismatch for {id}: component is {actual}")]
    TypeMismatch { id: Id, actual: String },
}

/// Result type for ECS operations.
pub type EcsResult<T> = Result<T, EcsError>;

/// Log a rejected user operation together with the caller's location.
#[track_caller]
pub(crate) fn report(error: &EcsError) {
    let location = Location::caller();
    tracing::warn!(
        file = location.file(),
        line = location.line(),
        "{error}"
    );
}

/// Log and abort on a broken internal invariant.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        tracing::error!($($arg)+);
        panic!($($arg)+)
    }};
}

/// Abort with a diagnostic when an internal invariant does not hold.
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::fatal!($($arg)+);
        }
    };
}

pub(crate) use {fatal, invariant};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Generation;

    #[test]
    fn test_error_messages() {
        let entity = Entity::new(70, Generation::new());
        assert_eq!(
            EcsError::DeadEntity(entity).to_string(),
            "entity 70v0 is not alive"
        );
        assert_eq!(
            EcsError::InvalidTerm {
                index: 1,
                reason: "no source".into()
            }
            .to_string(),
            "term 1: no source"
        );
    }

    #[test]
    #[should_panic(expected = "row 3 out of bounds")]
    fn test_invariant_panics() {
        let len = 2;
        invariant!(3 < len, "row {} out of bounds", 3);
    }
}
