//! Errors raised while defining relations, compiling relation queries, and running nested
//! mutations.

use std::fmt;

use crate::executor::LifeError;
use crate::transaction::TransactionError;

#[derive(Debug)]
pub enum RelationError {
    /// Invalid relation metadata: missing `through`/`source`, duplicate name, unknown target.
    Configuration(String),
    /// A request that cannot be honoured, detected before any SQL runs.
    Validation(String),
    /// A record the operation depends on does not exist.
    NotFound(String),
    /// The operation needs exactly one anchoring row but the query may match several.
    AmbiguousRecord(String),
    /// Error from the executor, passed through unmodified.
    Storage(LifeError),
}

impl RelationError {
    pub(crate) fn not_found() -> Self {
        RelationError::NotFound("Record is not found".to_string())
    }

    pub(crate) fn batch_option(option: &str) -> Self {
        RelationError::Validation(format!("`{option}` option is not allowed in a batch update"))
    }
}

impl fmt::Display for RelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationError::Configuration(s) => write!(f, "Configuration error: {s}"),
            RelationError::Validation(s) => write!(f, "Validation error: {s}"),
            RelationError::NotFound(s) => write!(f, "Not found: {s}"),
            RelationError::AmbiguousRecord(s) => write!(f, "Ambiguous record: {s}"),
            RelationError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RelationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelationError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LifeError> for RelationError {
    fn from(err: LifeError) -> Self {
        RelationError::Storage(err)
    }
}

impl From<TransactionError> for RelationError {
    fn from(err: TransactionError) -> Self {
        RelationError::Storage(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_batch_option_message() {
        let err = RelationError::batch_option("set");
        assert!(err.to_string().contains("`set` option is not allowed in a batch update"));
    }

    #[test]
    fn test_storage_error_is_preserved() {
        let err: RelationError = LifeError::QueryError("duplicate key".into()).into();
        assert_eq!(err.to_string(), "Query error: duplicate key");
        assert!(err.source().is_some());
    }
}
