//! Transactions over a `may_postgres` client.
//!
//! This module provides:
//! - [`Transaction`], which implements [`LifeExecutor`] and [`LifeTransaction`]
//! - Transaction isolation levels (configurable for nested mutations)

use crate::executor::{
    execute_statement, instrumented, query_records, LifeError, LifeExecutor, LifeTransaction, Record,
};
use may_postgres::{Client, Error as PostgresError};
use sea_query::Values;
use serde::Deserialize;
use std::fmt;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Read uncommitted (PostgreSQL treats it as ReadCommitted)
    ReadUncommitted,
    /// Read committed (default)
    #[default]
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
}

impl IsolationLevel {
    /// PostgreSQL spelling of the level
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// The statement that opens a transaction at this level
    pub fn begin_sql(&self) -> String {
        format!("BEGIN ISOLATION LEVEL {}", self.to_sql())
    }
}

/// Transaction error type
#[derive(Debug)]
pub enum TransactionError {
    /// PostgreSQL error from may_postgres
    PostgresError(PostgresError),
    /// Transaction already committed or rolled back
    TransactionClosed,
    /// Other transaction errors
    Other(String),
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::PostgresError(e) => write!(f, "PostgreSQL error: {e}"),
            TransactionError::TransactionClosed => {
                write!(f, "Transaction has already been committed or rolled back")
            }
            TransactionError::Other(s) => write!(f, "Transaction error: {s}"),
        }
    }
}

impl std::error::Error for TransactionError {}

impl From<PostgresError> for TransactionError {
    fn from(err: PostgresError) -> Self {
        TransactionError::PostgresError(err)
    }
}

impl From<TransactionError> for LifeError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::PostgresError(e) => LifeError::PostgresError(e),
            TransactionError::TransactionClosed => LifeError::Other("Transaction closed".to_string()),
            TransactionError::Other(s) => LifeError::Other(s),
        }
    }
}

/// A database transaction, opened with `BEGIN` and ended by [`Transaction::commit`] or
/// [`Transaction::rollback`].
pub struct Transaction {
    client: Client,
    closed: bool,
}

impl Transaction {
    /// Open a transaction on `client` with the given isolation level
    pub(crate) fn new_with_isolation(
        client: Client,
        isolation_level: IsolationLevel,
    ) -> Result<Self, TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        client
            .execute(isolation_level.begin_sql().as_str(), &[])
            .map_err(TransactionError::from)?;

        Ok(Self {
            client,
            closed: false,
        })
    }

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has already been committed or rolled back.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();

        self.client
            .execute("COMMIT", &[])
            .map_err(TransactionError::from)?;

        self.closed = true;
        Ok(())
    }

    /// Roll back the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has already been committed or rolled back.
    pub fn rollback(mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();

        self.client
            .execute("ROLLBACK", &[])
            .map_err(TransactionError::from)?;

        self.closed = true;
        Ok(())
    }

    /// Check if the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), LifeError> {
        if self.closed {
            return Err(LifeError::Other("Transaction is closed".to_string()));
        }
        Ok(())
    }
}

impl LifeExecutor for Transaction {
    fn execute(&self, sql: &str, values: &Values) -> Result<u64, LifeError> {
        self.ensure_open()?;
        instrumented(sql, || execute_statement(&self.client, sql, values))
    }

    fn query_all(&self, sql: &str, values: &Values) -> Result<Vec<Record>, LifeError> {
        self.ensure_open()?;
        instrumented(sql, || query_records(&self.client, sql, values))
    }
}

impl LifeTransaction for Transaction {
    fn executor(&self) -> &dyn LifeExecutor {
        self
    }

    fn commit(self: Box<Self>) -> Result<(), TransactionError> {
        Transaction::commit(*self)
    }

    fn rollback(self: Box<Self>) -> Result<(), TransactionError> {
        Transaction::rollback(*self)
    }
}
