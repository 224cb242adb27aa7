//! Statement execution over `may_postgres`.
//!
//! The relation layer talks to the database exclusively through [`LifeExecutor`]. Every
//! statement arrives as `$n`-parameterized SQL plus the `sea_query::Values` produced by
//! `PostgresQueryBuilder`, and every row comes back as a JSON [`Record`] keyed by output
//! column name. Nested relation selections are therefore plain JSON objects and arrays.
//!
//! [`LifeConnection`] adds transaction scoping on top of the executor; nested mutations
//! run all of their statements through the [`LifeTransaction`] it hands out.

use may_postgres::Client;
use sea_query::Values;
use std::fmt;
use std::time::Instant;

use crate::query::value_conversion::with_converted_params;
use crate::transaction::{IsolationLevel, Transaction, TransactionError};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// One result row, keyed by output column name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// `LifeExecutor` error type
#[derive(Debug)]
pub enum LifeError {
    /// `PostgreSQL` error from `may_postgres`
    PostgresError(may_postgres::Error),
    /// Query execution error
    QueryError(String),
    /// Row parsing/conversion error
    ParseError(String),
    /// Other execution errors
    Other(String),
}

impl fmt::Display for LifeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifeError::PostgresError(e) => write!(f, "PostgreSQL error: {e}"),
            LifeError::QueryError(s) => write!(f, "Query error: {s}"),
            LifeError::ParseError(s) => write!(f, "Parse error: {s}"),
            LifeError::Other(s) => write!(f, "Execution error: {s}"),
        }
    }
}

impl std::error::Error for LifeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LifeError::PostgresError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<may_postgres::Error> for LifeError {
    fn from(err: may_postgres::Error) -> Self {
        LifeError::PostgresError(err)
    }
}

/// Trait for executing database operations
///
/// Implemented by the direct client executor, by transactions, and by the scripted
/// mock used in tests, so compiled queries and cascades run unchanged against any of them.
pub trait LifeExecutor {
    /// Execute a statement and return the number of rows affected
    ///
    /// # Errors
    ///
    /// Returns `LifeError` if the statement fails.
    fn execute(&self, sql: &str, values: &Values) -> Result<u64, LifeError>;

    /// Execute a query and return every row as a [`Record`]
    ///
    /// Data-modifying statements must carry a `RETURNING` clause to produce rows.
    ///
    /// # Errors
    ///
    /// Returns `LifeError` if the query fails or a row cannot be decoded.
    fn query_all(&self, sql: &str, values: &Values) -> Result<Vec<Record>, LifeError>;

    /// Execute a query and return its first row, if any
    ///
    /// # Errors
    ///
    /// Returns `LifeError` if the query fails or a row cannot be decoded.
    fn query_one(&self, sql: &str, values: &Values) -> Result<Option<Record>, LifeError> {
        Ok(self.query_all(sql, values)?.into_iter().next())
    }
}

/// An executor that can open a transaction scope.
pub trait LifeConnection: LifeExecutor {
    /// Begin a transaction at the given isolation level
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if `BEGIN` fails.
    fn begin(
        &self,
        isolation_level: IsolationLevel,
    ) -> Result<Box<dyn LifeTransaction + '_>, TransactionError>;
}

/// An open transaction. Dropping it without committing leaves the rollback to the server.
pub trait LifeTransaction: LifeExecutor {
    /// The transaction viewed as a plain executor.
    fn executor(&self) -> &dyn LifeExecutor;

    /// Commit every statement executed in this transaction
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if `COMMIT` fails or the transaction is closed.
    fn commit(self: Box<Self>) -> Result<(), TransactionError>;

    /// Discard every statement executed in this transaction
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if `ROLLBACK` fails or the transaction is closed.
    fn rollback(self: Box<Self>) -> Result<(), TransactionError>;
}

/// Wrap a statement so that each of its rows comes back as a single JSON column.
pub(crate) fn json_rows_sql(sql: &str) -> String {
    format!("WITH q AS ({sql}) SELECT row_to_json(q.*) FROM q")
}

/// Execute `sql` on a client and decode the single JSON column of every row.
pub(crate) fn query_records(client: &Client, sql: &str, values: &Values) -> Result<Vec<Record>, LifeError> {
    let wrapped = json_rows_sql(sql);
    let rows = with_converted_params(values, |params| {
        client.query(wrapped.as_str(), params).map_err(LifeError::from)
    })?;

    rows.iter()
        .map(|row| {
            let value: serde_json::Value = row
                .try_get(0)
                .map_err(|e| LifeError::ParseError(format!("Failed to decode row: {e}")))?;
            match value {
                serde_json::Value::Object(record) => Ok(record),
                other => Err(LifeError::ParseError(format!("Expected a JSON object row, got {other}"))),
            }
        })
        .collect()
}

/// Execute `sql` on a client and return the affected row count.
pub(crate) fn execute_statement(client: &Client, sql: &str, values: &Values) -> Result<u64, LifeError> {
    with_converted_params(values, |params| client.execute(sql, params).map_err(LifeError::from))
}

/// Time a statement and record it in the configured observability sinks.
pub(crate) fn instrumented<R>(sql: &str, run: impl FnOnce() -> Result<R, LifeError>) -> Result<R, LifeError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::execute_query_span(sql).entered();

    log::debug!("executing: {sql}");
    let start = Instant::now();
    let result = run();
    let duration = start.elapsed();

    #[cfg(feature = "metrics")]
    {
        if result.is_err() {
            METRICS.record_query_error();
        }
        METRICS.record_query_duration(duration);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = duration;

    result
}

/// Implementation of `LifeExecutor` for `may_postgres::Client`
pub struct MayPostgresExecutor {
    client: Client,
}

impl MayPostgresExecutor {
    /// Create a new executor from a `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with a connection string and wrap the resulting client
    ///
    /// # Errors
    ///
    /// Returns `LifeError::Other` when the connection cannot be established.
    pub fn connect(connection_string: &str) -> Result<Self, LifeError> {
        let client = crate::connection::connect(connection_string)
            .map_err(|e| LifeError::Other(format!("Connection error: {e}")))?;
        Ok(Self::new(client))
    }

    /// Get a reference to the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Consume the executor and return the underlying client
    pub fn into_client(self) -> Client {
        self.client
    }
}

impl LifeExecutor for MayPostgresExecutor {
    fn execute(&self, sql: &str, values: &Values) -> Result<u64, LifeError> {
        instrumented(sql, || execute_statement(&self.client, sql, values))
    }

    fn query_all(&self, sql: &str, values: &Values) -> Result<Vec<Record>, LifeError> {
        instrumented(sql, || query_records(&self.client, sql, values))
    }
}

impl LifeConnection for MayPostgresExecutor {
    fn begin(
        &self,
        isolation_level: IsolationLevel,
    ) -> Result<Box<dyn LifeTransaction + '_>, TransactionError> {
        let transaction = Transaction::new_with_isolation(self.client.clone(), isolation_level)?;
        Ok(Box::new(transaction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_life_error_display() {
        let err = LifeError::QueryError("test error".to_string());
        assert!(err.to_string().contains("Query error"));
        assert!(LifeError::ParseError("x".into()).to_string().contains("Parse error"));
        assert!(LifeError::Other("x".into()).to_string().contains("Execution error"));
    }

    #[test]
    fn test_json_rows_sql_wraps_statement() {
        let sql = json_rows_sql(r#"DELETE FROM "profile" RETURNING *"#);
        assert_eq!(
            sql,
            r#"WITH q AS (DELETE FROM "profile" RETURNING *) SELECT row_to_json(q.*) FROM q"#
        );
    }
}
