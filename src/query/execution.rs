//! Query execution methods.
//!
//! Rows come back as JSON records, relation selections already nested inside them. Mapping
//! functions bound with [`Query::map`] run after the fetch, innermost first, and are never
//! called for a relation that produced `null`.

use serde_json::Value as Json;

use super::select::{Query, Shape};
use crate::executor::{LifeExecutor, Record};
use crate::relation::RelationError;

impl Query {
    /// Execute the query and return all rows
    ///
    /// # Example
    ///
    /// ```no_run
    /// use lifeguard_relations::{LifeExecutor, Query, RelationError};
    /// # fn run(users: Query, executor: &dyn LifeExecutor) -> Result<(), RelationError> {
    /// let rows = users.select_relation("posts", "posts")?.all(executor)?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns the compile error of the query or the executor's error unmodified.
    pub fn all(&self, executor: &dyn LifeExecutor) -> Result<Vec<Record>, RelationError> {
        let (sql, values) = self.build()?;
        let rows = executor.query_all(&sql, &values)?;
        Ok(rows.into_iter().map(|row| self.apply_maps(row)).collect())
    }

    /// Execute the query limited to one row and return it, if any
    ///
    /// # Errors
    ///
    /// See [`Query::all`].
    pub fn first(&self, executor: &dyn LifeExecutor) -> Result<Option<Record>, RelationError> {
        Ok(self.clone().take().all(executor)?.into_iter().next())
    }

    /// Like [`Query::first`], failing with `NotFound` when no row matches
    ///
    /// # Errors
    ///
    /// Returns `RelationError::NotFound` when the query matches nothing.
    pub fn one(&self, executor: &dyn LifeExecutor) -> Result<Record, RelationError> {
        self.first(executor)?.ok_or_else(RelationError::not_found)
    }

    /// Execute an [`exists`](Query::exists) or [`count`](Query::count) query and return its
    /// scalar: `false`/`0` when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for a row-shaped query, otherwise see [`Query::all`].
    pub fn value(&self, executor: &dyn LifeExecutor) -> Result<Json, RelationError> {
        let fallback = match self.shape {
            Shape::Exists => Json::Bool(false),
            Shape::Count => Json::from(0),
            Shape::Rows => {
                return Err(RelationError::Validation(format!(
                    "Query on `{}` returns rows, not a value",
                    self.entity
                )))
            }
        };
        let (sql, values) = self.build()?;
        let row = executor.query_one(&sql, &values)?;
        Ok(row.and_then(|mut r| r.remove("r")).unwrap_or(fallback))
    }

    pub(crate) fn apply_maps(&self, mut record: Record) -> Record {
        for selection in &self.selections {
            if let Some(value) = record.get_mut(&selection.key) {
                selection.query.apply_nested(value);
            }
        }
        for join in self.joins.iter().filter(|j| j.lateral) {
            if let Some(value) = record.get_mut(join.query.alias_name()) {
                join.query.apply_nested(value);
            }
        }
        match &self.map {
            Some(map) => map(record),
            None => record,
        }
    }

    fn apply_nested(&self, value: &mut Json) {
        if self.shape != Shape::Rows {
            return;
        }
        match value {
            Json::Object(record) => {
                *record = self.apply_maps(std::mem::take(record));
            }
            Json::Array(items) => {
                for item in items.iter_mut() {
                    if let Json::Object(record) = item {
                        *record = self.apply_maps(std::mem::take(record));
                    }
                }
            }
            _ => {}
        }
    }
}
