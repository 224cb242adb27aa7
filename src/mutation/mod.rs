//! Nested mutations.
//!
//! A create or update payload carries column values plus per-relation instructions
//! ([`NestedMutation`]). The whole payload is validated against the relation kinds and the
//! single-row status of the owning query before any SQL runs, then executed as one cascade
//! inside a single transaction at the configured isolation level. A failure anywhere rolls
//! back every earlier statement of the cascade.
//!
//! Which side owns the foreign key decides the order of the cascade: `belongsTo` parents are
//! resolved or created first so their keys can be copied into the row being written;
//! `hasOne`/`hasMany` children and join-table links are written after the owning rows exist.
//!
//! # Example
//!
//! ```no_run
//! use lifeguard_relations::mutation::{CreateData, NestedMutation};
//! use lifeguard_relations::{LifeConnection, Query, Record, RelationError};
//! use serde_json::json;
//!
//! # fn run(users: Query, conn: &dyn LifeConnection, values: Record, profile: Record) -> Result<(), RelationError> {
//! let user = users.create(
//!     conn,
//!     CreateData::new(values).with("profile", NestedMutation::Create(CreateData::new(profile))),
//! )?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod cascade;
pub(crate) mod statements;
pub(crate) mod validate;

use crate::executor::{LifeConnection, LifeExecutor, Record};
use crate::query::Query;
use crate::relation::RelationError;
use crate::transaction::IsolationLevel;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Values of one row to insert, plus nested mutations of its relations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateData {
    pub values: Record,
    pub relations: Vec<(String, NestedMutation)>,
}

impl CreateData {
    pub fn new(values: Record) -> Self {
        Self { values, relations: Vec::new() }
    }

    pub fn with(mut self, relation: impl Into<String>, mutation: NestedMutation) -> Self {
        self.relations.push((relation.into(), mutation));
        self
    }
}

/// Column patch for the rows matched by a query, plus nested mutations of their relations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateData {
    pub values: Record,
    pub relations: Vec<(String, NestedMutation)>,
}

impl UpdateData {
    pub fn new(values: Record) -> Self {
        Self { values, relations: Vec::new() }
    }

    pub fn with(mut self, relation: impl Into<String>, mutation: NestedMutation) -> Self {
        self.relations.push((relation.into(), mutation));
        self
    }
}

/// Connect the row matching `lookup`, or create `create` when nothing matches.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOrCreate {
    pub lookup: Record,
    pub create: CreateData,
}

/// Instruction for one relation of a row being created or updated.
///
/// Lookups are unique filters on the related entity such as `{"id": 3}`. An empty lookup
/// list on `Disconnect`, `Delete` and `Update` addresses every currently linked row.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedMutation {
    Create(CreateData),
    CreateMany(Vec<CreateData>),
    Connect(Vec<Record>),
    ConnectOrCreate(Vec<ConnectOrCreate>),
    Disconnect(Vec<Record>),
    Set(Vec<Record>),
    Delete(Vec<Record>),
    Update { lookups: Vec<Record>, values: Record },
    Upsert { update: Record, create: CreateData },
}

impl NestedMutation {
    /// The option name used in error messages.
    pub fn option(&self) -> &'static str {
        match self {
            NestedMutation::Create(_) => "create",
            NestedMutation::CreateMany(_) => "createMany",
            NestedMutation::Connect(_) => "connect",
            NestedMutation::ConnectOrCreate(_) => "connectOrCreate",
            NestedMutation::Disconnect(_) => "disconnect",
            NestedMutation::Set(_) => "set",
            NestedMutation::Delete(_) => "delete",
            NestedMutation::Update { .. } => "update",
            NestedMutation::Upsert { .. } => "upsert",
        }
    }
}

/// Run `cascade` in a transaction on `conn`, committing on success and rolling back on error.
pub(crate) fn in_transaction<R>(
    conn: &dyn LifeConnection,
    isolation: IsolationLevel,
    entity: &str,
    operation: &'static str,
    cascade: impl FnOnce(&dyn LifeExecutor) -> Result<R, RelationError>,
) -> Result<R, RelationError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::nested_mutation_span(entity, operation).entered();

    let tx = conn.begin(isolation)?;
    match cascade(tx.executor()) {
        Ok(result) => {
            tx.commit()?;
            #[cfg(feature = "metrics")]
            METRICS.record_cascade();
            Ok(result)
        }
        Err(err) => {
            log::warn!("nested {operation} on `{entity}` rolled back: {err}");
            if let Err(rollback) = tx.rollback() {
                log::warn!("rollback of nested {operation} on `{entity}` failed: {rollback}");
            }
            #[cfg(feature = "metrics")]
            METRICS.record_cascade_rollback();
            Err(err)
        }
    }
}

impl Query {
    fn isolation(&self) -> IsolationLevel {
        self.registry.settings().mutation_isolation
    }

    /// Insert one row and run its nested mutations, returning the inserted row.
    ///
    /// On a [`chain`](Query::chain)ed query the row is inserted with the foreign key taken
    /// from the single row the base query matches; on a
    /// [`query_related`](Query::query_related) query, from the record it was built from.
    ///
    /// # Errors
    ///
    /// `ValidationError` for payloads the relations do not allow, `AmbiguousRecord` for a
    /// chained create on a base query that may match several rows, `NotFound` for a missing
    /// connect target or anchoring row, or the storage error that aborted the cascade.
    pub fn create(&self, conn: &dyn LifeConnection, data: CreateData) -> Result<Record, RelationError> {
        self.create_optional(conn, data)?.ok_or_else(RelationError::not_found)
    }

    /// Like [`Query::create`], but a chained create on an [`optional`](Query::optional)
    /// query whose base matches no row inserts nothing and returns `None`.
    ///
    /// # Errors
    ///
    /// See [`Query::create`].
    pub fn create_optional(&self, conn: &dyn LifeConnection, data: CreateData) -> Result<Option<Record>, RelationError> {
        let registry = self.registry.as_ref();
        let plan = cascade::plan_create(self)?;
        validate::validate_create(registry, self.entity_def()?, std::slice::from_ref(&data))?;

        in_transaction(conn, self.isolation(), &self.entity, "create", |exec| {
            let mut rows = cascade::Cascade::new(registry, exec).create_planned(self, &plan, vec![data])?;
            Ok(rows.pop())
        })
    }

    /// Insert several rows in one statement and run their nested mutations, batching each
    /// nested option across the rows.
    ///
    /// # Errors
    ///
    /// See [`Query::create`].
    pub fn create_many(&self, conn: &dyn LifeConnection, data: Vec<CreateData>) -> Result<Vec<Record>, RelationError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let registry = self.registry.as_ref();
        let plan = cascade::plan_create(self)?;
        validate::validate_create(registry, self.entity_def()?, &data)?;

        in_transaction(conn, self.isolation(), &self.entity, "create", |exec| {
            cascade::Cascade::new(registry, exec).create_planned(self, &plan, data)
        })
    }

    /// Patch every row this query matches and run the nested mutations against them,
    /// returning the updated rows. Options that need a single target row are rejected
    /// unless the query is provably single-row.
    ///
    /// # Errors
    ///
    /// `ValidationError` (e.g. "`set` option is not allowed in a batch update"), `NotFound`
    /// for a missing connect target, or the storage error that aborted the cascade.
    pub fn update(&self, conn: &dyn LifeConnection, data: UpdateData) -> Result<Vec<Record>, RelationError> {
        let registry = self.registry.as_ref();
        validate::validate_update(registry, self.entity_def()?, &data, self.is_single_row())?;

        in_transaction(conn, self.isolation(), &self.entity, "update", |exec| {
            cascade::Cascade::new(registry, exec).update(self, data)
        })
    }

    /// Delete every row this query matches, returning the deleted rows.
    ///
    /// # Errors
    ///
    /// Returns the compile or storage error.
    pub fn delete(&self, executor: &dyn LifeExecutor) -> Result<Vec<Record>, RelationError> {
        let entity = self.entity_def()?;
        let condition = statements::target_condition(self)?;
        statements::delete(executor, entity, condition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LifeError;
    use crate::test_helpers::{fixtures, record, MockConnection, MockEvent};
    use serde_json::json;

    #[test]
    fn test_option_names() {
        assert_eq!(NestedMutation::Set(vec![]).option(), "set");
        assert_eq!(NestedMutation::CreateMany(vec![]).option(), "createMany");
        assert_eq!(
            NestedMutation::Upsert { update: Record::new(), create: CreateData::default() }.option(),
            "upsert"
        );
    }

    #[test]
    fn test_transaction_commits_and_uses_configured_isolation() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 1, "name": "ann", "email": "a@b.c"})]);
        let users = Query::new(&fixtures::registry(), "user").unwrap();
        let user = users
            .create(&conn, CreateData::new(record(json!({"name": "ann", "email": "a@b.c"}))))
            .unwrap();
        assert_eq!(user["id"], json!(1));

        let events = conn.events();
        assert_eq!(events.first(), Some(&MockEvent::Begin(IsolationLevel::ReadCommitted)));
        assert_eq!(events.last(), Some(&MockEvent::Commit));
    }

    #[test]
    fn test_optional_chain_create_without_base_row() {
        let users = Query::new(&fixtures::registry(), "user").unwrap();
        let data = || CreateData::new(record(json!({"title": "a"})));

        let conn = MockConnection::new();
        let posts = users.clone().find([json!(1)]).unwrap().optional().chain("posts").unwrap();
        assert_eq!(posts.create_optional(&conn, data()).unwrap(), None);
        let statements = conn.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].starts_with(r#"INSERT INTO "post" ("user_id", "title") SELECT"#), "{}", statements[0]);
        assert_eq!(conn.events().last(), Some(&MockEvent::Commit));

        let conn = MockConnection::new();
        let required = users.find([json!(1)]).unwrap().chain("posts").unwrap();
        let err = required.create(&conn, data()).unwrap_err();
        assert_eq!(err.to_string(), "Not found: Record is not found");
        assert_eq!(conn.events().last(), Some(&MockEvent::Rollback));
    }

    #[test]
    fn test_failure_rolls_back() {
        let conn = MockConnection::new();
        conn.push_error(LifeError::QueryError("duplicate key".into()));
        let users = Query::new(&fixtures::registry(), "user").unwrap();
        let err = users
            .create(&conn, CreateData::new(record(json!({"name": "ann", "email": "a@b.c"}))))
            .unwrap_err();
        assert_eq!(err.to_string(), "Query error: duplicate key");
        assert_eq!(conn.events().last(), Some(&MockEvent::Rollback));
        assert!(!conn.events().contains(&MockEvent::Commit));
    }

    #[test]
    fn test_delete_returns_deleted_rows() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 3, "user_id": 1, "title": "x"})]);
        let posts = Query::new(&fixtures::registry(), "post").unwrap().where_eq("id", json!(3));
        let deleted = posts.delete(&conn).unwrap();
        assert_eq!(deleted[0]["userId"], json!(1));
        assert_eq!(conn.statements()[0], r#"DELETE FROM "post" WHERE "post"."id" = $1 RETURNING *"#);
    }
}
