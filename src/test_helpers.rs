//! Testing support: a scripted connection and a shared fixture schema.
//!
//! [`MockConnection`] implements [`LifeConnection`] without a database. It records every
//! statement and transaction event and answers queries from a queue of scripted results,
//! returning no rows once the queue is empty.

use std::cell::RefCell;
use std::collections::VecDeque;

use sea_query::{Value, Values};

use crate::executor::{LifeConnection, LifeError, LifeExecutor, LifeTransaction, Record};
use crate::transaction::{IsolationLevel, TransactionError};

#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Begin(IsolationLevel),
    Commit,
    Rollback,
    Statement { sql: String, values: Vec<Value> },
}

#[derive(Default)]
pub struct MockConnection {
    responses: RefCell<VecDeque<Result<Vec<Record>, LifeError>>>,
    events: RefCell<Vec<MockEvent>>,
}

/// Turn `json!` objects into records. Non-object values are skipped.
pub fn records(rows: Vec<serde_json::Value>) -> Vec<Record> {
    rows.into_iter()
        .filter_map(|row| match row {
            serde_json::Value::Object(record) => Some(record),
            _ => None,
        })
        .collect()
}

/// A single `json!` object as a record.
///
/// # Panics
///
/// Panics when `value` is not an object.
pub fn record(value: serde_json::Value) -> Record {
    match value {
        serde_json::Value::Object(record) => record,
        other => panic!("expected a JSON object, got {other}"),
    }
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the rows returned by the next statement.
    pub fn push_rows(&self, rows: Vec<serde_json::Value>) -> &Self {
        self.responses.borrow_mut().push_back(Ok(records(rows)));
        self
    }

    /// Queue an error for the next statement.
    pub fn push_error(&self, error: LifeError) -> &Self {
        self.responses.borrow_mut().push_back(Err(error));
        self
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.events.borrow().clone()
    }

    /// SQL text of every executed statement, in order.
    pub fn statements(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                MockEvent::Statement { sql, .. } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// Bound values of the `index`-th statement.
    pub fn values_of(&self, index: usize) -> Vec<Value> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                MockEvent::Statement { values, .. } => Some(values.clone()),
                _ => None,
            })
            .nth(index)
            .unwrap_or_default()
    }

    fn next(&self, sql: &str, values: &Values) -> Result<Vec<Record>, LifeError> {
        self.events.borrow_mut().push(MockEvent::Statement {
            sql: sql.to_string(),
            values: values.iter().cloned().collect(),
        });
        self.responses.borrow_mut().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

impl LifeExecutor for MockConnection {
    fn execute(&self, sql: &str, values: &Values) -> Result<u64, LifeError> {
        self.next(sql, values).map(|rows| rows.len() as u64)
    }

    fn query_all(&self, sql: &str, values: &Values) -> Result<Vec<Record>, LifeError> {
        self.next(sql, values)
    }
}

impl LifeConnection for MockConnection {
    fn begin(&self, isolation_level: IsolationLevel) -> Result<Box<dyn LifeTransaction + '_>, TransactionError> {
        self.events.borrow_mut().push(MockEvent::Begin(isolation_level));
        Ok(Box::new(MockTransaction { conn: self }))
    }
}

pub struct MockTransaction<'a> {
    conn: &'a MockConnection,
}

impl LifeExecutor for MockTransaction<'_> {
    fn execute(&self, sql: &str, values: &Values) -> Result<u64, LifeError> {
        self.conn.execute(sql, values)
    }

    fn query_all(&self, sql: &str, values: &Values) -> Result<Vec<Record>, LifeError> {
        self.conn.query_all(sql, values)
    }
}

impl LifeTransaction for MockTransaction<'_> {
    fn executor(&self) -> &dyn LifeExecutor {
        self
    }

    fn commit(self: Box<Self>) -> Result<(), TransactionError> {
        self.conn.events.borrow_mut().push(MockEvent::Commit);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), TransactionError> {
        self.conn.events.borrow_mut().push(MockEvent::Rollback);
        Ok(())
    }
}

/// The schema shared by unit and integration tests.
///
/// ```text
/// user(id, name, email)            profile(id, user_id, bio)
/// post(id, user_id, title)         tag(id, name)
/// post_tag(post_id, tag_id)        post_label(post_id, tag_id)   -- join table only
/// ```
pub mod fixtures {
    use std::sync::Arc;

    use crate::entity::{ColumnDef, EntityDef};
    use crate::relation::{Hooks, JoinTableKeys, Registry, RegistryBuilder, RelationDef, Target};

    pub fn entities() -> RegistryBuilder {
        Registry::builder()
            .entity(
                EntityDef::new("user")
                    .column(ColumnDef::integer("id").primary_key())
                    .column(ColumnDef::text("name"))
                    .column(ColumnDef::text("email").unique()),
            )
            .entity(
                EntityDef::new("profile")
                    .column(ColumnDef::integer("id").primary_key())
                    .column(ColumnDef::integer("userId").storage("user_id").nullable())
                    .column(ColumnDef::text("bio").nullable()),
            )
            .entity(
                EntityDef::new("post")
                    .column(ColumnDef::integer("id").primary_key())
                    .column(ColumnDef::integer("userId").storage("user_id"))
                    .column(ColumnDef::text("title")),
            )
            .entity(
                EntityDef::new("tag")
                    .column(ColumnDef::integer("id").primary_key())
                    .column(ColumnDef::text("name").unique()),
            )
            .entity(
                EntityDef::new("postTag")
                    .table("post_tag")
                    .column(ColumnDef::integer("postId").storage("post_id").primary_key())
                    .column(ColumnDef::integer("tagId").storage("tag_id").primary_key()),
            )
    }

    /// Fixture registry whose direct and join-table relations all carry `hooks`.
    pub fn builder_with_hooks(hooks: Hooks) -> RegistryBuilder {
        let registered = entities()
            .register(
                "user",
                [
                    RelationDef::has_one("profile", "profile", "id", "userId").hooks(hooks.clone()),
                    RelationDef::has_many("posts", "post", "id", "userId").hooks(hooks.clone()),
                    RelationDef::through("postTags", "posts", "postTags"),
                    RelationDef::through("tags", "postTags", "tag"),
                ],
            )
            .and_then(|b| {
                b.register(
                    "profile",
                    [RelationDef::belongs_to("user", Target::deferred(|| "user".to_string()), "userId", "id")
                        .hooks(hooks.clone())],
                )
            })
            .and_then(|b| {
                b.register(
                    "post",
                    [
                        RelationDef::belongs_to("user", "user", "userId", "id").hooks(hooks.clone()),
                        RelationDef::has_many("postTags", "postTag", "id", "postId").hooks(hooks.clone()),
                        RelationDef::through("tags", "postTags", "tag").expect_target("tag"),
                        RelationDef::has_and_belongs_to_many(
                            "labels",
                            "tag",
                            JoinTableKeys::new("post_label", "id", "id", "post_id", "tag_id"),
                        )
                        .hooks(hooks.clone()),
                    ],
                )
            })
            .and_then(|b| {
                b.register(
                    "postTag",
                    [
                        RelationDef::belongs_to("post", "post", "postId", "id"),
                        RelationDef::belongs_to("tag", "tag", "tagId", "id"),
                    ],
                )
            });

        match registered {
            Ok(builder) => builder,
            Err(e) => panic!("fixture schema is invalid: {e}"),
        }
    }

    pub fn registry() -> Arc<Registry> {
        registry_with_hooks(Hooks::default())
    }

    pub fn registry_with_hooks(hooks: Hooks) -> Arc<Registry> {
        match builder_with_hooks(hooks).build() {
            Ok(registry) => registry,
            Err(e) => panic!("fixture schema is invalid: {e}"),
        }
    }
}
