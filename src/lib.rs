//! # Lifeguard Relations
//!
//! Relation definitions, relation-aware queries and nested mutations for PostgreSQL on the
//! `may` coroutine runtime.
//!
//! Entities and their relations (`hasOne`, `hasMany`, `belongsTo`, join-table and
//! `through` chains) are registered once in a [`Registry`]. A [`Query`] on an entity can
//! then filter by related rows, join them, select them as nested JSON, or chain into
//! them, all compiled into a single statement. Creates and updates accept nested
//! mutations of related rows, executed as one transactional cascade.
//!
//! See [README on GitHub](https://github.com/microscaler/lifeguard)

pub mod config;
pub mod connection;
pub mod entity;
pub mod executor;
pub mod metrics;
pub mod mutation;
pub mod query;
pub mod relation;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
pub mod transaction;

pub use config::{OrmConfig, RelationSettings};
pub use entity::{ColumnDef, ColumnType, EntityDef};
pub use executor::{LifeConnection, LifeError, LifeExecutor, LifeTransaction, MayPostgresExecutor, Record};
pub use mutation::{ConnectOrCreate, CreateData, NestedMutation, UpdateData};
pub use query::{CountOp, Query, Shape};
pub use relation::{
    compile, AliasScope, BaseRef, DirectKeys, HookEvent, Hooks, Identity, JoinTableKeys, Registry, RegistryBuilder,
    RelationDef, RelationError, RelationKind, Target, ThroughKeys,
};
pub use transaction::{IsolationLevel, Transaction, TransactionError};
