//! Relation-aware query building and execution.
//!
//! # Architecture
//!
//! - **Select**: the query node (`Query`) and its builder API
//! - **Render**: compilation of nodes into `sea_query` statements, one shape per context
//!   (filtered select, correlated `EXISTS`, join, lateral join, JSON sub-select)
//! - **Execution**: `all`, `first`, `one`, `value`
//! - **Value Conversion**: SeaQuery `Value` to `ToSql` parameter conversion
//!
//! # Examples
//!
//! ```no_run
//! use lifeguard_relations::{LifeExecutor, Query, Registry, RelationError};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn run(registry: &Arc<Registry>, executor: &dyn LifeExecutor) -> Result<(), RelationError> {
//! // users that wrote a post titled "hello", with their profile
//! let users = Query::new(registry, "user")?
//!     .where_exists("posts", |p| p.where_eq("title", json!("hello")))?
//!     .select_relation("profile", "profile")?
//!     .all(executor)?;
//!
//! // the profile of user 5
//! let profile = Query::new(registry, "user")?
//!     .find([json!(5)])?
//!     .chain("profile")?
//!     .first(executor)?;
//! # Ok(())
//! # }
//! ```

pub mod select;
#[doc(inline)]
pub use select::{CountOp, FilterFn, MapFn, Query, Shape};

mod execution;
pub(crate) mod render;

pub(crate) mod value_conversion;
