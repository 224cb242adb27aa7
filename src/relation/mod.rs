//! Relation definitions and their compilation to SQL predicates.
//!
//! - **Def**: relation definition types (`RelationDef`, `RelationKind`, key sets)
//! - **Registry**: name-keyed store of entities and relations, lazy target resolution
//! - **Through**: resolution of indirect relations via named `through`/`source` edges
//! - **Condition**: the join-condition compiler shared by every query shape
//! - **Hooks**: observer functions fired by nested mutations
//!
//! Query shapes built on top of compiled conditions live in [`crate::query`]; nested
//! mutations in [`crate::mutation`].

pub mod identity;
#[doc(inline)]
pub use identity::Identity;

pub mod def;
#[doc(inline)]
pub use def::{DirectKeys, JoinTableKeys, RelationDef, RelationKind, ScopeFn, Target, ThroughKeys};

pub mod error;
#[doc(inline)]
pub use error::RelationError;

pub mod hooks;
#[doc(inline)]
pub use hooks::{Hook, HookEvent, Hooks};

pub mod registry;
#[doc(inline)]
pub use registry::{Registry, RegistryBuilder};

pub mod through;
#[doc(inline)]
pub use through::ThroughPath;

pub mod condition;
#[doc(inline)]
pub use condition::{compile, AliasScope, BaseRef};
