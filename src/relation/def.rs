//! Relation definitions.
//!
//! A [`RelationDef`] is declared once per relation and is immutable after registration.
//! Its [`RelationKind`] is a closed set, so the condition compiler and the nested mutation
//! orchestrator match on it exhaustively.
//!
//! # Example
//!
//! ```no_run
//! use lifeguard_relations::relation::{JoinTableKeys, RelationDef, Target};
//!
//! // user.id = profile.userId
//! let profile = RelationDef::has_one("profile", "profile", "id", "userId");
//! // profile.userId = user.id
//! let owner = RelationDef::belongs_to("user", Target::deferred(|| "user".to_string()), "userId", "id");
//! // post -> postTags -> tag
//! let tags = RelationDef::through("tags", "postTags", "tag");
//! let labels = RelationDef::has_and_belongs_to_many(
//!     "labels",
//!     "tag",
//!     JoinTableKeys::new("post_label", "id", "id", "post_id", "tag_id"),
//! );
//! ```

use once_cell::sync::OnceCell;
use sea_query::Condition;
use std::fmt;
use std::sync::Arc;

use super::hooks::{HookEvent, Hooks};
use super::identity::Identity;
use crate::executor::{LifeError, LifeExecutor, Record};

/// Extra predicate on the related alias, applied in every context the relation compiles to.
pub type ScopeFn = Arc<dyn Fn(&str) -> Condition + Send + Sync>;

/// The entity a relation points at.
#[derive(Clone)]
pub enum Target {
    Named(String),
    /// Resolved on first use, permitting forward references and mutual cycles.
    Deferred(Arc<dyn Fn() -> String + Send + Sync>),
}

impl Target {
    pub fn deferred<F>(resolve: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Target::Deferred(Arc::new(resolve))
    }

    pub(crate) fn resolve(&self) -> String {
        match self {
            Target::Named(name) => name.clone(),
            Target::Deferred(resolve) => resolve(),
        }
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Named(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Named(name)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Target::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Column pairs of a direct relation: `local` on the owner, `foreign` on the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectKeys {
    pub local: Identity,
    pub foreign: Identity,
}

/// Keys of a many-to-many relation stored in a join table.
///
/// `local`/`foreign` are logical columns of the owner/target; `join_local`/`join_foreign`
/// are storage columns of the join table referencing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTableKeys {
    pub table: String,
    pub local: Identity,
    pub foreign: Identity,
    pub join_local: Identity,
    pub join_foreign: Identity,
}

impl JoinTableKeys {
    pub fn new(
        table: impl Into<String>,
        local: impl Into<Identity>,
        foreign: impl Into<Identity>,
        join_local: impl Into<Identity>,
        join_foreign: impl Into<Identity>,
    ) -> Self {
        Self {
            table: table.into(),
            local: local.into(),
            foreign: foreign.into(),
            join_local: join_local.into(),
            join_foreign: join_foreign.into(),
        }
    }
}

/// An indirect relation: follow `through` on the owner, then `source` on its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughKeys {
    pub through: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    HasOne(DirectKeys),
    HasMany(DirectKeys),
    BelongsTo(DirectKeys),
    HasAndBelongsToMany(JoinTableKeys),
    Through(ThroughKeys),
}

impl RelationKind {
    pub fn label(&self) -> &'static str {
        match self {
            RelationKind::HasOne(_) => "hasOne",
            RelationKind::HasMany(_) => "hasMany",
            RelationKind::BelongsTo(_) => "belongsTo",
            RelationKind::HasAndBelongsToMany(_) => "hasAndBelongsToMany",
            RelationKind::Through(_) => "through",
        }
    }
}

pub struct RelationDef {
    pub name: String,
    /// Entity the relation is declared on; filled in at registration.
    pub owner: String,
    pub kind: RelationKind,
    target: Option<Target>,
    resolved_target: OnceCell<String>,
    /// Overrides foreign key column nullability for `disconnect`/`set`.
    pub nullable: Option<bool>,
    pub(crate) scope: Option<ScopeFn>,
    pub(crate) hooks: Hooks,
}

impl RelationDef {
    fn new(name: impl Into<String>, kind: RelationKind, target: Option<Target>) -> Self {
        Self {
            name: name.into(),
            owner: String::new(),
            kind,
            target,
            resolved_target: OnceCell::new(),
            nullable: None,
            scope: None,
            hooks: Hooks::default(),
        }
    }

    /// The target holds the foreign key: `target.foreign = owner.local`.
    pub fn has_one(
        name: impl Into<String>,
        target: impl Into<Target>,
        local: impl Into<Identity>,
        foreign: impl Into<Identity>,
    ) -> Self {
        let keys = DirectKeys { local: local.into(), foreign: foreign.into() };
        Self::new(name, RelationKind::HasOne(keys), Some(target.into()))
    }

    pub fn has_many(
        name: impl Into<String>,
        target: impl Into<Target>,
        local: impl Into<Identity>,
        foreign: impl Into<Identity>,
    ) -> Self {
        let keys = DirectKeys { local: local.into(), foreign: foreign.into() };
        Self::new(name, RelationKind::HasMany(keys), Some(target.into()))
    }

    /// The owner holds the foreign key in `local`, referencing `foreign` on the target.
    pub fn belongs_to(
        name: impl Into<String>,
        target: impl Into<Target>,
        local: impl Into<Identity>,
        foreign: impl Into<Identity>,
    ) -> Self {
        let keys = DirectKeys { local: local.into(), foreign: foreign.into() };
        Self::new(name, RelationKind::BelongsTo(keys), Some(target.into()))
    }

    pub fn has_and_belongs_to_many(
        name: impl Into<String>,
        target: impl Into<Target>,
        keys: JoinTableKeys,
    ) -> Self {
        Self::new(name, RelationKind::HasAndBelongsToMany(keys), Some(target.into()))
    }

    /// A relation reached by following `through` on the owner and `source` on its target.
    /// The target is inferred from `source`; see [`RelationDef::expect_target`].
    pub fn through(name: impl Into<String>, through: impl Into<String>, source: impl Into<String>) -> Self {
        let keys = ThroughKeys { through: through.into(), source: source.into() };
        Self::new(name, RelationKind::Through(keys), None)
    }

    /// Declare the entity a through relation must end at. Resolution fails when the
    /// `source` relation targets anything else.
    pub fn expect_target(mut self, target: impl Into<Target>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    /// Restrict the related rows with an extra predicate on the related alias.
    pub fn scope<F>(mut self, scope: F) -> Self
    where
        F: Fn(&str) -> Condition + Send + Sync + 'static,
    {
        self.scope = Some(Arc::new(scope));
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Shorthand for adding a single hook.
    pub fn on<F>(mut self, event: HookEvent, hook: F) -> Self
    where
        F: Fn(&[Record], &dyn LifeExecutor) -> Result<(), LifeError> + Send + Sync + 'static,
    {
        self.hooks = std::mem::take(&mut self.hooks).on(event, hook);
        self
    }

    pub fn is_through(&self) -> bool {
        matches!(self.kind, RelationKind::Through(_))
    }

    pub(crate) fn declared_target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub(crate) fn resolved_target_cell(&self) -> &OnceCell<String> {
        &self.resolved_target
    }
}

impl fmt::Debug for RelationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationDef")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("nullable", &self.nullable)
            .field("scoped", &self.scope.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}
