//! Name-keyed store of entities and their relation definitions.
//!
//! Relations are registered per owner entity through [`RegistryBuilder`], then frozen into
//! an `Arc<Registry>` shared by every query. Targets are resolved lazily: a deferred target
//! callback runs on first use and its result is memoized on the definition, so two entities
//! may reference each other regardless of registration order.

use std::collections::HashMap;
use std::sync::Arc;

use super::def::{RelationDef, RelationKind};
use super::error::RelationError;
use super::through;
use crate::config::RelationSettings;
use crate::entity::EntityDef;

#[derive(Default)]
pub struct RegistryBuilder {
    entities: HashMap<String, EntityDef>,
    relations: HashMap<String, Vec<RelationDef>>,
    settings: RelationSettings,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(mut self, settings: RelationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Add an entity. Re-adding a name replaces its column schema.
    pub fn entity(mut self, entity: EntityDef) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    /// Register relations on `entity`.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` when a relation name is already taken on the entity.
    pub fn register(
        mut self,
        entity: &str,
        relations: impl IntoIterator<Item = RelationDef>,
    ) -> Result<Self, RelationError> {
        let defined = self.relations.entry(entity.to_string()).or_default();
        for mut relation in relations {
            if defined.iter().any(|r| r.name == relation.name) {
                return Err(RelationError::Configuration(format!(
                    "Relation `{}` is already defined on `{entity}`",
                    relation.name
                )));
            }
            relation.owner = entity.to_string();
            defined.push(relation);
        }
        Ok(self)
    }

    /// Freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` when relations are registered on an unknown entity or a
    /// direct relation has mismatched key arity. Targets and through chains are checked
    /// lazily; call [`Registry::validate`] to check them eagerly.
    pub fn build(self) -> Result<Arc<Registry>, RelationError> {
        for (owner, relations) in &self.relations {
            let entity = self.entities.get(owner).ok_or_else(|| {
                RelationError::Configuration(format!("Relations registered on unknown entity `{owner}`"))
            })?;
            for relation in relations {
                check_local_keys(entity, relation)?;
            }
        }

        let count: usize = self.relations.values().map(Vec::len).sum();
        log::info!(
            "relation registry built: {} entities, {count} relations",
            self.entities.len()
        );

        Ok(Arc::new(Registry {
            entities: self.entities,
            relations: self.relations,
            settings: self.settings,
        }))
    }
}

fn check_local_keys(owner: &EntityDef, relation: &RelationDef) -> Result<(), RelationError> {
    let local = match &relation.kind {
        RelationKind::HasOne(keys) | RelationKind::HasMany(keys) | RelationKind::BelongsTo(keys) => {
            if keys.local.arity() != keys.foreign.arity() {
                return Err(RelationError::Configuration(format!(
                    "Relation `{}` on `{}` pairs {} local columns with {} foreign columns",
                    relation.name,
                    owner.name,
                    keys.local.arity(),
                    keys.foreign.arity()
                )));
            }
            &keys.local
        }
        RelationKind::HasAndBelongsToMany(keys) => {
            if keys.local.arity() != keys.join_local.arity() || keys.foreign.arity() != keys.join_foreign.arity() {
                return Err(RelationError::Configuration(format!(
                    "Relation `{}` on `{}` has join table columns that do not match its keys",
                    relation.name, owner.name
                )));
            }
            &keys.local
        }
        RelationKind::Through(_) => return Ok(()),
    };

    match local.iter().find(|col| owner.find_column(col).is_none()) {
        Some(col) => Err(RelationError::Configuration(format!(
            "Relation `{}` on `{}` references unknown column `{col}`",
            relation.name, owner.name
        ))),
        None => Ok(()),
    }
}

pub struct Registry {
    entities: HashMap<String, EntityDef>,
    relations: HashMap<String, Vec<RelationDef>>,
    settings: RelationSettings,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn settings(&self) -> &RelationSettings {
        &self.settings
    }

    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown entity.
    pub fn entity(&self, name: &str) -> Result<&EntityDef, RelationError> {
        self.entities
            .get(name)
            .ok_or_else(|| RelationError::Configuration(format!("Unknown entity `{name}`")))
    }

    pub fn relation(&self, owner: &str, name: &str) -> Option<&RelationDef> {
        self.relations.get(owner)?.iter().find(|r| r.name == name)
    }

    /// Relations declared on `owner`, in registration order.
    pub fn relations_of(&self, owner: &str) -> &[RelationDef] {
        self.relations.get(owner).map_or(&[], Vec::as_slice)
    }

    /// # Errors
    ///
    /// Returns a `ConfigurationError` when `owner` has no relation called `name`.
    pub fn find_relation(&self, owner: &str, name: &str) -> Result<&RelationDef, RelationError> {
        self.relation(owner, name).ok_or_else(|| {
            RelationError::Configuration(format!("Unknown relation `{name}` on `{owner}`"))
        })
    }

    /// The entity `relation` ends at, resolving deferred targets and through chains once.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown target or a broken through chain.
    pub fn target_of(&self, relation: &RelationDef) -> Result<&EntityDef, RelationError> {
        let name = self.target_name(relation, 0)?;
        self.entity(name)
    }

    pub(crate) fn target_name<'a>(&'a self, relation: &'a RelationDef, depth: usize) -> Result<&'a str, RelationError> {
        let cell = relation.resolved_target_cell();
        if let Some(name) = cell.get() {
            return Ok(name.as_str());
        }

        let resolved = match &relation.kind {
            RelationKind::Through(_) => through::resolve_target(self, relation, depth)?,
            _ => {
                let target = relation.declared_target().ok_or_else(|| {
                    RelationError::Configuration(format!(
                        "Relation `{}` on `{}` has no target",
                        relation.name, relation.owner
                    ))
                })?;
                let name = target.resolve();
                if !self.entities.contains_key(&name) {
                    return Err(RelationError::Configuration(format!(
                        "Relation `{}` on `{}` targets unknown entity `{name}`",
                        relation.name, relation.owner
                    )));
                }
                name
            }
        };

        Ok(cell.get_or_init(|| resolved).as_str())
    }

    /// Whether `relation` yields many rows per owner row.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for a broken through chain.
    pub fn is_many(&self, relation: &RelationDef) -> Result<bool, RelationError> {
        self.is_many_at(relation, 0)
    }

    fn is_many_at(&self, relation: &RelationDef, depth: usize) -> Result<bool, RelationError> {
        match &relation.kind {
            RelationKind::HasOne(_) | RelationKind::BelongsTo(_) => Ok(false),
            RelationKind::HasMany(_) | RelationKind::HasAndBelongsToMany(_) => Ok(true),
            RelationKind::Through(_) => {
                let path = through::resolve(self, relation, depth)?;
                Ok(self.is_many_at(path.through, depth + 1)? || self.is_many_at(path.source, depth + 1)?)
            }
        }
    }

    /// Resolve every target and through chain now, failing on the first broken one.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigurationError` encountered.
    pub fn validate(&self) -> Result<(), RelationError> {
        let mut owners: Vec<_> = self.relations.keys().collect();
        owners.sort();
        for owner in owners {
            for relation in self.relations_of(owner) {
                let target = self.target_of(relation)?;
                match &relation.kind {
                    RelationKind::HasOne(keys) | RelationKind::HasMany(keys) | RelationKind::BelongsTo(keys) => {
                        for col in keys.foreign.iter() {
                            target.column_def(col).map_err(|_| {
                                RelationError::Configuration(format!(
                                    "Relation `{}` on `{owner}` references unknown column `{col}` on `{}`",
                                    relation.name, target.name
                                ))
                            })?;
                        }
                    }
                    RelationKind::HasAndBelongsToMany(keys) => {
                        for col in keys.foreign.iter() {
                            target.column_def(col).map_err(|_| {
                                RelationError::Configuration(format!(
                                    "Relation `{}` on `{owner}` references unknown column `{col}` on `{}`",
                                    relation.name, target.name
                                ))
                            })?;
                        }
                    }
                    RelationKind::Through(_) => {
                        self.is_many(relation)?;
                    }
                }
            }
        }
        Ok(())
    }
}
