//! Resolution of through relations.
//!
//! A through relation names two edges: `through`, a relation on the owner, and `source`, a
//! relation on the entity `through` reaches. Resolution follows those named edges and never
//! walks the entity graph, so entities that reference each other through a shared
//! intermediate resolve without recursion. Chains of through relations recurse one level per
//! edge; the configured maximum depth stops definitions that name themselves.

use super::def::{RelationDef, RelationKind};
use super::error::RelationError;
use super::registry::Registry;

/// The two resolved edges of a through relation.
#[derive(Debug, Clone, Copy)]
pub struct ThroughPath<'r> {
    /// Relation on the owner leading to the intermediate entity.
    pub through: &'r RelationDef,
    /// Relation on the intermediate entity leading to the target.
    pub source: &'r RelationDef,
}

fn check_depth(registry: &Registry, relation: &RelationDef, depth: usize) -> Result<(), RelationError> {
    let max = registry.settings().max_through_depth;
    if depth > max {
        return Err(RelationError::Configuration(format!(
            "Cannot define a `{}` relation on `{}`: through chain is deeper than {max} levels",
            relation.name, relation.owner
        )));
    }
    Ok(())
}

/// Look up the `through` and `source` edges of `relation`.
///
/// # Errors
///
/// Returns a `ConfigurationError` naming the relation and the missing edge.
pub fn resolve<'r>(
    registry: &'r Registry,
    relation: &'r RelationDef,
    depth: usize,
) -> Result<ThroughPath<'r>, RelationError> {
    let RelationKind::Through(keys) = &relation.kind else {
        return Err(RelationError::Configuration(format!(
            "Relation `{}` on `{}` is not a through relation",
            relation.name, relation.owner
        )));
    };
    check_depth(registry, relation, depth)?;

    let through = registry.relation(&relation.owner, &keys.through).ok_or_else(|| {
        RelationError::Configuration(format!(
            "Cannot define a `{}` relation on `{}`: cannot find `{}` relation required by the `through` option",
            relation.name, relation.owner, keys.through
        ))
    })?;

    let intermediate = registry.target_name(through, depth + 1)?;
    let source = registry.relation(intermediate, &keys.source).ok_or_else(|| {
        RelationError::Configuration(format!(
            "Cannot define a `{}` relation on `{}`: cannot find `{}` relation in `{}` required by the `source` option",
            relation.name, relation.owner, keys.source, keys.through
        ))
    })?;

    Ok(ThroughPath { through, source })
}

/// Target entity of a through relation: the target of its `source` edge.
///
/// # Errors
///
/// Returns a `ConfigurationError` for a missing edge, a chain deeper than the configured
/// maximum, or a source target that contradicts the declared one.
pub(crate) fn resolve_target(
    registry: &Registry,
    relation: &RelationDef,
    depth: usize,
) -> Result<String, RelationError> {
    let path = resolve(registry, relation, depth)?;
    let target = registry.target_name(path.source, depth + 1)?.to_string();

    if let Some(declared) = relation.declared_target() {
        let declared = declared.resolve();
        if declared != target {
            return Err(RelationError::Configuration(format!(
                "Cannot define a `{}` relation on `{}`: `{}` in `{}` targets `{target}`, not `{declared}`",
                relation.name, relation.owner, path.source.name, path.through.name
            )));
        }
    }

    Ok(target)
}
