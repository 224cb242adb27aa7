//! Up-front checks of nested mutation payloads.
//!
//! Everything here runs before the transaction opens. A rejected payload never reaches the
//! database.

use super::{CreateData, NestedMutation, UpdateData};
use crate::entity::EntityDef;
use crate::executor::Record;
use crate::relation::{Registry, RelationDef, RelationError, RelationKind};

fn unsupported(option: &str, relation: &RelationDef, context: &str) -> RelationError {
    RelationError::Validation(format!(
        "`{option}` option is not supported by the `{}` relation of `{}` in {context}",
        relation.name, relation.owner
    ))
}

fn check_columns(entity: &EntityDef, values: &Record) -> Result<(), RelationError> {
    values.keys().try_for_each(|name| entity.column_def(name).map(|_| ()))
}

fn check_lookups(entity: &EntityDef, lookups: &[Record]) -> Result<(), RelationError> {
    for lookup in lookups {
        if lookup.is_empty() {
            return Err(RelationError::Validation(format!("Empty lookup on `{}`", entity.name)));
        }
        check_columns(entity, lookup)?;
    }
    Ok(())
}

fn reject_through(relation: &RelationDef, option: &str) -> Result<(), RelationError> {
    if relation.is_through() {
        return Err(RelationError::Validation(format!(
            "`{option}` option cannot be used on the `{}` through relation of `{}`",
            relation.name, relation.owner
        )));
    }
    Ok(())
}

fn exactly_one(option: &str, relation: &RelationDef, len: usize) -> Result<(), RelationError> {
    if len != 1 {
        return Err(RelationError::Validation(format!(
            "`{option}` option of the to-one `{}` relation takes exactly one record, got {len}",
            relation.name
        )));
    }
    Ok(())
}

/// Whether the foreign key written by `disconnect`/`set` may hold NULL.
fn nullable_key(registry: &Registry, relation: &RelationDef) -> Result<bool, RelationError> {
    if let Some(nullable) = relation.nullable {
        return Ok(nullable);
    }
    let (entity, columns) = match &relation.kind {
        RelationKind::HasOne(keys) | RelationKind::HasMany(keys) => (registry.target_of(relation)?, &keys.foreign),
        RelationKind::BelongsTo(keys) => (registry.entity(&relation.owner)?, &keys.local),
        RelationKind::HasAndBelongsToMany(_) | RelationKind::Through(_) => return Ok(true),
    };
    for col in columns.iter() {
        if !entity.column_def(col)?.nullable {
            return Ok(false);
        }
    }
    Ok(true)
}

fn require_nullable(registry: &Registry, relation: &RelationDef, option: &str) -> Result<(), RelationError> {
    if !nullable_key(registry, relation)? {
        return Err(RelationError::Validation(format!(
            "`{option}` option of the `{}` relation of `{}` requires a nullable foreign key",
            relation.name, relation.owner
        )));
    }
    Ok(())
}

/// Check create payloads of `entity`, recursing into nested creates.
pub(crate) fn validate_create(registry: &Registry, entity: &EntityDef, data: &[CreateData]) -> Result<(), RelationError> {
    for row in data {
        check_columns(entity, &row.values)?;
        for (name, mutation) in &row.relations {
            let relation = registry.find_relation(&entity.name, name)?;
            check_create_option(registry, relation, mutation)?;
        }
    }
    Ok(())
}

fn check_create_option(registry: &Registry, relation: &RelationDef, mutation: &NestedMutation) -> Result<(), RelationError> {
    let option = mutation.option();
    reject_through(relation, option)?;
    let target = registry.target_of(relation)?;
    let to_one = matches!(relation.kind, RelationKind::HasOne(_) | RelationKind::BelongsTo(_));

    match mutation {
        NestedMutation::Create(data) => validate_create(registry, target, std::slice::from_ref(data)),
        NestedMutation::CreateMany(data) if !to_one => validate_create(registry, target, data),
        NestedMutation::Connect(lookups) => {
            if to_one {
                exactly_one(option, relation, lookups.len())?;
            }
            check_lookups(target, lookups)
        }
        NestedMutation::ConnectOrCreate(items) => {
            if to_one {
                exactly_one(option, relation, items.len())?;
            }
            for item in items {
                check_lookups(target, std::slice::from_ref(&item.lookup))?;
                validate_create(registry, target, std::slice::from_ref(&item.create))?;
            }
            Ok(())
        }
        _ => Err(unsupported(option, relation, "a create")),
    }
}

/// Check an update payload of `entity`. `single` tells whether the owning query is proven
/// to match at most one row; otherwise options with an ambiguous per-row target are
/// rejected as batch options.
pub(crate) fn validate_update(
    registry: &Registry,
    entity: &EntityDef,
    data: &UpdateData,
    single: bool,
) -> Result<(), RelationError> {
    check_columns(entity, &data.values)?;
    for (name, mutation) in &data.relations {
        let relation = registry.find_relation(&entity.name, name)?;
        check_update_option(registry, relation, mutation, single)?;
    }
    Ok(())
}

fn check_update_option(
    registry: &Registry,
    relation: &RelationDef,
    mutation: &NestedMutation,
    single: bool,
) -> Result<(), RelationError> {
    let option = mutation.option();
    reject_through(relation, option)?;
    let target = registry.target_of(relation)?;
    let single_only = || {
        if single {
            Ok(())
        } else {
            Err(RelationError::batch_option(option))
        }
    };

    match (&relation.kind, mutation) {
        (_, NestedMutation::Upsert { .. }) if matches!(relation.kind, RelationKind::HasMany(_) | RelationKind::HasAndBelongsToMany(_)) => {
            Err(unsupported(option, relation, "an update"))
        }
        (RelationKind::BelongsTo(_), NestedMutation::Set(_) | NestedMutation::CreateMany(_)) => {
            Err(unsupported(option, relation, "an update"))
        }
        (RelationKind::HasOne(_), NestedMutation::CreateMany(_)) => Err(unsupported(option, relation, "an update")),

        // FK on the owner: one target row serves every matched owner row
        (RelationKind::BelongsTo(_), NestedMutation::Connect(lookups)) => {
            exactly_one(option, relation, lookups.len())?;
            check_lookups(target, lookups)
        }
        (RelationKind::BelongsTo(_), NestedMutation::Disconnect(_)) => require_nullable(registry, relation, option),
        (RelationKind::BelongsTo(_), NestedMutation::Update { lookups, values }) => {
            check_lookups(target, lookups)?;
            check_columns(target, values)
        }
        (RelationKind::BelongsTo(_), NestedMutation::Create(data)) => {
            single_only()?;
            validate_create(registry, target, std::slice::from_ref(data))
        }
        (RelationKind::BelongsTo(_), NestedMutation::ConnectOrCreate(items)) => {
            single_only()?;
            exactly_one(option, relation, items.len())?;
            check_connect_or_create(registry, target, items)
        }
        (RelationKind::BelongsTo(_), NestedMutation::Upsert { update, create }) => {
            single_only()?;
            check_columns(target, update)?;
            validate_create(registry, target, std::slice::from_ref(create))
        }
        (RelationKind::BelongsTo(_), NestedMutation::Delete(_)) => {
            single_only()?;
            require_nullable(registry, relation, option)
        }

        // FK on the child
        (RelationKind::HasOne(_) | RelationKind::HasMany(_), NestedMutation::Disconnect(lookups)) => {
            require_nullable(registry, relation, option)?;
            check_lookups(target, lookups)
        }
        (RelationKind::HasOne(_) | RelationKind::HasMany(_), NestedMutation::Delete(lookups)) => check_lookups(target, lookups),
        (RelationKind::HasOne(_) | RelationKind::HasMany(_), NestedMutation::Update { lookups, values }) => {
            check_lookups(target, lookups)?;
            check_columns(target, values)
        }
        (RelationKind::HasOne(_) | RelationKind::HasMany(_), NestedMutation::Set(lookups)) => {
            single_only()?;
            require_nullable(registry, relation, option)?;
            if matches!(relation.kind, RelationKind::HasOne(_)) && lookups.len() > 1 {
                exactly_one(option, relation, lookups.len())?;
            }
            check_lookups(target, lookups)
        }
        (RelationKind::HasOne(_), NestedMutation::Upsert { update, create }) => {
            single_only()?;
            check_columns(target, update)?;
            validate_create(registry, target, std::slice::from_ref(create))
        }
        (RelationKind::HasOne(_) | RelationKind::HasMany(_), NestedMutation::Create(data)) => {
            single_only()?;
            if matches!(relation.kind, RelationKind::HasOne(_)) {
                require_nullable(registry, relation, option)?;
            }
            validate_create(registry, target, std::slice::from_ref(data))
        }
        (RelationKind::HasMany(_), NestedMutation::CreateMany(data)) => {
            single_only()?;
            validate_create(registry, target, data)
        }
        (RelationKind::HasOne(_) | RelationKind::HasMany(_), NestedMutation::Connect(lookups)) => {
            single_only()?;
            if matches!(relation.kind, RelationKind::HasOne(_)) {
                exactly_one(option, relation, lookups.len())?;
                require_nullable(registry, relation, option)?;
            }
            check_lookups(target, lookups)
        }
        (RelationKind::HasOne(_) | RelationKind::HasMany(_), NestedMutation::ConnectOrCreate(items)) => {
            single_only()?;
            if matches!(relation.kind, RelationKind::HasOne(_)) {
                exactly_one(option, relation, items.len())?;
                require_nullable(registry, relation, option)?;
            }
            check_connect_or_create(registry, target, items)
        }

        // Links live in the join table: every option applies per matched owner row
        (RelationKind::HasAndBelongsToMany(_), NestedMutation::Create(data)) => {
            validate_create(registry, target, std::slice::from_ref(data))
        }
        (RelationKind::HasAndBelongsToMany(_), NestedMutation::CreateMany(data)) => validate_create(registry, target, data),
        (RelationKind::HasAndBelongsToMany(_), NestedMutation::ConnectOrCreate(items)) => {
            check_connect_or_create(registry, target, items)
        }
        (
            RelationKind::HasAndBelongsToMany(_),
            NestedMutation::Connect(lookups)
            | NestedMutation::Disconnect(lookups)
            | NestedMutation::Set(lookups)
            | NestedMutation::Delete(lookups),
        ) => check_lookups(target, lookups),
        (RelationKind::HasAndBelongsToMany(_), NestedMutation::Update { lookups, values }) => {
            check_lookups(target, lookups)?;
            check_columns(target, values)
        }

        (RelationKind::HasAndBelongsToMany(_) | RelationKind::HasMany(_), NestedMutation::Upsert { .. })
        | (RelationKind::Through(_), _) => Err(unsupported(option, relation, "an update")),
    }
}

fn check_connect_or_create(
    registry: &Registry,
    target: &EntityDef,
    items: &[super::ConnectOrCreate],
) -> Result<(), RelationError> {
    for item in items {
        check_lookups(target, std::slice::from_ref(&item.lookup))?;
        validate_create(registry, target, std::slice::from_ref(&item.create))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::ConnectOrCreate;
    use crate::test_helpers::{fixtures, record};
    use serde_json::json;

    fn update(relation: &str, mutation: NestedMutation, single: bool) -> Result<(), RelationError> {
        let registry = fixtures::registry();
        let owner = if relation == "user" { "post" } else { "user" };
        let data = UpdateData::default().with(relation, mutation);
        validate_update(&registry, registry.entity(owner).unwrap(), &data, single)
    }

    fn lookup(id: i64) -> Record {
        record(json!({ "id": id }))
    }

    #[test]
    fn test_batch_rejections_name_the_option() {
        for mutation in [
            NestedMutation::Set(vec![lookup(1)]),
            NestedMutation::Upsert { update: Record::new(), create: CreateData::default() },
            NestedMutation::Create(CreateData::default()),
            NestedMutation::Connect(vec![lookup(1)]),
        ] {
            let option = mutation.option();
            let err = update("profile", mutation, false).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("Validation error: `{option}` option is not allowed in a batch update")
            );
        }
    }

    #[test]
    fn test_batch_allows_disconnect_delete_update() {
        assert!(update("profile", NestedMutation::Disconnect(vec![]), false).is_ok());
        assert!(update("profile", NestedMutation::Delete(vec![]), false).is_ok());
        assert!(update(
            "profile",
            NestedMutation::Update { lookups: vec![], values: record(json!({"bio": "x"})) },
            false
        )
        .is_ok());
    }

    #[test]
    fn test_single_row_allows_set_and_upsert() {
        assert!(update("profile", NestedMutation::Set(vec![lookup(2)]), true).is_ok());
        assert!(update(
            "profile",
            NestedMutation::Upsert { update: record(json!({"bio": "x"})), create: CreateData::default() },
            true
        )
        .is_ok());
    }

    #[test]
    fn test_non_nullable_foreign_key_cannot_be_disconnected() {
        let err = update("posts", NestedMutation::Disconnect(vec![]), true).unwrap_err();
        assert!(err.to_string().contains("requires a nullable foreign key"), "{err}");
    }

    #[test]
    fn test_belongs_to_rules() {
        assert!(update("user", NestedMutation::Connect(vec![lookup(1)]), false).is_ok());
        assert!(update("user", NestedMutation::Delete(vec![]), false).is_err());
        assert!(update("user", NestedMutation::Set(vec![lookup(1)]), true).is_err());
        // post.userId is not nullable
        assert!(update("user", NestedMutation::Disconnect(vec![]), true).is_err());
    }

    #[test]
    fn test_through_relations_are_rejected() {
        let err = update("tags", NestedMutation::Connect(vec![lookup(1)]), true).unwrap_err();
        assert!(err.to_string().contains("through relation"), "{err}");
    }

    #[test]
    fn test_create_context_rules() {
        let registry = fixtures::registry();
        let user = registry.entity("user").unwrap();
        let ok = CreateData::default()
            .with("profile", NestedMutation::Connect(vec![lookup(1)]))
            .with("posts", NestedMutation::CreateMany(vec![CreateData::default()]));
        assert!(validate_create(&registry, user, &[ok]).is_ok());

        let two = CreateData::default().with("profile", NestedMutation::Connect(vec![lookup(1), lookup(2)]));
        assert!(validate_create(&registry, user, &[two]).is_err());

        let set = CreateData::default().with("posts", NestedMutation::Set(vec![lookup(1)]));
        assert!(validate_create(&registry, user, &[set]).is_err());

        let nested_bad = CreateData::default().with(
            "profile",
            NestedMutation::ConnectOrCreate(vec![ConnectOrCreate {
                lookup: lookup(1),
                create: CreateData::new(record(json!({"nickname": "x"}))),
            }]),
        );
        assert!(validate_create(&registry, user, &[nested_bad]).is_err());
    }
}
