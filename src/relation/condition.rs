//! Join-condition compiler.
//!
//! [`compile`] turns a relation into the predicate correlating the related alias with a
//! base: either another alias in scope or a concrete record whose key values are bound as
//! parameters. Direct relations compile to one equality per column pair in declaration
//! order. Join-table and through relations compile to an `EXISTS` over the intermediate
//! table, nested once per through level.
//!
//! Intermediate aliases are drawn from an [`AliasScope`], an immutable list of the aliases
//! visible at the point of compilation. The same relation compiled in the same scope always
//! yields the same aliases.

use sea_query::{Alias, Condition, Expr, ExprTrait, Query as SqlQuery, SelectStatement};

use super::def::{RelationDef, RelationKind};
use super::error::RelationError;
use super::identity::Identity;
use super::registry::Registry;
use super::through;
use crate::entity::EntityDef;
use crate::executor::Record;

pub(crate) fn ident(name: &str) -> Alias {
    Alias::new(name.to_owned())
}

/// `"alias"."column"`
pub(crate) fn column(alias: &str, col: &str) -> Expr {
    Expr::col((ident(alias), ident(col)))
}

/// Double-quote an identifier for use inside custom SQL fragments.
pub(crate) fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `FROM table` or `FROM table AS alias`.
pub(crate) fn from_aliased(select: &mut SelectStatement, table: &str, alias: &str) {
    if table == alias {
        select.from(ident(table));
    } else {
        select.from_as(ident(table), ident(alias));
    }
}

/// `SELECT 1 FROM table [AS alias] WHERE condition`, the body of a correlated `EXISTS`.
pub(crate) fn exists_select(table: &str, alias: &str, condition: Condition) -> SelectStatement {
    let mut select = SqlQuery::select();
    select.expr(Expr::cust("1"));
    from_aliased(&mut select, table, alias);
    select.cond_where(condition);
    select
}

/// Aliases visible at one point of a compiled statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasScope {
    taken: Vec<String>,
}

impl AliasScope {
    pub fn root() -> Self {
        Self::default()
    }

    /// Nesting depth: how many aliases enclose this point.
    pub fn depth(&self) -> usize {
        self.taken.len()
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.taken.iter().any(|a| a == alias)
    }

    /// `base` when free, otherwise `base2`, `base3`, ... whichever comes first.
    pub fn unique(&self, base: &str) -> String {
        if !self.contains(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{base}{n}"))
            .find(|candidate| !self.contains(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// This scope plus `alias`.
    pub fn with(&self, alias: &str) -> Self {
        let mut next = self.clone();
        if !next.contains(alias) {
            next.taken.push(alias.to_string());
        }
        next
    }
}

/// What the related side is correlated with.
#[derive(Debug, Clone, Copy)]
pub enum BaseRef<'a> {
    /// Columns of another alias in the statement.
    Alias(&'a str),
    /// Key values of a fetched owner record, keyed by logical column name.
    Record(&'a Record),
}

/// Compile `relation` into the predicate between `related_alias` and `base`.
///
/// # Errors
///
/// Returns a `ConfigurationError` when the relation cannot be resolved, or a
/// `ValidationError` when a base record lacks a key column.
pub fn compile(
    registry: &Registry,
    relation: &RelationDef,
    related_alias: &str,
    base: BaseRef<'_>,
    scope: &AliasScope,
) -> Result<Condition, RelationError> {
    compile_at(registry, relation, related_alias, base, scope, 0)
}

fn compile_at(
    registry: &Registry,
    relation: &RelationDef,
    related_alias: &str,
    base: BaseRef<'_>,
    scope: &AliasScope,
    depth: usize,
) -> Result<Condition, RelationError> {
    let mut scope = scope.with(related_alias);
    if let BaseRef::Alias(alias) = base {
        scope = scope.with(alias);
    }

    let mut condition = match &relation.kind {
        RelationKind::HasOne(keys) | RelationKind::HasMany(keys) | RelationKind::BelongsTo(keys) => {
            let owner = registry.entity(&relation.owner)?;
            let target = registry.target_of(relation)?;
            let mut condition = Condition::all();
            for (local, foreign) in keys.local.zip(&keys.foreign) {
                let related = column(related_alias, target.storage_of(foreign)?);
                condition = condition.add(related.eq(base_operand(owner, relation, local, base)?));
            }
            condition
        }
        RelationKind::HasAndBelongsToMany(keys) => {
            let owner = registry.entity(&relation.owner)?;
            let target = registry.target_of(relation)?;
            let join_alias = scope.unique(&keys.table);
            let mut inner = Condition::all();
            for (join_col, foreign) in keys.join_foreign.zip(&keys.foreign) {
                inner = inner.add(column(&join_alias, join_col).eq(column(related_alias, target.storage_of(foreign)?)));
            }
            for (join_col, local) in keys.join_local.zip(&keys.local) {
                inner = inner.add(column(&join_alias, join_col).eq(base_operand(owner, relation, local, base)?));
            }
            Condition::all().add(Expr::exists(exists_select(&keys.table, &join_alias, inner)))
        }
        RelationKind::Through(_) => {
            let path = through::resolve(registry, relation, depth)?;
            let intermediate = registry.target_of(path.through)?;
            let alias = scope.unique(&path.through.name);
            let inner_scope = scope.with(&alias);

            let source = compile_at(
                registry,
                path.source,
                related_alias,
                BaseRef::Alias(&alias),
                &inner_scope,
                depth + 1,
            )?;
            let through = compile_at(registry, path.through, &alias, base, &inner_scope, depth + 1)?;
            let inner = Condition::all().add(source).add(through);
            Condition::all().add(Expr::exists(exists_select(&intermediate.table, &alias, inner)))
        }
    };

    if let Some(scope_fn) = &relation.scope {
        condition = condition.add(scope_fn(related_alias));
    }
    Ok(condition)
}

fn base_operand(
    owner: &EntityDef,
    relation: &RelationDef,
    local: &str,
    base: BaseRef<'_>,
) -> Result<Expr, RelationError> {
    match base {
        BaseRef::Alias(alias) => Ok(column(alias, owner.storage_of(local)?)),
        BaseRef::Record(record) => {
            let value = record.get(local).ok_or_else(|| {
                RelationError::Validation(format!(
                    "Record is missing `{local}` required by the `{}` relation of `{}`",
                    relation.name, owner.name
                ))
            })?;
            owner.column_def(local)?.bind(value)
        }
    }
}

/// `target` rows whose `columns` equal the values of any of `records`, keyed by the logical
/// names in `keys` (matching `columns` by position).
pub(crate) fn keys_condition(
    entity: &EntityDef,
    alias: &str,
    columns: &Identity,
    keys: &Identity,
    records: &[Record],
) -> Result<Condition, RelationError> {
    let mut any = Condition::any();
    for record in records {
        let mut all = Condition::all();
        for (col, key) in columns.zip(keys) {
            let value = record.get(key).ok_or_else(|| {
                RelationError::Validation(format!("Record is missing `{key}` for `{}`", entity.name))
            })?;
            let def = entity.column_def(col)?;
            all = all.add(column(alias, &def.storage).eq(def.bind(value)?));
        }
        any = any.add(all);
    }
    Ok(any)
}

/// Rows of `entity` matching every field of `filter` (a unique lookup such as `{"id": 3}`).
pub(crate) fn record_condition(entity: &EntityDef, alias: &str, filter: &Record) -> Result<Condition, RelationError> {
    let mut all = Condition::all();
    for (name, value) in filter {
        let def = entity.column_def(name)?;
        all = all.add(column(alias, &def.storage).eq(def.bind(value)?));
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fixtures;
    use sea_query::PostgresQueryBuilder;
    use serde_json::json;

    fn render(condition: Condition) -> String {
        let mut select = SqlQuery::select();
        select.expr(Expr::cust("1")).cond_where(condition);
        select.to_string(PostgresQueryBuilder)
    }

    #[test]
    fn test_direct_relation_compiles_one_equality_per_pair() {
        let registry = fixtures::registry();
        let rel = registry.find_relation("user", "profile").unwrap();
        let sql = render(compile(&registry, rel, "profile", BaseRef::Alias("user"), &AliasScope::root()).unwrap());
        assert!(sql.ends_with(r#"WHERE "profile"."user_id" = "user"."id""#), "{sql}");

        let aliased = render(compile(&registry, rel, "p", BaseRef::Alias("u"), &AliasScope::root()).unwrap());
        assert!(aliased.ends_with(r#"WHERE "p"."user_id" = "u"."id""#), "{aliased}");
    }

    #[test]
    fn test_belongs_to_compiles_against_owner_foreign_key() {
        let registry = fixtures::registry();
        let rel = registry.find_relation("profile", "user").unwrap();
        let sql = render(compile(&registry, rel, "user", BaseRef::Alias("profile"), &AliasScope::root()).unwrap());
        assert!(sql.ends_with(r#"WHERE "user"."id" = "profile"."user_id""#), "{sql}");
    }

    #[test]
    fn test_composite_keys_keep_declaration_order() {
        let registry = fixtures::entities()
            .register(
                "post",
                [RelationDef::has_many("links", "postTag", ["id", "userId"], ["postId", "tagId"])],
            )
            .unwrap()
            .build()
            .unwrap();
        let rel = registry.find_relation("post", "links").unwrap();
        let sql = render(compile(&registry, rel, "l", BaseRef::Alias("post"), &AliasScope::root()).unwrap());
        let first = sql.find(r#""l"."post_id" = "post"."id""#).unwrap();
        let second = sql.find(r#""l"."tag_id" = "post"."user_id""#).unwrap();
        assert!(first < second, "{sql}");
    }

    #[test]
    fn test_record_base_binds_key_values() {
        let registry = fixtures::registry();
        let rel = registry.find_relation("user", "profile").unwrap();
        let record = json!({"id": 5}).as_object().cloned().unwrap();
        let sql = render(compile(&registry, rel, "profile", BaseRef::Record(&record), &AliasScope::root()).unwrap());
        assert!(sql.ends_with(r#"WHERE "profile"."user_id" = 5"#), "{sql}");

        let missing = Record::new();
        let err = compile(&registry, rel, "profile", BaseRef::Record(&missing), &AliasScope::root()).unwrap_err();
        assert!(matches!(err, RelationError::Validation(_)));
    }

    #[test]
    fn test_through_relation_nests_exists_over_intermediate() {
        let registry = fixtures::registry();
        let rel = registry.find_relation("post", "tags").unwrap();
        let sql = render(compile(&registry, rel, "tag", BaseRef::Alias("post"), &AliasScope::root()).unwrap());
        assert!(
            sql.contains(r#"(SELECT 1 FROM "post_tag" AS "postTags" WHERE "tag"."id" = "postTags"."tag_id" AND "postTags"."post_id" = "post"."id")"#),
            "{sql}"
        );
    }

    #[test]
    fn test_through_equals_manual_nesting_and_is_stable() {
        let registry = fixtures::registry();
        let tags = registry.find_relation("post", "tags").unwrap();
        let post_tags = registry.find_relation("post", "postTags").unwrap();
        let tag = registry.find_relation("postTag", "tag").unwrap();
        let root = AliasScope::root();

        let composed = render(compile(&registry, tags, "tag", BaseRef::Alias("post"), &root).unwrap());
        let again = render(compile(&registry, tags, "tag", BaseRef::Alias("post"), &root).unwrap());
        assert_eq!(composed, again);

        let inner = Condition::all()
            .add(compile(&registry, tag, "tag", BaseRef::Alias("postTags"), &root).unwrap())
            .add(compile(&registry, post_tags, "postTags", BaseRef::Alias("post"), &root).unwrap());
        let manual = render(Condition::all().add(Expr::exists(exists_select("post_tag", "postTags", inner))));
        assert_eq!(composed, manual);
    }

    #[test]
    fn test_multi_level_through_nests_twice() {
        let registry = fixtures::registry();
        let rel = registry.find_relation("user", "tags").unwrap();
        let sql = render(compile(&registry, rel, "tag", BaseRef::Alias("user"), &AliasScope::root()).unwrap());
        assert_eq!(sql.matches("EXISTS").count(), 2, "{sql}");
        assert!(sql.contains(r#"FROM "post_tag" AS "postTags""#), "{sql}");
        assert!(sql.contains(r#"FROM "post" AS "posts""#), "{sql}");
        assert!(sql.contains(r#""posts"."user_id" = "user"."id""#), "{sql}");
    }

    #[test]
    fn test_intermediate_alias_collision_gets_suffix() {
        let registry = fixtures::registry();
        let rel = registry.find_relation("post", "tags").unwrap();
        let scope = AliasScope::root().with("postTags");
        let sql = render(compile(&registry, rel, "tag", BaseRef::Alias("post"), &scope).unwrap());
        assert!(sql.contains(r#"FROM "post_tag" AS "postTags2""#), "{sql}");
    }

    #[test]
    fn test_join_table_relation_compiles_exists() {
        let registry = fixtures::registry();
        let rel = registry.find_relation("post", "labels").unwrap();
        let sql = render(compile(&registry, rel, "labels", BaseRef::Alias("post"), &AliasScope::root()).unwrap());
        assert!(
            sql.contains(r#"(SELECT 1 FROM "post_label" WHERE "post_label"."tag_id" = "labels"."id" AND "post_label"."post_id" = "post"."id")"#),
            "{sql}"
        );
    }

    #[test]
    fn test_relation_scope_is_applied() {
        let registry = fixtures::entities()
            .register(
                "user",
                [RelationDef::has_many("posts", "post", "id", "userId")
                    .scope(|alias| Condition::all().add(column(alias, "title").eq("hello")))],
            )
            .unwrap()
            .build()
            .unwrap();
        let rel = registry.find_relation("user", "posts").unwrap();
        let sql = render(compile(&registry, rel, "posts", BaseRef::Alias("user"), &AliasScope::root()).unwrap());
        assert!(sql.contains(r#""posts"."title" = 'hello'"#), "{sql}");
    }

    #[test]
    fn test_alias_scope_unique() {
        let scope = AliasScope::root().with("user").with("user2");
        assert_eq!(scope.unique("profile"), "profile");
        assert_eq!(scope.unique("user"), "user3");
        assert_eq!(scope.depth(), 2);
        assert_eq!(scope.with("user").depth(), 2);
    }
}
