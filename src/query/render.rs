//! Rendering of query nodes into `sea_query` statements.
//!
//! Every node renders against an [`AliasScope`]: the aliases visible where the node is
//! placed. A node takes its explicit alias or the first free variant of its default alias,
//! and nested nodes are rendered in the scope extended by that alias, so a relation
//! selected inside a selection of the same relation gets a suffixed alias and correlates
//! with the alias immediately enclosing it.
//!
//! Shapes:
//!
//! ```text
//! to-one   LEFT JOIN LATERAL (<sub> LIMIT 1) "k" ON true              row_to_json("k".*) AS "k"
//! to-many  LEFT JOIN LATERAL (SELECT json_agg(row_to_json("t".*)) AS "r"
//!                             FROM (<sub>) AS "t") "k" ON true        COALESCE("k"."r", '[]') AS "k"
//! exists   LEFT JOIN LATERAL (SELECT true AS "r" ... LIMIT 1) "k"     COALESCE("k"."r", false) AS "k"
//! count    LEFT JOIN LATERAL (SELECT count(*) AS "r" ...) "k"         "k"."r" AS "k"
//! ```
//!
//! Column names in filters, ordering and `select_columns` may be qualified with the alias a
//! join was declared with (`posts.title`); they resolve against that join's entity.

use sea_query::{Condition, Expr, ExprTrait, JoinType, PostgresQueryBuilder, Query as SqlQuery, SelectStatement, Values};

use super::select::{Anchor, Filter, JoinKind, Query, Shape};
use crate::entity::{ColumnDef, EntityDef};
use crate::relation::condition::{column, from_aliased, ident, quote};
use crate::relation::{compile, AliasScope, BaseRef, RelationError};

/// A join of a rendered node.
pub(crate) struct Joined<'q> {
    /// Alias the join was declared with; the qualifier of its columns and the output key of
    /// a lateral join.
    pub(crate) name: &'q str,
    /// Alias it renders under, suffixed when `name` was already taken.
    pub(crate) alias: String,
    entity: &'q EntityDef,
    /// Lateral sub-selects expose logical column names.
    lateral: bool,
}

/// A node rendered up to its `WHERE` clause.
pub(crate) struct Core<'q> {
    pub(crate) select: SelectStatement,
    pub(crate) alias: String,
    /// Scope inside the node: the enclosing scope plus the node's own and joined aliases.
    pub(crate) scope: AliasScope,
    pub(crate) condition: Condition,
    /// Joins in join order, plain joins first.
    pub(crate) joined: Vec<Joined<'q>>,
}

fn and(condition: Condition, other: Condition) -> Condition {
    if other.is_empty() {
        condition
    } else {
        condition.add(other)
    }
}

impl Query {
    /// Parameterized PostgreSQL for this query.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for unresolvable relations, or a `ValidationError`
    /// for unknown columns and values that do not fit their column.
    pub fn build(&self) -> Result<(String, Values), RelationError> {
        let select = self.render_select(&AliasScope::root(), None)?;
        let built = select.build(PostgresQueryBuilder);
        log::debug!("compiled {}: {}", self.entity, built.0);
        Ok(built)
    }

    /// The statement with values inlined. For logging and tests; execution uses [`Query::build`].
    ///
    /// # Errors
    ///
    /// See [`Query::build`].
    pub fn to_sql(&self) -> Result<String, RelationError> {
        Ok(self.render_select(&AliasScope::root(), None)?.to_string(PostgresQueryBuilder))
    }

    pub(crate) fn pick_alias(&self, scope: &AliasScope) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => scope.unique(&self.default_alias),
        }
    }

    /// `FROM`, joins and the full `WHERE` condition.
    pub(crate) fn render_core(&self, scope: &AliasScope, parent: Option<&str>) -> Result<Core<'_>, RelationError> {
        let entity = self.entity_def()?;
        let alias = self.pick_alias(scope);
        let mut inner = scope.with(&alias);

        let mut select = SqlQuery::select();
        from_aliased(&mut select, &entity.table, &alias);

        let mut joined = Vec::new();
        for join in self.joins.iter().filter(|j| !j.lateral) {
            let target = join.query.entity_def()?;
            let join_alias = join.query.pick_alias(&inner);
            inner = inner.with(&join_alias);
            let on = join.query.render_condition(&join_alias, &inner, Some(&alias), &[])?;
            let join_type = match join.kind {
                JoinKind::Inner => JoinType::InnerJoin,
                JoinKind::Left => JoinType::LeftJoin,
            };
            select.join_as(join_type, ident(&target.table), ident(&join_alias), on);
            joined.push(Joined { name: join.query.alias_name(), alias: join_alias, entity: target, lateral: false });
        }

        for join in self.joins.iter().filter(|j| j.lateral) {
            let sub = join.query.render_select(&inner, Some(&alias))?;
            let join_alias = join.query.pick_alias(&inner);
            inner = inner.with(&join_alias);
            let join_type = match join.kind {
                JoinKind::Inner => JoinType::InnerJoin,
                JoinKind::Left => JoinType::LeftJoin,
            };
            select.join_lateral(join_type, sub, ident(&join_alias), Condition::all().add(Expr::cust("true")));
            joined.push(Joined {
                name: join.query.alias_name(),
                alias: join_alias,
                entity: join.query.entity_def()?,
                lateral: true,
            });
        }

        let condition = self.render_condition(&alias, &inner, parent, &joined)?;
        Ok(Core { select, alias, scope: inner, condition, joined })
    }

    /// Column `name` of this node rendered under `alias` or, written `join.column`, of one of
    /// `joined`.
    fn resolve_column<'q>(
        &'q self,
        name: &str,
        alias: &str,
        joined: &[Joined<'q>],
    ) -> Result<(Expr, &'q ColumnDef), RelationError> {
        let own = match self.own_column(name) {
            Some(own) => own,
            None => {
                let (qualifier, col) = name.split_once('.').unwrap_or(("", name));
                let join = joined.iter().find(|j| j.name == qualifier).ok_or_else(|| {
                    RelationError::Validation(format!("Unknown join `{qualifier}` in a query on `{}`", self.entity))
                })?;
                let def = join.entity.column_def(col)?;
                let name = if join.lateral { &def.name } else { &def.storage };
                return Ok((column(&join.alias, name), def));
            }
        };
        let def = self.entity_def()?.column_def(own)?;
        Ok((column(alias, &def.storage), def))
    }

    /// Anchor and filters of this node rendered under `alias`.
    pub(crate) fn render_condition(
        &self,
        alias: &str,
        scope: &AliasScope,
        parent: Option<&str>,
        joined: &[Joined<'_>],
    ) -> Result<Condition, RelationError> {
        let registry = self.registry.as_ref();
        let mut condition = Condition::all();

        match &self.anchor {
            Anchor::None => {}
            Anchor::Parent { owner, relation } => {
                let parent = parent.ok_or_else(|| {
                    RelationError::Validation(format!(
                        "Relation query `{relation}` of `{owner}` must be nested in a query on `{owner}`"
                    ))
                })?;
                let rel = registry.find_relation(owner, relation)?;
                condition = and(condition, compile(registry, rel, alias, BaseRef::Alias(parent), scope)?);
            }
            Anchor::Correlated { owner, relation, base_alias } => {
                let rel = registry.find_relation(owner, relation)?;
                condition = and(condition, compile(registry, rel, alias, BaseRef::Alias(base_alias), scope)?);
            }
            Anchor::Record { owner, relation, record } => {
                let rel = registry.find_relation(owner, relation)?;
                condition = and(condition, compile(registry, rel, alias, BaseRef::Record(record), scope)?);
            }
            Anchor::Chain { base, relation } => {
                let mut core = base.render_core(scope, None)?;
                let rel = registry.find_relation(&base.entity, relation)?;
                let join = compile(registry, rel, alias, BaseRef::Alias(&core.alias), &core.scope)?;
                core.select.expr(Expr::cust("1"));
                core.select.cond_where(and(core.condition, join));
                condition = condition.add(Expr::exists(core.select));
            }
        }

        for filter in &self.filters {
            let rendered = match filter {
                Filter::Eq(name, value) => {
                    let (col, def) = self.resolve_column(name, alias, joined)?;
                    if value.is_null() {
                        Condition::all().add(col.is_null())
                    } else {
                        Condition::all().add(col.eq(def.bind(value)?))
                    }
                }
                Filter::In(name, values) => {
                    let (col, def) = self.resolve_column(name, alias, joined)?;
                    if values.is_empty() {
                        Condition::all().add(Expr::cust("false"))
                    } else {
                        let bound = values.iter().map(|v| def.bind(v)).collect::<Result<Vec<_>, _>>()?;
                        Condition::all().add(col.is_in(bound))
                    }
                }
                Filter::IsNull(name) => Condition::all().add(self.resolve_column(name, alias, joined)?.0.is_null()),
                Filter::Custom(filter) => filter(alias),
                Filter::Exists { query, negate } => {
                    let core = query.render_core(scope, Some(alias))?;
                    let mut select = core.select;
                    select.expr(Expr::cust("1"));
                    if !core.condition.is_empty() {
                        select.cond_where(core.condition);
                    }
                    let exists = Expr::exists(select);
                    Condition::all().add(if *negate { exists.not() } else { exists })
                }
                Filter::Count { query, op, value } => {
                    // An aggregate without GROUP BY yields one row, so zero matches compare as 0.
                    let core = query.render_core(scope, Some(alias))?;
                    let mut select = core.select;
                    select.expr(Expr::cust("1"));
                    if !core.condition.is_empty() {
                        select.cond_where(core.condition);
                    }
                    select.cond_having(Condition::all().add(Expr::cust(format!("count(*) {} {value}", op.as_sql()))));
                    Condition::all().add(Expr::exists(select))
                }
            };
            condition = and(condition, rendered);
        }

        Ok(condition)
    }

    /// The complete `SELECT` of this node in `scope`, correlated with `parent` when nested.
    pub(crate) fn render_select(&self, scope: &AliasScope, parent: Option<&str>) -> Result<SelectStatement, RelationError> {
        let Core { mut select, alias, scope: mut inner, condition, joined } = self.render_core(scope, parent)?;
        let entity = self.entity_def()?;

        match self.shape {
            Shape::Exists => {
                select.expr_as(Expr::cust("true"), ident("r"));
                select.limit(1);
            }
            Shape::Count => {
                select.expr_as(Expr::cust("count(*)"), ident("r"));
            }
            Shape::Rows => {
                match &self.columns {
                    Some(names) => {
                        for name in names {
                            let (col, def) = self.resolve_column(name, &alias, &joined)?;
                            select.expr_as(col, ident(&def.name));
                        }
                    }
                    None => {
                        for col in &entity.columns {
                            select.expr_as(column(&alias, &col.storage), ident(&col.name));
                        }
                    }
                }

                for join in joined.iter().filter(|j| j.lateral) {
                    select.expr_as(Expr::cust(format!("row_to_json({}.*)", quote(&join.alias))), ident(join.name));
                }

                for selection in &self.selections {
                    let sub = selection.query.render_selection(&inner, &alias)?;
                    let lateral = inner.unique(&selection.key);
                    inner = inner.with(&lateral);
                    select.join_lateral(
                        JoinType::LeftJoin,
                        sub,
                        ident(&lateral),
                        Condition::all().add(Expr::cust("true")),
                    );
                    select.expr_as(selection.query.selection_output(&lateral), ident(&selection.key));
                }

                for (name, order) in &self.order {
                    let (col, _) = self.resolve_column(name, &alias, &joined)?;
                    select.order_by_expr(col, order.clone());
                }
                let single = self.to_one && matches!(self.anchor, Anchor::Record { .. });
                if let Some(limit) = if single { Some(1) } else { self.limit } {
                    select.limit(limit);
                }
            }
        }

        if !condition.is_empty() {
            select.cond_where(condition);
        }
        Ok(select)
    }

    /// The lateral sub-select of a relation selection.
    fn render_selection(&self, scope: &AliasScope, parent: &str) -> Result<SelectStatement, RelationError> {
        let mut sub = self.render_select(scope, Some(parent))?;
        if self.shape != Shape::Rows {
            return Ok(sub);
        }
        if self.to_one {
            sub.limit(1);
            return Ok(sub);
        }

        let mut aggregate = SqlQuery::select();
        aggregate
            .expr_as(Expr::cust(r#"json_agg(row_to_json("t".*))"#), ident("r"))
            .from_subquery(sub, ident("t"));
        Ok(aggregate)
    }

    /// Output expression of a relation selection joined under `lateral`.
    fn selection_output(&self, lateral: &str) -> Expr {
        let lateral = quote(lateral);
        match self.shape {
            Shape::Exists => Expr::cust(format!("COALESCE({lateral}.\"r\", false)")),
            Shape::Count => Expr::cust(format!("{lateral}.\"r\"")),
            Shape::Rows if self.to_one => Expr::cust(format!("row_to_json({lateral}.*)")),
            Shape::Rows => Expr::cust(format!("COALESCE({lateral}.\"r\", '[]')")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fixtures;
    use crate::query::CountOp;
    use sea_query::Order;
    use serde_json::json;

    fn users() -> Query {
        Query::new(&fixtures::registry(), "user").unwrap()
    }

    #[test]
    fn test_plain_select_uses_logical_names() {
        let sql = Query::new(&fixtures::registry(), "profile")
            .unwrap()
            .where_eq("userId", json!(5))
            .to_sql()
            .unwrap();
        assert_eq!(
            sql,
            r#"SELECT "profile"."id" AS "id", "profile"."user_id" AS "userId", "profile"."bio" AS "bio" FROM "profile" WHERE "profile"."user_id" = 5"#
        );
    }

    #[test]
    fn test_build_binds_parameters() {
        let (sql, values) = users().find([json!(5)]).unwrap().build().unwrap();
        assert!(sql.ends_with(r#"WHERE "user"."id" = $1"#), "{sql}");
        assert_eq!(values.0.len(), 1);
    }

    #[test]
    fn test_query_related_constant_folds_record() {
        let record = json!({"id": 5, "name": "ann"}).as_object().cloned().unwrap();
        let sql = users().query_related("profile", &record).unwrap().to_sql().unwrap();
        assert!(sql.contains(r#"FROM "profile" WHERE "profile"."user_id" = 5"#), "{sql}");
    }

    #[test]
    fn test_chain_wraps_base_in_exists() {
        let sql = users()
            .where_eq("id", json!(5))
            .chain("profile")
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(sql.contains(r#"FROM "profile" WHERE EXISTS"#), "{sql}");
        assert!(
            sql.contains(r#"(SELECT 1 FROM "user" WHERE "user"."id" = 5 AND "profile"."user_id" = "user"."id")"#),
            "{sql}"
        );
    }

    #[test]
    fn test_chain_of_chain_nests() {
        let sql = users()
            .where_eq("id", json!(1))
            .chain("posts")
            .unwrap()
            .chain("postTags")
            .unwrap()
            .to_sql()
            .unwrap();
        assert_eq!(sql.matches("EXISTS").count(), 2, "{sql}");
        assert!(sql.contains(r#""post_tag"."post_id" = "post"."id""#), "{sql}");
        assert!(sql.contains(r#""post"."user_id" = "user"."id""#), "{sql}");
    }

    #[test]
    fn test_where_exists_with_scope() {
        let sql = users()
            .where_exists("posts", |p| p.where_eq("title", json!("hi")))
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(
            sql.contains(r#"(SELECT 1 FROM "post" AS "posts" WHERE "posts"."user_id" = "user"."id" AND "posts"."title" = 'hi')"#),
            "{sql}"
        );

        let negated = users().where_not_exists("posts", |p| p).unwrap().to_sql().unwrap();
        assert!(negated.contains("WHERE NOT"), "{negated}");
    }

    #[test]
    fn test_where_count_uses_having() {
        let sql = users()
            .where_count("posts", |p| p, CountOp::Gte, 2)
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(sql.contains("HAVING count(*) >= 2"), "{sql}");
    }

    #[test]
    fn test_join_and_left_join() {
        let sql = users()
            .join("posts", |p| p.where_eq("title", json!("x")))
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(
            sql.contains(r#"INNER JOIN "post" AS "posts" ON "posts"."user_id" = "user"."id" AND "posts"."title" = 'x'"#),
            "{sql}"
        );

        let left = users().left_join("profile", |p| p.as_alias("p")).unwrap().to_sql().unwrap();
        assert!(left.contains(r#"LEFT JOIN "profile" AS "p" ON "p"."user_id" = "user"."id""#), "{left}");
    }

    #[test]
    fn test_join_lateral_keeps_own_order_and_limit() {
        let sql = users()
            .join_lateral("posts", |p| p.order_by("id", Order::Desc).limit(1))
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(sql.contains("JOIN LATERAL"), "{sql}");
        assert!(sql.contains(r#"ORDER BY "posts"."id" DESC LIMIT 1"#), "{sql}");
        assert!(sql.contains(r#"row_to_json("posts".*) AS "posts""#), "{sql}");
    }

    #[test]
    fn test_select_to_one_and_to_many() {
        let sql = users()
            .select_relation("profile", "profile")
            .unwrap()
            .select_relation("posts", "posts")
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(sql.contains(r#"row_to_json("profile".*) AS "profile""#), "{sql}");
        assert!(sql.contains(r#"COALESCE("posts"."r", '[]') AS "posts""#), "{sql}");
        assert!(sql.contains(r#"json_agg(row_to_json("t".*))"#), "{sql}");
        assert!(sql.contains(r#"LEFT JOIN LATERAL"#), "{sql}");
        assert!(sql.contains("LIMIT 1"), "{sql}");
    }

    #[test]
    fn test_select_exists_and_count_shapes() {
        let sql = users()
            .select_with("hasPosts", |q| Ok(q.related("posts")?.exists()))
            .unwrap()
            .select_with("postCount", |q| Ok(q.related("posts")?.count()))
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(sql.contains(r#"COALESCE("hasPosts"."r", false) AS "hasPosts""#), "{sql}");
        assert!(sql.contains(r#""postCount"."r" AS "postCount""#), "{sql}");
        assert!(sql.contains(r#"SELECT count(*) AS "r""#), "{sql}");
    }

    #[test]
    fn test_recursive_selection_reroots_to_enclosing_alias() {
        let sql = users()
            .select_with("posts", |q| {
                q.related("posts")?.select_with("user", |p| {
                    p.related("user")?.select_relation("posts", "posts")
                })
            })
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(sql.contains(r#""posts"."user_id" = "user"."id""#), "{sql}");
        assert!(sql.contains(r#"FROM "user" AS "user2""#), "{sql}");
        assert!(sql.contains(r#"WHERE "user2"."id" = "posts"."user_id""#), "{sql}");
        assert!(sql.contains(r#"FROM "post" AS "posts2" WHERE "posts2"."user_id" = "user2"."id""#), "{sql}");
    }

    #[test]
    fn test_through_selection_compiles_nested_exists() {
        let sql = Query::new(&fixtures::registry(), "post")
            .unwrap()
            .select_relation("tags", "tags")
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(sql.contains(r#"FROM "tag" AS "tags" WHERE EXISTS"#), "{sql}");
        assert!(sql.contains(r#""postTags"."post_id" = "post"."id""#), "{sql}");
    }

    #[test]
    fn test_join_query_introspection() {
        let registry = fixtures::registry();
        let rel = registry.find_relation("user", "profile").unwrap();
        let base = Query::new(&registry, "user").unwrap().as_alias("u");
        let related = Query::new(&registry, "profile").unwrap();
        let sql = rel.join_query(&related, &base).unwrap().to_sql().unwrap();
        assert!(sql.ends_with(r#"WHERE "profile"."user_id" = "u"."id""#), "{sql}");

        assert!(rel.join_query(&base, &related).is_err());
    }

    #[test]
    fn test_related_outside_parent_fails() {
        let err = users().related("posts").unwrap().build().unwrap_err();
        assert!(matches!(err, RelationError::Validation(_)));
    }

    #[test]
    fn test_unknown_column_is_a_validation_error() {
        let err = users().where_eq("age", json!(3)).build().unwrap_err();
        assert_eq!(err.to_string(), "Validation error: Unknown column `age` on `user`");
    }

    #[test]
    fn test_joined_columns_resolve_against_join() {
        let sql = users()
            .join("posts", |p| p)
            .unwrap()
            .select_columns(["id", "posts.title"])
            .where_eq("posts.title", json!("x"))
            .order_by("posts.id", Order::Asc)
            .to_sql()
            .unwrap();
        assert!(sql.starts_with(r#"SELECT "user"."id" AS "id", "posts"."title" AS "title" FROM "user""#), "{sql}");
        assert!(sql.contains(r#"WHERE "posts"."title" = 'x'"#), "{sql}");
        assert!(sql.ends_with(r#"ORDER BY "posts"."id" ASC"#), "{sql}");
    }

    #[test]
    fn test_unknown_join_qualifier_is_a_validation_error() {
        let err = users().where_eq("comments.body", json!("x")).build().unwrap_err();
        assert_eq!(err.to_string(), "Validation error: Unknown join `comments` in a query on `user`");
    }

    #[test]
    fn test_lateral_output_key_is_declared_alias() {
        let sql = users()
            .as_alias("posts")
            .join_lateral("posts", |p| p.limit(1))
            .unwrap()
            .to_sql()
            .unwrap();
        assert!(sql.contains(r#"row_to_json("posts2".*) AS "posts""#), "{sql}");
    }

    #[test]
    fn test_where_in_and_empty_in() {
        let sql = users().where_in("id", vec![json!(1), json!(2)]).to_sql().unwrap();
        assert!(sql.contains(r#""user"."id" IN (1, 2)"#), "{sql}");
        let none = users().where_in("id", vec![]).to_sql().unwrap();
        assert!(none.ends_with("WHERE false"), "{none}");
    }
}
