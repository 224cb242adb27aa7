//! Write statements issued by the cascade.
//!
//! Rows are passed around with logical column names. Statements translate them to storage
//! names, bind each value by its column type, and map `RETURNING *` rows back. `UPDATE` and
//! `DELETE` cannot alias their table, so conditions passed here are built against the bare
//! table name.

use sea_query::{Condition, Expr, ExprTrait, PostgresQueryBuilder, Query as SqlQuery, SelectStatement, Values};

use crate::entity::{ColumnDef, ColumnType, EntityDef};
use crate::executor::{LifeExecutor, Record};
use crate::query::Query;
use crate::relation::condition::{column, ident, record_condition};
use crate::relation::{AliasScope, HookEvent, Hooks, JoinTableKeys, RelationError};

fn run(executor: &dyn LifeExecutor, entity: &EntityDef, sql: &str, values: &Values) -> Result<Vec<Record>, RelationError> {
    log::debug!("cascade statement on {}: {sql}", entity.name);
    let rows = executor.query_all(sql, values)?;
    Ok(rows.into_iter().map(|row| entity.from_storage(row)).collect())
}

fn statement_error(err: impl std::fmt::Display) -> RelationError {
    RelationError::Validation(format!("Invalid statement: {err}"))
}

/// Condition selecting the rows `query` matches, written against the bare table name.
///
/// Queries with joins or a limit are turned into a key lookup on a sub-select.
pub(crate) fn target_condition(query: &Query) -> Result<Condition, RelationError> {
    let entity = query.entity_def()?;
    let table = entity.table.as_str();

    if query.joins.is_empty() && query.limit.is_none() {
        let mut plain = query.clone();
        plain.alias = Some(table.to_string());
        let scope = AliasScope::root().with(table);
        return plain.render_condition(table, &scope, None, &[]);
    }

    let keys: Vec<_> = entity.primary_key().collect();
    if keys.is_empty() {
        return Err(RelationError::Validation(format!(
            "`{}` has no primary key to narrow a joined or limited query",
            entity.name
        )));
    }
    let core = query.render_core(&AliasScope::root(), None)?;
    let mut select = core.select;
    for key in &keys {
        select.expr(column(&core.alias, &key.storage));
    }
    if !core.condition.is_empty() {
        select.cond_where(core.condition);
    }
    if let Some(limit) = query.limit {
        select.limit(limit);
    }
    let tuple = Expr::tuple(keys.iter().map(|k| column(table, &k.storage)));
    Ok(Condition::all().add(tuple.in_subquery(select)))
}

/// Rows of `entity` matching any of `lookups`; `None` when there are no lookups.
pub(crate) fn lookups_condition(entity: &EntityDef, lookups: &[Record]) -> Result<Option<Condition>, RelationError> {
    if lookups.is_empty() {
        return Ok(None);
    }
    let mut any = Condition::any();
    for lookup in lookups {
        if lookup.is_empty() {
            return Err(RelationError::Validation(format!("Empty lookup on `{}`", entity.name)));
        }
        any = any.add(record_condition(entity, &entity.table, lookup)?);
    }
    Ok(Some(any))
}

/// Whether `row` of `entity` has every field of `lookup` with the same value, compared the
/// way the column type compares in the database.
pub(crate) fn matches_lookup(entity: &EntityDef, row: &Record, lookup: &Record) -> bool {
    lookup.iter().all(|(key, value)| match (row.get(key), entity.find_column(key)) {
        (Some(found), Some(def)) => def.same_value(found, value),
        (found, None) => found == Some(value),
        (None, Some(_)) => false,
    })
}

pub(crate) fn select(
    executor: &dyn LifeExecutor,
    entity: &EntityDef,
    condition: Condition,
) -> Result<Vec<Record>, RelationError> {
    let mut stmt = SqlQuery::select();
    stmt.from(ident(&entity.table));
    for col in &entity.columns {
        stmt.expr_as(column(&entity.table, &col.storage), ident(&col.name));
    }
    if !condition.is_empty() {
        stmt.cond_where(condition);
    }
    let (sql, values) = stmt.build(PostgresQueryBuilder);
    log::debug!("cascade lookup on {}: {sql}", entity.name);
    Ok(executor.query_all(&sql, &values)?)
}

/// `INSERT ... RETURNING *` of `rows` in one statement. Columns missing from a row get
/// their default.
pub(crate) fn insert(executor: &dyn LifeExecutor, entity: &EntityDef, rows: &[Record]) -> Result<Vec<Record>, RelationError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    for row in rows {
        for name in row.keys() {
            entity.column_def(name)?;
        }
    }

    let mut columns: Vec<_> = entity
        .columns
        .iter()
        .filter(|c| rows.iter().any(|r| r.contains_key(&c.name)))
        .collect();
    if columns.is_empty() {
        if let Some(first) = entity.columns.first() {
            columns.push(first);
        }
    }

    let mut stmt = SqlQuery::insert();
    stmt.into_table(ident(&entity.table))
        .columns(columns.iter().map(|c| ident(&c.storage)));
    for row in rows {
        let exprs = columns
            .iter()
            .map(|c| match row.get(&c.name) {
                Some(value) => c.bind(value),
                None => Ok(Expr::cust("DEFAULT")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        stmt.values(exprs).map_err(statement_error)?;
    }
    stmt.returning_all();

    let (sql, values) = stmt.build(PostgresQueryBuilder);
    run(executor, entity, &sql, &values)
}

/// `INSERT INTO entity (columns) <select> RETURNING *`. `columns` are storage names.
pub(crate) fn insert_select(
    executor: &dyn LifeExecutor,
    entity: &EntityDef,
    columns: &[String],
    select: SelectStatement,
) -> Result<Vec<Record>, RelationError> {
    let mut stmt = SqlQuery::insert();
    stmt.into_table(ident(&entity.table))
        .columns(columns.iter().map(|c| ident(c)));
    stmt.select_from(select).map_err(statement_error)?;
    stmt.returning_all();
    let (sql, values) = stmt.build(PostgresQueryBuilder);
    run(executor, entity, &sql, &values)
}

/// A bound value carrying an explicit cast, for select lists where PostgreSQL cannot infer
/// the parameter type from a target column.
pub(crate) fn typed_value(def: &ColumnDef, value: &serde_json::Value) -> Result<Expr, RelationError> {
    let bound = def.bind(value)?;
    Ok(match def.column_type {
        // already cast by `bind`
        ColumnType::Custom(_) => bound,
        _ => bound.cast_as(ident(def.column_type.sql_type())),
    })
}

/// `UPDATE ... SET <sets> WHERE condition RETURNING *`. `sets` pairs storage columns with
/// bound expressions.
pub(crate) fn update_exprs(
    executor: &dyn LifeExecutor,
    entity: &EntityDef,
    sets: Vec<(String, Expr)>,
    condition: Condition,
) -> Result<Vec<Record>, RelationError> {
    let mut stmt = SqlQuery::update();
    stmt.table(ident(&entity.table));
    for (storage, expr) in sets {
        stmt.value(ident(&storage), expr);
    }
    if !condition.is_empty() {
        stmt.cond_where(condition);
    }
    stmt.returning_all();
    let (sql, values) = stmt.build(PostgresQueryBuilder);
    run(executor, entity, &sql, &values)
}

/// Bind a logical-name patch as `SET` pairs.
pub(crate) fn patch_sets(entity: &EntityDef, patch: &Record) -> Result<Vec<(String, Expr)>, RelationError> {
    patch
        .iter()
        .map(|(name, value)| {
            let def = entity.column_def(name)?;
            Ok((def.storage.clone(), def.bind(value)?))
        })
        .collect()
}

pub(crate) fn delete(executor: &dyn LifeExecutor, entity: &EntityDef, condition: Condition) -> Result<Vec<Record>, RelationError> {
    let mut stmt = SqlQuery::delete();
    stmt.from_table(ident(&entity.table));
    if !condition.is_empty() {
        stmt.cond_where(condition);
    }
    stmt.returning_all();
    let (sql, values) = stmt.build(PostgresQueryBuilder);
    run(executor, entity, &sql, &values)
}

/// Insert one join-table row per `(owner row, target row)` pair.
pub(crate) fn insert_links(
    executor: &dyn LifeExecutor,
    keys: &JoinTableKeys,
    owner: &EntityDef,
    target: &EntityDef,
    pairs: &[(&Record, &Record)],
) -> Result<u64, RelationError> {
    if pairs.is_empty() {
        return Ok(0);
    }
    let mut stmt = SqlQuery::insert();
    stmt.into_table(ident(&keys.table))
        .columns(keys.join_local.iter().chain(keys.join_foreign.iter()).map(ident));

    for (owner_row, target_row) in pairs {
        let mut exprs = Vec::new();
        for local in keys.local.iter() {
            exprs.push(owner.column_def(local)?.bind(key_value(owner_row, local, &owner.name)?)?);
        }
        for foreign in keys.foreign.iter() {
            exprs.push(target.column_def(foreign)?.bind(key_value(target_row, foreign, &target.name)?)?);
        }
        stmt.values(exprs).map_err(statement_error)?;
    }

    let (sql, values) = stmt.build(PostgresQueryBuilder);
    log::debug!("cascade link insert on {}: {sql}", keys.table);
    Ok(executor.execute(&sql, &values)?)
}

/// Delete join-table rows of any of `owners`, restricted to links to `targets` when given.
pub(crate) fn delete_links(
    executor: &dyn LifeExecutor,
    keys: &JoinTableKeys,
    owner: &EntityDef,
    target: &EntityDef,
    owners: &[Record],
    targets: Option<&[Record]>,
) -> Result<u64, RelationError> {
    let mut condition = Condition::all().add(links_of(keys, owner, &keys.local, &keys.join_local, owners)?);
    if let Some(targets) = targets {
        condition = condition.add(links_of(keys, target, &keys.foreign, &keys.join_foreign, targets)?);
    }

    let mut stmt = SqlQuery::delete();
    stmt.from_table(ident(&keys.table)).cond_where(condition);
    let (sql, values) = stmt.build(PostgresQueryBuilder);
    log::debug!("cascade link delete on {}: {sql}", keys.table);
    Ok(executor.execute(&sql, &values)?)
}

fn links_of(
    keys: &JoinTableKeys,
    entity: &EntityDef,
    columns: &crate::relation::Identity,
    join_columns: &crate::relation::Identity,
    rows: &[Record],
) -> Result<Condition, RelationError> {
    let mut any = Condition::any();
    for row in rows {
        let mut all = Condition::all();
        for (col, join_col) in columns.zip(join_columns) {
            let value = entity.column_def(col)?.bind(key_value(row, col, &entity.name)?)?;
            all = all.add(column(&keys.table, join_col).eq(value));
        }
        any = any.add(all);
    }
    if rows.is_empty() {
        any = any.add(Expr::cust("false"));
    }
    Ok(any)
}

pub(crate) fn key_value<'r>(row: &'r Record, column: &str, entity: &str) -> Result<&'r serde_json::Value, RelationError> {
    row.get(column).ok_or_else(|| {
        RelationError::Validation(format!("Record of `{entity}` is missing key column `{column}`"))
    })
}

/// Insert with before/after create hooks.
pub(crate) fn hooked_insert(
    executor: &dyn LifeExecutor,
    hooks: Option<&Hooks>,
    entity: &EntityDef,
    rows: &[Record],
) -> Result<Vec<Record>, RelationError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(hooks) = hooks {
        hooks.fire(HookEvent::BeforeCreate, rows, executor)?;
    }
    let inserted = insert(executor, entity, rows)?;
    if let Some(hooks) = hooks {
        hooks.fire(HookEvent::AfterCreate, &inserted, executor)?;
    }
    Ok(inserted)
}

/// Update with before/after update hooks. Before hooks need the matched rows, so they are
/// selected first when such a hook is registered; the update is skipped when none match.
pub(crate) fn hooked_update(
    executor: &dyn LifeExecutor,
    hooks: Option<&Hooks>,
    entity: &EntityDef,
    sets: Vec<(String, Expr)>,
    condition: Condition,
) -> Result<Vec<Record>, RelationError> {
    if let Some(hooks) = hooks.filter(|h| h.has(HookEvent::BeforeUpdate)) {
        let matched = select(executor, entity, condition.clone())?;
        if matched.is_empty() {
            return Ok(Vec::new());
        }
        hooks.fire(HookEvent::BeforeUpdate, &matched, executor)?;
    }
    let updated = update_exprs(executor, entity, sets, condition)?;
    if let Some(hooks) = hooks.filter(|_| !updated.is_empty()) {
        hooks.fire(HookEvent::AfterUpdate, &updated, executor)?;
    }
    Ok(updated)
}

/// Delete with before/after delete hooks, selecting the matched rows first when a before
/// hook is registered.
pub(crate) fn hooked_delete(
    executor: &dyn LifeExecutor,
    hooks: Option<&Hooks>,
    entity: &EntityDef,
    condition: Condition,
) -> Result<Vec<Record>, RelationError> {
    if let Some(hooks) = hooks.filter(|h| h.has(HookEvent::BeforeDelete)) {
        let matched = select(executor, entity, condition.clone())?;
        if matched.is_empty() {
            return Ok(Vec::new());
        }
        hooks.fire(HookEvent::BeforeDelete, &matched, executor)?;
    }
    let deleted = delete(executor, entity, condition)?;
    if let Some(hooks) = hooks.filter(|_| !deleted.is_empty()) {
        hooks.fire(HookEvent::AfterDelete, &deleted, executor)?;
    }
    Ok(deleted)
}
