//! Execution of nested create and update payloads.
//!
//! A cascade runs on the executor of an open transaction. Work is batched per relation:
//! the nested creates of one relation across all rows of a `create_many` become a single
//! `INSERT`, connects a single `UPDATE`, and lookups a single `SELECT`, so relation hooks
//! fire once per statement with every affected row.

use sea_query::{CaseStatement, Condition, Expr};
use serde_json::Value as Json;

use super::statements::{
    self, delete_links, hooked_delete, hooked_insert, hooked_update, insert_links, key_value, lookups_condition,
    matches_lookup, patch_sets,
};
use super::{ConnectOrCreate, CreateData, NestedMutation, UpdateData};
use crate::entity::EntityDef;
use crate::executor::{LifeExecutor, Record};
use crate::query::select::Anchor;
use crate::query::Query;
use crate::relation::condition::{column, keys_condition, record_condition};
use crate::relation::{
    compile, AliasScope, BaseRef, DirectKeys, HookEvent, Hooks, JoinTableKeys, Registry, RelationDef, RelationError,
    RelationKind,
};

/// Where rows created through a query take their anchoring foreign key from.
pub(crate) enum CreatePlan {
    Plain,
    /// Key values copied from a fetched owner record.
    Keys { owner: String, relation: String, keys: Record },
    /// Key values read by the insert itself from the single row of a base query. An
    /// `optional` chain inserts nothing when the base matches no row.
    Chain { base: Query, relation: String, optional: bool },
}

fn child_keys(relation: &RelationDef) -> Result<&DirectKeys, RelationError> {
    match &relation.kind {
        RelationKind::HasOne(keys) | RelationKind::HasMany(keys) => Ok(keys),
        other => Err(RelationError::Validation(format!(
            "Cannot create records through the {} relation `{}` of `{}`",
            other.label(),
            relation.name,
            relation.owner
        ))),
    }
}

fn unsupported(option: &str, relation: &RelationDef) -> RelationError {
    RelationError::Validation(format!(
        "`{option}` option is not supported by the `{}` relation of `{}`",
        relation.name, relation.owner
    ))
}

/// Decide how `query` anchors the rows it creates.
pub(crate) fn plan_create(query: &Query) -> Result<CreatePlan, RelationError> {
    let registry = query.registry.as_ref();
    match &query.anchor {
        Anchor::None => Ok(CreatePlan::Plain),
        Anchor::Record { owner, relation, record } => {
            let keys = child_keys(registry.find_relation(owner, relation)?)?;
            let mut values = Record::new();
            for (local, foreign) in keys.local.zip(&keys.foreign) {
                values.insert(foreign.to_string(), key_value(record, local, owner)?.clone());
            }
            Ok(CreatePlan::Keys { owner: owner.clone(), relation: relation.clone(), keys: values })
        }
        Anchor::Chain { base, relation } => {
            child_keys(registry.find_relation(&base.entity, relation)?)?;
            if !base.is_single_row() {
                return Err(RelationError::AmbiguousRecord(
                    "Cannot create based on a query which returns multiple records".to_string(),
                ));
            }
            Ok(CreatePlan::Chain {
                base: (**base).clone(),
                relation: relation.clone(),
                optional: query.optional || base.optional,
            })
        }
        Anchor::Parent { owner, relation } | Anchor::Correlated { owner, relation, .. } => {
            Err(RelationError::Validation(format!(
                "Cannot create on the nested `{relation}` relation query of `{owner}`"
            )))
        }
    }
}

/// A row waiting for insertion and the child mutations to run once it exists.
struct Pending {
    values: Record,
    children: Vec<(String, NestedMutation)>,
}

/// Request for the one row on the other side of a to-one relation.
enum Single {
    Create(CreateData),
    Connect(Record),
    ConnectOrCreate(ConnectOrCreate),
}

/// Rows to attach to owners, keyed by the index of the owner.
#[derive(Default)]
struct Attach {
    creates: Vec<(usize, CreateData)>,
    connects: Vec<(usize, Record)>,
}

fn group<T>(groups: &mut Vec<(String, Vec<T>)>, name: String, item: T) {
    match groups.iter_mut().find(|(n, _)| *n == name) {
        Some((_, items)) => items.push(item),
        None => groups.push((name, vec![item])),
    }
}

/// `to[i] = from[j]` for each paired key column.
fn copy_keys(
    to: &mut Record,
    to_columns: &crate::relation::Identity,
    from: &Record,
    from_columns: &crate::relation::Identity,
    from_entity: &str,
) -> Result<(), RelationError> {
    for (to_col, from_col) in to_columns.zip(from_columns) {
        to.insert(to_col.to_string(), key_value(from, from_col, from_entity)?.clone());
    }
    Ok(())
}

fn with_lookups(target: &EntityDef, condition: Condition, lookups: &[Record]) -> Result<Condition, RelationError> {
    Ok(match lookups_condition(target, lookups)? {
        Some(lookups) => Condition::all().add(condition).add(lookups),
        None => condition,
    })
}

/// Parents referenced by the foreign keys of `rows`, `None` when no row references one.
fn parents_of(target: &EntityDef, keys: &DirectKeys, rows: &[Record]) -> Result<Option<Condition>, RelationError> {
    let linked: Vec<Record> = rows
        .iter()
        .filter(|row| keys.local.iter().all(|c| row.get(c).is_some_and(|v| !v.is_null())))
        .cloned()
        .collect();
    if linked.is_empty() {
        return Ok(None);
    }
    Ok(Some(keys_condition(target, &target.table, &keys.foreign, &keys.local, &linked)?))
}

pub(crate) struct Cascade<'a> {
    registry: &'a Registry,
    exec: &'a dyn LifeExecutor,
}

impl<'a> Cascade<'a> {
    pub(crate) fn new(registry: &'a Registry, exec: &'a dyn LifeExecutor) -> Self {
        Self { registry, exec }
    }

    pub(crate) fn create_planned(
        &self,
        query: &Query,
        plan: &CreatePlan,
        data: Vec<CreateData>,
    ) -> Result<Vec<Record>, RelationError> {
        let entity = query.entity_def()?;
        match plan {
            CreatePlan::Plain => self.create(entity, None, data),
            CreatePlan::Keys { owner, relation, keys } => {
                let rel = self.registry.find_relation(owner, relation)?;
                let data = data
                    .into_iter()
                    .map(|mut row| {
                        row.values.extend(keys.clone());
                        row
                    })
                    .collect();
                self.create(entity, Some(&rel.hooks), data)
            }
            CreatePlan::Chain { base, relation, optional } => {
                let rel = self.registry.find_relation(&base.entity, relation)?;
                let mut created = Vec::with_capacity(data.len());
                for pending in self.resolve_parents(entity, data)? {
                    let Some(row) = self.insert_from_base(entity, rel, base, &pending.values)? else {
                        if *optional {
                            log::debug!("no `{}` row to create `{relation}` on", base.entity);
                            continue;
                        }
                        return Err(RelationError::not_found());
                    };
                    self.create_children(entity, std::slice::from_ref(&row), vec![pending.children])?;
                    created.push(row);
                }
                Ok(created)
            }
        }
    }

    /// Insert `data` into `entity` with everything nested in it.
    fn create(&self, entity: &EntityDef, hooks: Option<&Hooks>, data: Vec<CreateData>) -> Result<Vec<Record>, RelationError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let (values, children): (Vec<_>, Vec<_>) = self
            .resolve_parents(entity, data)?
            .into_iter()
            .map(|p| (p.values, p.children))
            .unzip();
        let rows = hooked_insert(self.exec, hooks, entity, &values)?;
        self.create_children(entity, &rows, children)?;
        Ok(rows)
    }

    /// `INSERT INTO entity (fk, columns) SELECT base.key, values FROM base ... LIMIT 1`.
    /// `None` when the base matches no row.
    fn insert_from_base(
        &self,
        entity: &EntityDef,
        relation: &RelationDef,
        base: &Query,
        values: &Record,
    ) -> Result<Option<Record>, RelationError> {
        let keys = child_keys(relation)?;
        let owner = self.registry.entity(&relation.owner)?;
        let core = base.render_core(&AliasScope::root(), None)?;

        let mut select = core.select;
        let mut columns = Vec::new();
        for (local, foreign) in keys.local.zip(&keys.foreign) {
            columns.push(entity.storage_of(foreign)?.to_string());
            select.expr(column(&core.alias, owner.storage_of(local)?));
        }
        for (name, value) in values.iter().filter(|(name, _)| !keys.foreign.contains(name)) {
            let def = entity.column_def(name)?;
            columns.push(def.storage.clone());
            select.expr(statements::typed_value(def, value)?);
        }
        if !core.condition.is_empty() {
            select.cond_where(core.condition);
        }
        select.limit(1);

        let before = [values.clone()];
        relation.hooks.fire(HookEvent::BeforeCreate, &before, self.exec)?;
        let Some(row) = statements::insert_select(self.exec, entity, &columns, select)?.into_iter().next() else {
            return Ok(None);
        };
        relation.hooks.fire(HookEvent::AfterCreate, std::slice::from_ref(&row), self.exec)?;
        Ok(Some(row))
    }

    /// Resolve the `belongsTo` relations of each row, copying parent keys into its values.
    fn resolve_parents(&self, entity: &EntityDef, data: Vec<CreateData>) -> Result<Vec<Pending>, RelationError> {
        let mut pending = Vec::with_capacity(data.len());
        let mut parents: Vec<(String, Vec<(usize, Single)>)> = Vec::new();

        for (index, row) in data.into_iter().enumerate() {
            let mut children = Vec::new();
            for (name, mutation) in row.relations {
                let rel = self.registry.find_relation(&entity.name, &name)?;
                if !matches!(rel.kind, RelationKind::BelongsTo(_)) {
                    children.push((name, mutation));
                    continue;
                }
                let request = match mutation {
                    NestedMutation::Create(data) => Single::Create(data),
                    NestedMutation::Connect(lookups) => match <[Record; 1]>::try_from(lookups) {
                        Ok([lookup]) => Single::Connect(lookup),
                        Err(_) => return Err(unsupported("connect", rel)),
                    },
                    NestedMutation::ConnectOrCreate(items) => match <[ConnectOrCreate; 1]>::try_from(items) {
                        Ok([item]) => Single::ConnectOrCreate(item),
                        Err(_) => return Err(unsupported("connectOrCreate", rel)),
                    },
                    other => return Err(unsupported(other.option(), rel)),
                };
                group(&mut parents, name, (index, request));
            }
            pending.push(Pending { values: row.values, children });
        }

        for (name, requests) in parents {
            let rel = self.registry.find_relation(&entity.name, &name)?;
            let RelationKind::BelongsTo(keys) = &rel.kind else {
                continue;
            };
            let target = self.registry.target_of(rel)?;
            log::debug!("resolving {} `{name}` parents of {}", requests.len(), entity.name);

            let (indices, requests): (Vec<_>, Vec<_>) = requests.into_iter().unzip();
            let resolved = self.find_or_create(target, Some(&rel.hooks), requests)?;
            for (index, parent) in indices.into_iter().zip(resolved) {
                if let Some(row) = pending.get_mut(index) {
                    copy_keys(&mut row.values, &keys.local, &parent, &keys.foreign, &target.name)?;
                }
            }
        }
        Ok(pending)
    }

    /// One row of `target` per request: looked up in one `SELECT`, missing ones created in
    /// one `INSERT`.
    fn find_or_create(&self, target: &EntityDef, hooks: Option<&Hooks>, requests: Vec<Single>) -> Result<Vec<Record>, RelationError> {
        let lookups: Vec<Record> = requests
            .iter()
            .filter_map(|r| match r {
                Single::Connect(lookup) => Some(lookup.clone()),
                Single::ConnectOrCreate(item) => Some(item.lookup.clone()),
                Single::Create(_) => None,
            })
            .collect();
        let found = self.find_all(target, &lookups)?;

        let mut resolved: Vec<Option<Record>> = vec![None; requests.len()];
        let mut to_create = Vec::new();
        for (index, request) in requests.into_iter().enumerate() {
            match request {
                Single::Create(data) => to_create.push((index, data)),
                Single::Connect(lookup) => {
                    let row = found.iter().find(|r| matches_lookup(target, r, &lookup)).ok_or_else(RelationError::not_found)?;
                    resolved[index] = Some(row.clone());
                }
                Single::ConnectOrCreate(item) => match found.iter().find(|r| matches_lookup(target, r, &item.lookup)) {
                    Some(row) => resolved[index] = Some(row.clone()),
                    None => to_create.push((index, item.create)),
                },
            }
        }

        let (indices, data): (Vec<_>, Vec<_>) = to_create.into_iter().unzip();
        for (index, row) in indices.into_iter().zip(self.create(target, hooks, data)?) {
            resolved[index] = Some(row);
        }
        resolved.into_iter().map(|r| r.ok_or_else(RelationError::not_found)).collect()
    }

    fn find_all(&self, target: &EntityDef, lookups: &[Record]) -> Result<Vec<Record>, RelationError> {
        match lookups_condition(target, lookups)? {
            Some(condition) => statements::select(self.exec, target, condition),
            None => Ok(Vec::new()),
        }
    }

    /// Run the child-side mutations of freshly inserted `rows`, batched per relation.
    fn create_children(
        &self,
        entity: &EntityDef,
        rows: &[Record],
        children: Vec<Vec<(String, NestedMutation)>>,
    ) -> Result<(), RelationError> {
        if children.iter().all(Vec::is_empty) {
            return Ok(());
        }
        if rows.len() != children.len() {
            return Err(RelationError::Validation(format!(
                "Insert into `{}` returned {} rows for {} records",
                entity.name,
                rows.len(),
                children.len()
            )));
        }

        let mut groups: Vec<(String, Vec<(usize, NestedMutation)>)> = Vec::new();
        for (index, relations) in children.into_iter().enumerate() {
            for (name, mutation) in relations {
                group(&mut groups, name, (index, mutation));
            }
        }

        for (name, requests) in groups {
            let rel = self.registry.find_relation(&entity.name, &name)?;
            let target = self.registry.target_of(rel)?;
            log::debug!("nested create of `{name}` for {} {} rows", rows.len(), entity.name);
            let attach = self.split_attach(rel, target, requests)?;
            match &rel.kind {
                RelationKind::HasOne(keys) | RelationKind::HasMany(keys) => {
                    self.attach_direct(rel, keys, target, rows, attach)?;
                }
                RelationKind::HasAndBelongsToMany(keys) => {
                    let targets = self.resolve_targets(rel, target, attach)?;
                    let pairs: Vec<_> = targets
                        .iter()
                        .filter_map(|(index, row)| rows.get(*index).map(|owner| (owner, row)))
                        .collect();
                    insert_links(self.exec, keys, entity, target, &pairs)?;
                }
                RelationKind::BelongsTo(_) | RelationKind::Through(_) => {
                    return Err(unsupported("create", rel));
                }
            }
        }
        Ok(())
    }

    /// Sort attach requests into creates and connects. `connectOrCreate` lookups are
    /// checked in one `SELECT`: matches become connects, the rest creates.
    fn split_attach(
        &self,
        relation: &RelationDef,
        target: &EntityDef,
        requests: Vec<(usize, NestedMutation)>,
    ) -> Result<Attach, RelationError> {
        let mut attach = Attach::default();
        let mut either = Vec::new();
        for (index, mutation) in requests {
            match mutation {
                NestedMutation::Create(data) => attach.creates.push((index, data)),
                NestedMutation::CreateMany(data) => attach.creates.extend(data.into_iter().map(|d| (index, d))),
                NestedMutation::Connect(lookups) => attach.connects.extend(lookups.into_iter().map(|l| (index, l))),
                NestedMutation::ConnectOrCreate(items) => either.extend(items.into_iter().map(|i| (index, i))),
                other => return Err(unsupported(other.option(), relation)),
            }
        }

        if !either.is_empty() {
            let lookups: Vec<Record> = either.iter().map(|(_, item)| item.lookup.clone()).collect();
            let found = self.find_all(target, &lookups)?;
            for (index, item) in either {
                if found.iter().any(|row| matches_lookup(target, row, &item.lookup)) {
                    attach.connects.push((index, item.lookup));
                } else {
                    attach.creates.push((index, item.create));
                }
            }
        }
        Ok(attach)
    }

    /// Connect and create children whose foreign key points at `parents`.
    fn attach_direct(
        &self,
        relation: &RelationDef,
        keys: &DirectKeys,
        target: &EntityDef,
        parents: &[Record],
        attach: Attach,
    ) -> Result<(), RelationError> {
        if !attach.connects.is_empty() {
            self.connect_direct(relation, keys, target, parents, &attach.connects)?;
        }
        let mut data = Vec::with_capacity(attach.creates.len());
        for (index, mut row) in attach.creates {
            let parent = parents.get(index).ok_or_else(RelationError::not_found)?;
            copy_keys(&mut row.values, &keys.foreign, parent, &keys.local, &relation.owner)?;
            data.push(row);
        }
        self.create(target, Some(&relation.hooks), data)?;
        Ok(())
    }

    /// Point the children matching each lookup at its parent in one `UPDATE`. With several
    /// parents the new key is chosen per row by a `CASE` over the lookups.
    fn connect_direct(
        &self,
        relation: &RelationDef,
        keys: &DirectKeys,
        target: &EntityDef,
        parents: &[Record],
        links: &[(usize, Record)],
    ) -> Result<Vec<Record>, RelationError> {
        let lookups: Vec<Record> = links.iter().map(|(_, lookup)| lookup.clone()).collect();
        let Some(condition) = lookups_condition(target, &lookups)? else {
            return Ok(Vec::new());
        };
        let parent_of = |index: usize| parents.get(index).ok_or_else(RelationError::not_found);
        let first = links.first().map_or(0, |(index, _)| *index);
        let single_parent = links.iter().all(|(index, _)| *index == first);

        let mut sets = Vec::new();
        for (local, foreign) in keys.local.zip(&keys.foreign) {
            let def = target.column_def(foreign)?;
            let expr: Expr = if single_parent {
                def.bind(key_value(parent_of(first)?, local, &relation.owner)?)?
            } else {
                let mut case = CaseStatement::new();
                for (index, lookup) in links {
                    let value = def.bind(key_value(parent_of(*index)?, local, &relation.owner)?)?;
                    case = case.case(record_condition(target, &target.table, lookup)?, value);
                }
                case.finally(column(&target.table, &def.storage)).into()
            };
            sets.push((def.storage.clone(), expr));
        }

        let updated = hooked_update(self.exec, Some(&relation.hooks), target, sets, condition)?;
        if links.iter().any(|(_, lookup)| !updated.iter().any(|row| matches_lookup(target, row, lookup))) {
            return Err(RelationError::not_found());
        }
        Ok(updated)
    }

    /// Clear the foreign key of the children matching `condition`.
    fn nullify(
        &self,
        relation: &RelationDef,
        keys: &DirectKeys,
        target: &EntityDef,
        condition: Condition,
    ) -> Result<Vec<Record>, RelationError> {
        let sets = keys
            .foreign
            .iter()
            .map(|col| {
                let def = target.column_def(col)?;
                Ok((def.storage.clone(), def.bind(&Json::Null)?))
            })
            .collect::<Result<Vec<_>, RelationError>>()?;
        hooked_update(self.exec, Some(&relation.hooks), target, sets, condition)
    }

    /// Target rows for join-table links: connects looked up in one `SELECT` (each must
    /// match), creates inserted in one `INSERT`.
    fn resolve_targets(
        &self,
        relation: &RelationDef,
        target: &EntityDef,
        attach: Attach,
    ) -> Result<Vec<(usize, Record)>, RelationError> {
        let lookups: Vec<Record> = attach.connects.iter().map(|(_, lookup)| lookup.clone()).collect();
        let found = self.find_all(target, &lookups)?;
        let mut targets = Vec::new();
        for (index, lookup) in attach.connects {
            let row = found.iter().find(|r| matches_lookup(target, r, &lookup)).ok_or_else(RelationError::not_found)?;
            targets.push((index, row.clone()));
        }

        let (indices, data): (Vec<_>, Vec<_>) = attach.creates.into_iter().unzip();
        let created = self.create(target, Some(&relation.hooks), data)?;
        targets.extend(indices.into_iter().zip(created));
        Ok(targets)
    }

    /// Rows of `target` related to any of `rows` through `relation`.
    fn linked(&self, relation: &RelationDef, target: &EntityDef, rows: &[Record]) -> Result<Condition, RelationError> {
        let scope = AliasScope::root().with(&target.table);
        let mut any = Condition::any();
        for row in rows {
            any = any.add(compile(self.registry, relation, &target.table, BaseRef::Record(row), &scope)?);
        }
        if rows.is_empty() {
            any = any.add(Expr::cust("false"));
        }
        Ok(any)
    }

    /// Patch the rows `query` matches and run the nested mutations against them.
    pub(crate) fn update(&self, query: &Query, data: UpdateData) -> Result<Vec<Record>, RelationError> {
        let entity = query.entity_def()?;
        let condition = statements::target_condition(query)?;
        let UpdateData { mut values, relations } = data;

        let mut owner_side = Vec::new();
        let mut child_side = Vec::new();
        for (name, mutation) in relations {
            let rel = self.registry.find_relation(&entity.name, &name)?;
            if matches!(rel.kind, RelationKind::BelongsTo(_)) {
                owner_side.push((rel, mutation));
            } else {
                child_side.push((rel, mutation));
            }
        }

        let needs_current = owner_side.iter().any(|(_, m)| {
            matches!(m, NestedMutation::Update { .. } | NestedMutation::Delete(_) | NestedMutation::Upsert { .. })
        });
        let current = if needs_current {
            statements::select(self.exec, entity, condition.clone())?
        } else {
            Vec::new()
        };

        let mut deletes = Vec::new();
        for (rel, mutation) in owner_side {
            let RelationKind::BelongsTo(keys) = &rel.kind else {
                continue;
            };
            let target = self.registry.target_of(rel)?;
            let hooks = Some(&rel.hooks);
            log::debug!("nested {} of `{}` on {}", mutation.option(), rel.name, entity.name);

            match mutation {
                NestedMutation::Connect(lookups) => {
                    let found = self.find_all(target, &lookups)?;
                    let parent = lookups
                        .iter()
                        .find_map(|lookup| found.iter().find(|row| matches_lookup(target, row, lookup)))
                        .ok_or_else(RelationError::not_found)?;
                    copy_keys(&mut values, &keys.local, parent, &keys.foreign, &target.name)?;
                }
                NestedMutation::Disconnect(_) => {
                    for local in keys.local.iter() {
                        values.insert(local.to_string(), Json::Null);
                    }
                }
                NestedMutation::Create(data) => {
                    let parent = self.create(target, hooks, vec![data])?;
                    let parent = parent.first().ok_or_else(RelationError::not_found)?;
                    copy_keys(&mut values, &keys.local, parent, &keys.foreign, &target.name)?;
                }
                NestedMutation::ConnectOrCreate(items) => {
                    let requests = items.into_iter().map(Single::ConnectOrCreate).collect();
                    let parent = self.find_or_create(target, hooks, requests)?;
                    let parent = parent.first().ok_or_else(RelationError::not_found)?;
                    copy_keys(&mut values, &keys.local, parent, &keys.foreign, &target.name)?;
                }
                NestedMutation::Update { lookups, values: patch } => {
                    if let Some(parents) = parents_of(target, keys, &current)? {
                        let condition = with_lookups(target, parents, &lookups)?;
                        hooked_update(self.exec, hooks, target, patch_sets(target, &patch)?, condition)?;
                    }
                }
                NestedMutation::Upsert { update, create } => {
                    let updated = match parents_of(target, keys, &current)? {
                        Some(parents) => hooked_update(self.exec, hooks, target, patch_sets(target, &update)?, parents)?,
                        None => Vec::new(),
                    };
                    if updated.is_empty() {
                        let parent = self.create(target, hooks, vec![create])?;
                        let parent = parent.first().ok_or_else(RelationError::not_found)?;
                        copy_keys(&mut values, &keys.local, parent, &keys.foreign, &target.name)?;
                    }
                }
                NestedMutation::Delete(lookups) => {
                    let Some(parents) = parents_of(target, keys, &current)? else {
                        continue;
                    };
                    let condition = with_lookups(target, parents, &lookups)?;
                    if !lookups.is_empty() && statements::select(self.exec, target, condition.clone())?.is_empty() {
                        log::debug!("`{}` of {} matches none of the delete lookups", rel.name, entity.name);
                        continue;
                    }
                    deletes.push((rel, target, condition));
                    for local in keys.local.iter() {
                        values.insert(local.to_string(), Json::Null);
                    }
                }
                other => return Err(unsupported(other.option(), rel)),
            }
        }

        let sets = patch_sets(entity, &values)?;
        let rows = if sets.is_empty() {
            statements::select(self.exec, entity, condition)?
        } else {
            statements::update_exprs(self.exec, entity, sets, condition)?
        };

        for (rel, target, condition) in deletes {
            hooked_delete(self.exec, Some(&rel.hooks), target, condition)?;
        }

        if rows.is_empty() {
            return Ok(rows);
        }
        for (rel, mutation) in child_side {
            self.update_children(entity, &rows, rel, mutation)?;
        }
        Ok(rows)
    }

    fn update_children(
        &self,
        entity: &EntityDef,
        rows: &[Record],
        relation: &RelationDef,
        mutation: NestedMutation,
    ) -> Result<(), RelationError> {
        let target = self.registry.target_of(relation)?;
        let hooks = Some(&relation.hooks);
        let linked = self.linked(relation, target, rows)?;
        log::debug!("nested {} of `{}` for {} {} rows", mutation.option(), relation.name, rows.len(), entity.name);

        match (&relation.kind, mutation) {
            (RelationKind::HasOne(keys) | RelationKind::HasMany(keys), NestedMutation::Disconnect(lookups)) => {
                self.nullify(relation, keys, target, with_lookups(target, linked, &lookups)?)?;
            }
            (RelationKind::HasOne(_) | RelationKind::HasMany(_), NestedMutation::Delete(lookups)) => {
                hooked_delete(self.exec, hooks, target, with_lookups(target, linked, &lookups)?)?;
            }
            (
                RelationKind::HasOne(_) | RelationKind::HasMany(_) | RelationKind::HasAndBelongsToMany(_),
                NestedMutation::Update { lookups, values },
            ) => {
                let condition = with_lookups(target, linked, &lookups)?;
                hooked_update(self.exec, hooks, target, patch_sets(target, &values)?, condition)?;
            }
            (RelationKind::HasOne(keys) | RelationKind::HasMany(keys), NestedMutation::Set(lookups)) => {
                self.nullify(relation, keys, target, linked)?;
                let links: Vec<_> = lookups.into_iter().map(|lookup| (0, lookup)).collect();
                if !links.is_empty() {
                    self.connect_direct(relation, keys, target, rows, &links)?;
                }
            }
            (RelationKind::HasOne(keys), NestedMutation::Upsert { update, mut create }) => {
                let updated = hooked_update(self.exec, hooks, target, patch_sets(target, &update)?, linked)?;
                if updated.is_empty() {
                    let parent = rows.first().ok_or_else(RelationError::not_found)?;
                    copy_keys(&mut create.values, &keys.foreign, parent, &keys.local, &relation.owner)?;
                    self.create(target, hooks, vec![create])?;
                }
            }
            (
                RelationKind::HasOne(keys) | RelationKind::HasMany(keys),
                mutation @ (NestedMutation::Create(_)
                | NestedMutation::CreateMany(_)
                | NestedMutation::Connect(_)
                | NestedMutation::ConnectOrCreate(_)),
            ) => {
                if matches!(relation.kind, RelationKind::HasOne(_)) {
                    self.nullify(relation, keys, target, linked)?;
                }
                let attach = self.split_attach(relation, target, vec![(0, mutation)])?;
                self.attach_direct(relation, keys, target, rows, attach)?;
            }

            (
                RelationKind::HasAndBelongsToMany(keys),
                mutation @ (NestedMutation::Create(_)
                | NestedMutation::CreateMany(_)
                | NestedMutation::Connect(_)
                | NestedMutation::ConnectOrCreate(_)),
            ) => {
                let attach = self.split_attach(relation, target, vec![(0, mutation)])?;
                let targets: Vec<Record> = self
                    .resolve_targets(relation, target, attach)?
                    .into_iter()
                    .map(|(_, row)| row)
                    .collect();
                self.link_all(keys, entity, target, rows, &targets)?;
            }
            (RelationKind::HasAndBelongsToMany(keys), NestedMutation::Disconnect(lookups)) => {
                if lookups.is_empty() {
                    delete_links(self.exec, keys, entity, target, rows, None)?;
                } else {
                    let found = self.find_all(target, &lookups)?;
                    if !found.is_empty() {
                        delete_links(self.exec, keys, entity, target, rows, Some(&found))?;
                    }
                }
            }
            (RelationKind::HasAndBelongsToMany(keys), NestedMutation::Set(lookups)) => {
                delete_links(self.exec, keys, entity, target, rows, None)?;
                let found = self.find_all(target, &lookups)?;
                self.link_all(keys, entity, target, rows, &found)?;
            }
            (RelationKind::HasAndBelongsToMany(keys), NestedMutation::Delete(lookups)) => {
                let doomed = statements::select(self.exec, target, with_lookups(target, linked, &lookups)?)?;
                if doomed.is_empty() {
                    return Ok(());
                }
                delete_links(self.exec, keys, entity, target, rows, Some(&doomed))?;
                let condition = keys_condition(target, &target.table, &keys.foreign, &keys.foreign, &doomed)?;
                hooked_delete(self.exec, hooks, target, condition)?;
            }

            (_, other) => return Err(unsupported(other.option(), relation)),
        }
        Ok(())
    }

    /// Link every owner row to every target row.
    fn link_all(
        &self,
        keys: &JoinTableKeys,
        owner: &EntityDef,
        target: &EntityDef,
        owners: &[Record],
        targets: &[Record],
    ) -> Result<u64, RelationError> {
        let pairs: Vec<_> = owners
            .iter()
            .flat_map(|o| targets.iter().map(move |t| (o, t)))
            .collect();
        insert_links(self.exec, keys, owner, target, &pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{fixtures, record, MockConnection, MockEvent};
    use sea_query::Value;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn query(entity: &str) -> Query {
        Query::new(&fixtures::registry(), entity).unwrap()
    }

    fn user_values(name: &str) -> Record {
        record(json!({"name": name, "email": format!("{name}@example.com")}))
    }

    #[test]
    fn test_belongs_to_create_runs_before_owner_insert() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 7, "name": "ann", "email": "ann@example.com"})]);
        conn.push_rows(vec![json!({"id": 1, "user_id": 7, "title": "t"})]);

        let post = query("post")
            .create(
                &conn,
                CreateData::new(record(json!({"title": "t"})))
                    .with("user", NestedMutation::Create(CreateData::new(user_values("ann")))),
            )
            .unwrap();

        assert_eq!(post["userId"], json!(7));
        let statements = conn.statements();
        assert!(statements[0].starts_with(r#"INSERT INTO "user""#), "{}", statements[0]);
        assert!(statements[1].starts_with(r#"INSERT INTO "post" ("user_id", "title")"#), "{}", statements[1]);
        assert_eq!(conn.values_of(1)[0], Value::Int(Some(7)));
    }

    #[test]
    fn test_create_many_batches_nested_creates() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 1}), json!({"id": 2})]);

        query("user")
            .create_many(
                &conn,
                vec![
                    CreateData::new(user_values("a"))
                        .with("posts", NestedMutation::Create(CreateData::new(record(json!({"title": "x"}))))),
                    CreateData::new(user_values("b"))
                        .with("posts", NestedMutation::Create(CreateData::new(record(json!({"title": "y"}))))),
                ],
            )
            .unwrap();

        let statements = conn.statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[1],
            r#"INSERT INTO "post" ("user_id", "title") VALUES ($1, $2), ($3, $4) RETURNING *"#
        );
        let values = conn.values_of(1);
        assert_eq!(values[0], Value::Int(Some(1)));
        assert_eq!(values[2], Value::Int(Some(2)));
    }

    #[test]
    fn test_connect_to_missing_record_is_not_found() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 1, "name": "a", "email": "a@example.com"})]);

        let err = query("user")
            .create(
                &conn,
                CreateData::new(user_values("a")).with("posts", NestedMutation::Connect(vec![record(json!({"id": 9}))])),
            )
            .unwrap_err();

        assert_eq!(err.to_string(), "Not found: Record is not found");
        assert_eq!(
            conn.statements()[1],
            r#"UPDATE "post" SET "user_id" = $1 WHERE "post"."id" = $2 RETURNING *"#
        );
        assert_eq!(conn.events().last(), Some(&MockEvent::Rollback));
    }

    #[test]
    fn test_connect_or_create_connects_found_and_creates_missing() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 5})]);
        conn.push_rows(vec![json!({"id": 1, "userId": null, "title": "x"})]);
        conn.push_rows(vec![json!({"id": 1, "user_id": 5, "title": "x"})]);
        conn.push_rows(vec![json!({"id": 3, "user_id": 5, "title": "b"})]);

        let either = |id: i64, title: &str| ConnectOrCreate {
            lookup: record(json!({"id": id})),
            create: CreateData::new(record(json!({"title": title}))),
        };
        query("user")
            .create(
                &conn,
                CreateData::new(user_values("a"))
                    .with("posts", NestedMutation::ConnectOrCreate(vec![either(1, "a"), either(2, "b")])),
            )
            .unwrap();

        let statements = conn.statements();
        assert_eq!(statements.len(), 4);
        assert!(statements[1].starts_with("SELECT"), "{}", statements[1]);
        assert!(statements[2].starts_with(r#"UPDATE "post""#), "{}", statements[2]);
        assert!(statements[3].starts_with(r#"INSERT INTO "post""#), "{}", statements[3]);
        assert_eq!(conn.values_of(3)[0], Value::Int(Some(5)));
    }

    #[test]
    fn test_relation_hooks_fire_once_per_statement() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let hooks = Hooks::new().on(HookEvent::AfterCreate, move |rows, _| {
            seen.lock().unwrap().push(rows.len());
            Ok(())
        });
        let registry = fixtures::registry_with_hooks(hooks);

        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 1}), json!({"id": 2})]);
        conn.push_rows(vec![json!({"id": 10, "user_id": 1}), json!({"id": 11, "user_id": 2})]);

        Query::new(&registry, "user")
            .unwrap()
            .create_many(
                &conn,
                vec![
                    CreateData::new(user_values("a"))
                        .with("posts", NestedMutation::Create(CreateData::new(record(json!({"title": "x"}))))),
                    CreateData::new(user_values("b"))
                        .with("posts", NestedMutation::Create(CreateData::new(record(json!({"title": "y"}))))),
                ],
            )
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_join_table_connect_inserts_links() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 1, "user_id": 1, "title": "t"})]);
        conn.push_rows(vec![json!({"id": 4, "name": "rust"})]);

        query("post")
            .create(
                &conn,
                CreateData::new(record(json!({"userId": 1, "title": "t"})))
                    .with("labels", NestedMutation::Connect(vec![record(json!({"id": 4}))])),
            )
            .unwrap();

        assert_eq!(
            conn.statements()[2],
            r#"INSERT INTO "post_label" ("post_id", "tag_id") VALUES ($1, $2)"#
        );
    }

    #[test]
    fn test_chain_create_requires_single_base_row() {
        let conn = MockConnection::new();
        let err = query("user")
            .chain("posts")
            .unwrap()
            .create(&conn, CreateData::new(record(json!({"title": "t"}))))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Ambiguous record: Cannot create based on a query which returns multiple records"
        );
        assert!(conn.events().is_empty());
    }

    #[test]
    fn test_chain_create_selects_key_from_base() {
        let conn = MockConnection::new();
        let err = query("user")
            .find([json!(1)])
            .unwrap()
            .chain("posts")
            .unwrap()
            .create(&conn, CreateData::new(record(json!({"title": "t"}))))
            .unwrap_err();

        assert!(matches!(err, RelationError::NotFound(_)));
        let sql = &conn.statements()[0];
        assert!(sql.starts_with(r#"INSERT INTO "post" ("user_id", "title") SELECT "user"."id""#), "{sql}");
        assert!(sql.ends_with("RETURNING *"), "{sql}");
    }

    #[test]
    fn test_create_through_record_copies_foreign_key() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 3, "user_id": 8, "title": "t"})]);
        let owner = record(json!({"id": 8, "name": "a"}));
        query("user")
            .query_related("posts", &owner)
            .unwrap()
            .create(&conn, CreateData::new(record(json!({"title": "t"}))))
            .unwrap();
        assert_eq!(conn.values_of(0)[0], Value::Int(Some(8)));
    }

    #[test]
    fn test_batch_update_rejects_set_before_any_sql() {
        let conn = MockConnection::new();
        let err = query("user")
            .update(
                &conn,
                UpdateData::default().with("profile", NestedMutation::Set(vec![record(json!({"id": 2}))])),
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "Validation error: `set` option is not allowed in a batch update");
        assert!(conn.events().is_empty());
    }

    #[test]
    fn test_set_disconnects_then_connects() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 1, "name": "a", "email": "a@example.com"})]);
        conn.push_rows(vec![]);
        conn.push_rows(vec![json!({"id": 2, "user_id": 1, "bio": null})]);

        query("user")
            .find([json!(1)])
            .unwrap()
            .update(
                &conn,
                UpdateData::default().with("profile", NestedMutation::Set(vec![record(json!({"id": 2}))])),
            )
            .unwrap();

        let statements = conn.statements();
        assert_eq!(statements.len(), 3);
        assert_eq!(
            statements[1],
            r#"UPDATE "profile" SET "user_id" = $1 WHERE "profile"."user_id" = $2 RETURNING *"#
        );
        assert_eq!(conn.values_of(1)[0], Value::Int(None));
        assert_eq!(
            statements[2],
            r#"UPDATE "profile" SET "user_id" = $1 WHERE "profile"."id" = $2 RETURNING *"#
        );
    }

    #[test]
    fn test_belongs_to_connect_copies_key_into_patch() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 2, "name": "b", "email": "b@example.com"})]);
        conn.push_rows(vec![json!({"id": 3, "user_id": 2, "title": "t"})]);

        let rows = query("post")
            .find([json!(3)])
            .unwrap()
            .update(
                &conn,
                UpdateData::default().with("user", NestedMutation::Connect(vec![record(json!({"id": 2}))])),
            )
            .unwrap();

        assert_eq!(rows[0]["userId"], json!(2));
        assert_eq!(
            conn.statements()[1],
            r#"UPDATE "post" SET "user_id" = $1 WHERE "post"."id" = $2 RETURNING *"#
        );
        assert_eq!(conn.values_of(1)[0], Value::Int(Some(2)));
    }

    #[test]
    fn test_belongs_to_delete_runs_after_owner_update() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 2, "userId": 1, "bio": null})]);
        conn.push_rows(vec![json!({"id": 2, "user_id": null, "bio": null})]);

        query("profile")
            .find([json!(2)])
            .unwrap()
            .update(&conn, UpdateData::default().with("user", NestedMutation::Delete(vec![])))
            .unwrap();

        let statements = conn.statements();
        assert!(statements[0].starts_with("SELECT"), "{}", statements[0]);
        assert!(statements[1].starts_with(r#"UPDATE "profile" SET "user_id" = $1"#), "{}", statements[1]);
        assert_eq!(statements[2], r#"DELETE FROM "user" WHERE "user"."id" = $1 RETURNING *"#);
    }

    #[test]
    fn test_belongs_to_delete_with_unmatched_lookup_keeps_key() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 2, "userId": 1, "bio": null})]);

        query("profile")
            .find([json!(2)])
            .unwrap()
            .update(&conn, UpdateData::default().with("user", NestedMutation::Delete(vec![record(json!({"id": 9}))])))
            .unwrap();

        let statements = conn.statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[1].starts_with(r#"SELECT "user"."id""#), "{}", statements[1]);
        assert!(statements.iter().all(|sql| sql.starts_with("SELECT")), "{statements:?}");
    }

    #[test]
    fn test_belongs_to_delete_with_matched_lookup() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 2, "userId": 1, "bio": null})]);
        conn.push_rows(vec![json!({"id": 1, "name": "a", "email": "a@example.com"})]);
        conn.push_rows(vec![json!({"id": 2, "user_id": null, "bio": null})]);

        query("profile")
            .find([json!(2)])
            .unwrap()
            .update(&conn, UpdateData::default().with("user", NestedMutation::Delete(vec![record(json!({"id": 1}))])))
            .unwrap();

        let statements = conn.statements();
        assert_eq!(statements.len(), 4);
        assert!(statements[2].starts_with(r#"UPDATE "profile" SET "user_id" = $1"#), "{}", statements[2]);
        assert!(statements[3].starts_with(r#"DELETE FROM "user""#), "{}", statements[3]);
    }

    #[test]
    fn test_connect_or_create_fires_update_or_create_hooks_per_item() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = [
            HookEvent::BeforeCreate,
            HookEvent::AfterCreate,
            HookEvent::BeforeUpdate,
            HookEvent::AfterUpdate,
            HookEvent::BeforeDelete,
            HookEvent::AfterDelete,
        ];
        let hooks = events.into_iter().fold(Hooks::new(), |hooks, event| {
            let log = Arc::clone(&log);
            hooks.on(event, move |rows, _| {
                log.lock().unwrap().push((event, rows.len()));
                Ok(())
            })
        });
        let registry = fixtures::registry_with_hooks(hooks);

        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 5, "name": "a", "email": "a@example.com"})]);
        conn.push_rows(vec![json!({"id": 1, "title": "x"}), json!({"id": 2, "title": "y"})]);
        conn.push_rows(vec![json!({"id": 1, "title": "x"}), json!({"id": 2, "title": "y"})]);
        conn.push_rows(vec![json!({"id": 1, "user_id": 5, "title": "x"}), json!({"id": 2, "user_id": 5, "title": "y"})]);
        conn.push_rows(vec![json!({"id": 3, "user_id": 5, "title": "c"})]);

        let either = |id: i64, title: &str| ConnectOrCreate {
            lookup: record(json!({"id": id})),
            create: CreateData::new(record(json!({"title": title}))),
        };
        Query::new(&registry, "user")
            .unwrap()
            .create(
                &conn,
                CreateData::new(user_values("a")).with(
                    "posts",
                    NestedMutation::ConnectOrCreate(vec![either(1, "a"), either(2, "b"), either(3, "c")]),
                ),
            )
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (HookEvent::BeforeUpdate, 2),
                (HookEvent::AfterUpdate, 2),
                (HookEvent::BeforeCreate, 1),
                (HookEvent::AfterCreate, 1),
            ]
        );
        assert_eq!(conn.statements().len(), 5);
    }

    #[test]
    fn test_has_one_upsert_creates_when_update_matches_nothing() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 1, "name": "a", "email": "a@example.com"})]);
        conn.push_rows(vec![]);
        conn.push_rows(vec![json!({"id": 4, "user_id": 1, "bio": "new"})]);

        query("user")
            .find([json!(1)])
            .unwrap()
            .update(
                &conn,
                UpdateData::default().with(
                    "profile",
                    NestedMutation::Upsert {
                        update: record(json!({"bio": "changed"})),
                        create: CreateData::new(record(json!({"bio": "new"}))),
                    },
                ),
            )
            .unwrap();

        let statements = conn.statements();
        assert_eq!(statements.len(), 3);
        assert_eq!(
            statements[1],
            r#"UPDATE "profile" SET "bio" = $1 WHERE "profile"."user_id" = $2 RETURNING *"#
        );
        assert_eq!(statements[2], r#"INSERT INTO "profile" ("user_id", "bio") VALUES ($1, $2) RETURNING *"#);
        assert_eq!(conn.values_of(2)[0], Value::Int(Some(1)));
    }

    #[test]
    fn test_has_one_create_on_update_replaces_current() {
        let conn = MockConnection::new();
        conn.push_rows(vec![json!({"id": 1, "name": "a", "email": "a@example.com"})]);
        conn.push_rows(vec![json!({"id": 2, "user_id": null, "bio": "old"})]);
        conn.push_rows(vec![json!({"id": 3, "user_id": 1, "bio": "new"})]);

        query("user")
            .find([json!(1)])
            .unwrap()
            .update(
                &conn,
                UpdateData::default()
                    .with("profile", NestedMutation::Create(CreateData::new(record(json!({"bio": "new"}))))),
            )
            .unwrap();

        let statements = conn.statements();
        assert_eq!(statements.len(), 3);
        assert_eq!(
            statements[1],
            r#"UPDATE "profile" SET "user_id" = $1 WHERE "profile"."user_id" = $2 RETURNING *"#
        );
        assert_eq!(conn.values_of(1)[0], Value::Int(None));
        assert_eq!(statements[2], r#"INSERT INTO "profile" ("user_id", "bio") VALUES ($1, $2) RETURNING *"#);
    }

    #[test]
    fn test_batch_update_rejects_single_row_options() {
        let batch = || query("user").where_in("id", vec![json!(1), json!(2)]);
        let cases = [
            ("set", NestedMutation::Set(vec![record(json!({"id": 2}))])),
            (
                "upsert",
                NestedMutation::Upsert {
                    update: record(json!({"bio": "x"})),
                    create: CreateData::new(record(json!({"bio": "x"}))),
                },
            ),
            ("create", NestedMutation::Create(CreateData::new(record(json!({"bio": "x"}))))),
        ];
        for (option, mutation) in cases {
            let conn = MockConnection::new();
            let err = batch().update(&conn, UpdateData::default().with("profile", mutation)).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("Validation error: `{option}` option is not allowed in a batch update")
            );
            assert!(conn.events().is_empty());
        }
    }

    #[test]
    fn test_update_with_nothing_matched_skips_children() {
        let conn = MockConnection::new();
        query("user")
            .where_eq("name", json!("nobody"))
            .update(
                &conn,
                UpdateData::new(record(json!({"name": "x"}))).with("posts", NestedMutation::Delete(vec![])),
            )
            .unwrap();
        assert_eq!(conn.statements().len(), 1);
    }
}
