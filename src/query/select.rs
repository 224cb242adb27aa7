//! The relation-aware query node.
//!
//! A [`Query`] targets one entity and accumulates filters, joins, relation selections,
//! ordering and a limit. Relation names resolve against the [`Registry`] the node was
//! created from. Nodes reached through a relation (`related`, `chain`, `query_related`)
//! carry an anchor describing how they correlate with their base; the anchor is compiled
//! to a join condition only when the statement is rendered, against whichever alias the
//! base ends up with.
//!
//! Builder methods that only record state are infallible. Methods that name a relation
//! return `Result` so an unknown relation fails where it is written.

use std::fmt;
use std::sync::Arc;

use sea_query::{Condition, Order};
use serde_json::Value as Json;

use crate::entity::EntityDef;
use crate::executor::Record;
use crate::relation::{Registry, RelationDef, RelationError};

/// Mapping function applied to every fetched record of a node.
pub type MapFn = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// Predicate on the node's alias.
pub type FilterFn = Arc<dyn Fn(&str) -> Condition + Send + Sync>;

/// Comparison used by [`Query::where_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CountOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CountOp::Eq => "=",
            CountOp::Ne => "<>",
            CountOp::Gt => ">",
            CountOp::Gte => ">=",
            CountOp::Lt => "<",
            CountOp::Lte => "<=",
        }
    }
}

/// What a node produces when rendered as a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Rows,
    Exists,
    Count,
}

#[derive(Clone)]
pub(crate) enum Filter {
    Eq(String, Json),
    In(String, Vec<Json>),
    IsNull(String),
    Custom(FilterFn),
    Exists { query: Box<Query>, negate: bool },
    Count { query: Box<Query>, op: CountOp, value: i64 },
}

#[derive(Clone)]
pub(crate) enum Anchor {
    None,
    /// Correlated with the alias of the node this one is nested in.
    Parent { owner: String, relation: String },
    /// Correlated with a separately rendered base query through `EXISTS`.
    Chain { base: Box<Query>, relation: String },
    /// Correlated with the key values of a fetched owner record.
    Record { owner: String, relation: String, record: Record },
    /// Correlated with a fixed alias that is rendered elsewhere.
    Correlated { owner: String, relation: String, base_alias: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinKind {
    Inner,
    Left,
}

#[derive(Clone)]
pub(crate) struct Join {
    pub(crate) kind: JoinKind,
    pub(crate) lateral: bool,
    pub(crate) query: Query,
}

#[derive(Clone)]
pub(crate) struct Selection {
    pub(crate) key: String,
    pub(crate) query: Query,
}

#[derive(Clone)]
pub struct Query {
    pub(crate) registry: Arc<Registry>,
    pub(crate) entity: String,
    pub(crate) alias: Option<String>,
    pub(crate) default_alias: String,
    pub(crate) filters: Vec<Filter>,
    pub(crate) anchor: Anchor,
    pub(crate) columns: Option<Vec<String>>,
    pub(crate) selections: Vec<Selection>,
    pub(crate) joins: Vec<Join>,
    pub(crate) order: Vec<(String, Order)>,
    pub(crate) limit: Option<u64>,
    pub(crate) to_one: bool,
    pub(crate) shape: Shape,
    pub(crate) map: Option<MapFn>,
    /// A chained create may find no parent row.
    pub(crate) optional: bool,
}

impl Query {
    /// A query over every row of `entity`, aliased by its table name.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` when the entity is not registered.
    pub fn new(registry: &Arc<Registry>, entity: &str) -> Result<Self, RelationError> {
        let def = registry.entity(entity)?;
        Ok(Self::blank(registry, def, def.table.clone(), Anchor::None))
    }

    fn blank(registry: &Arc<Registry>, entity: &EntityDef, default_alias: String, anchor: Anchor) -> Self {
        Self {
            registry: Arc::clone(registry),
            entity: entity.name.clone(),
            alias: None,
            default_alias,
            filters: Vec::new(),
            anchor,
            columns: None,
            selections: Vec::new(),
            joins: Vec::new(),
            order: Vec::new(),
            limit: None,
            to_one: false,
            shape: Shape::Rows,
            map: None,
            optional: false,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn entity_def(&self) -> Result<&EntityDef, RelationError> {
        self.registry.entity(&self.entity)
    }

    /// Alias used when this node is rendered at the top of a statement.
    pub fn alias_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.default_alias)
    }

    /// `name` as a column of this node: unqualified, or qualified with the node's own alias.
    /// `None` for a column of a join (`posts.title`).
    pub(crate) fn own_column<'n>(&self, name: &'n str) -> Option<&'n str> {
        match name.split_once('.') {
            None => Some(name),
            Some((qualifier, column)) if qualifier == self.alias_name() => Some(column),
            Some(_) => None,
        }
    }

    /// Render the node under an explicit alias.
    pub fn as_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Equality on `column`, or on a joined column written `join.column`.
    pub fn where_eq(mut self, column: impl Into<String>, value: Json) -> Self {
        self.filters.push(Filter::Eq(column.into(), value));
        self
    }

    pub fn where_in(mut self, column: impl Into<String>, values: Vec<Json>) -> Self {
        self.filters.push(Filter::In(column.into(), values));
        self
    }

    pub fn where_null(mut self, column: impl Into<String>) -> Self {
        self.filters.push(Filter::IsNull(column.into()));
        self
    }

    /// Arbitrary predicate built against the alias this node renders under.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> Condition + Send + Sync + 'static,
    {
        self.filters.push(Filter::Custom(Arc::new(filter)));
        self
    }

    /// Equality on every field of `lookup`, e.g. `{"email": "a@b.c"}`.
    pub fn find_by(mut self, lookup: &Record) -> Self {
        for (column, value) in lookup {
            self.filters.push(Filter::Eq(column.clone(), value.clone()));
        }
        self
    }

    /// Equality on the primary key. Composite keys take one value per key column, in order.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` when the number of values does not match the key.
    pub fn find(mut self, key: impl IntoIterator<Item = Json>) -> Result<Self, RelationError> {
        let columns: Vec<String> = self.entity_def()?.primary_key().map(|c| c.name.clone()).collect();
        let values: Vec<Json> = key.into_iter().collect();
        if columns.is_empty() || columns.len() != values.len() {
            return Err(RelationError::Validation(format!(
                "`{}` has {} primary key columns, got {} values",
                self.entity,
                columns.len(),
                values.len()
            )));
        }
        for (column, value) in columns.into_iter().zip(values) {
            self.filters.push(Filter::Eq(column, value));
        }
        Ok(self)
    }

    pub fn order_by(mut self, column: impl Into<String>, order: Order) -> Self {
        self.order.push((column.into(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Limit to a single row.
    pub fn take(self) -> Self {
        self.limit(1)
    }

    /// Restrict the output columns (logical names, `join.column` for columns of a join). All
    /// columns are selected by default.
    pub fn select_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Allow a create through [`Query::chain`] to find no parent row; see
    /// [`Query::create_optional`]. Carried into chained queries.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn map<F>(mut self, map: F) -> Self
    where
        F: Fn(Record) -> Record + Send + Sync + 'static,
    {
        self.map = Some(Arc::new(map));
        self
    }

    /// Produce `true`/`false` instead of rows when selected as a relation.
    pub fn exists(mut self) -> Self {
        self.shape = Shape::Exists;
        self
    }

    /// Produce the row count instead of rows when selected as a relation.
    pub fn count(mut self) -> Self {
        self.shape = Shape::Count;
        self
    }

    fn relation_def(&self, name: &str) -> Result<&RelationDef, RelationError> {
        self.registry.find_relation(&self.entity, name)
    }

    fn target_node(&self, name: &str, anchor: Anchor, default_alias: Option<String>) -> Result<Query, RelationError> {
        let rel = self.relation_def(name)?;
        let target = self.registry.target_of(rel)?;
        let to_one = !self.registry.is_many(rel)?;
        let alias = default_alias.unwrap_or_else(|| name.to_string());
        let mut node = Self::blank(&self.registry, target, alias, anchor);
        node.to_one = to_one;
        Ok(node)
    }

    /// The rows of relation `name`, correlated with this node wherever the result is nested
    /// (`select_with`, `where_exists`, ...).
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown or unresolvable relation.
    pub fn related(&self, name: &str) -> Result<Query, RelationError> {
        let anchor = Anchor::Parent { owner: self.entity.clone(), relation: name.to_string() };
        self.target_node(name, anchor, None)
    }

    /// A standalone query over relation `name` of the rows this query matches:
    /// `SELECT ... FROM target WHERE EXISTS (SELECT 1 FROM base WHERE <base filters> AND <join>)`.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown or unresolvable relation.
    pub fn chain(&self, name: &str) -> Result<Query, RelationError> {
        let rel = self.relation_def(name)?;
        let table = self.registry.target_of(rel)?.table.clone();
        let anchor = Anchor::Chain { base: Box::new(self.clone()), relation: name.to_string() };
        let mut node = self.target_node(name, anchor, Some(table))?;
        node.to_one = false;
        node.optional = self.optional;
        Ok(node)
    }

    /// Rows of relation `name` belonging to an already fetched `record` of this entity,
    /// with the join condition bound to the record's key values. To-one relations are
    /// limited to one row.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown or unresolvable relation.
    pub fn query_related(&self, name: &str, record: &Record) -> Result<Query, RelationError> {
        let rel = self.relation_def(name)?;
        let table = self.registry.target_of(rel)?.table.clone();
        let anchor = Anchor::Record {
            owner: self.entity.clone(),
            relation: name.to_string(),
            record: record.clone(),
        };
        self.target_node(name, anchor, Some(table))
    }

    /// Keep rows having at least one related row matching `scope`.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown relation.
    pub fn where_exists<F>(self, name: &str, scope: F) -> Result<Self, RelationError>
    where
        F: FnOnce(Query) -> Query,
    {
        self.push_exists(name, scope, false)
    }

    /// Keep rows having no related row matching `scope`.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown relation.
    pub fn where_not_exists<F>(self, name: &str, scope: F) -> Result<Self, RelationError>
    where
        F: FnOnce(Query) -> Query,
    {
        self.push_exists(name, scope, true)
    }

    fn push_exists<F>(mut self, name: &str, scope: F, negate: bool) -> Result<Self, RelationError>
    where
        F: FnOnce(Query) -> Query,
    {
        let query = scope(self.related(name)?);
        self.filters.push(Filter::Exists { query: Box::new(query), negate });
        Ok(self)
    }

    /// Keep rows whose number of related rows matching `scope` compares to `value` by `op`.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown relation.
    pub fn where_count<F>(mut self, name: &str, scope: F, op: CountOp, value: i64) -> Result<Self, RelationError>
    where
        F: FnOnce(Query) -> Query,
    {
        let query = scope(self.related(name)?);
        self.filters.push(Filter::Count { query: Box::new(query), op, value });
        Ok(self)
    }

    /// `JOIN target AS <relation name> ON <join> AND <scope filters>`.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown relation.
    pub fn join<F>(self, name: &str, scope: F) -> Result<Self, RelationError>
    where
        F: FnOnce(Query) -> Query,
    {
        self.push_join(name, scope, JoinKind::Inner, false)
    }

    /// Like [`Query::join`], keeping rows without a related row.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown relation.
    pub fn left_join<F>(self, name: &str, scope: F) -> Result<Self, RelationError>
    where
        F: FnOnce(Query) -> Query,
    {
        self.push_join(name, scope, JoinKind::Left, false)
    }

    /// `JOIN LATERAL (<related query>) AS <relation name> ON true`. The related query may
    /// order and limit on its own; the joined row is selected as a JSON object under the
    /// join alias.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown relation.
    pub fn join_lateral<F>(self, name: &str, scope: F) -> Result<Self, RelationError>
    where
        F: FnOnce(Query) -> Query,
    {
        self.push_join(name, scope, JoinKind::Inner, true)
    }

    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown relation.
    pub fn left_join_lateral<F>(self, name: &str, scope: F) -> Result<Self, RelationError>
    where
        F: FnOnce(Query) -> Query,
    {
        self.push_join(name, scope, JoinKind::Left, true)
    }

    fn push_join<F>(mut self, name: &str, scope: F, kind: JoinKind, lateral: bool) -> Result<Self, RelationError>
    where
        F: FnOnce(Query) -> Query,
    {
        let query = scope(self.related(name)?);
        self.joins.push(Join { kind, lateral, query });
        Ok(self)
    }

    /// Select relation `name` under output key `key`: an object (or `null`) for to-one
    /// relations, an array (empty when nothing matches) for to-many ones.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for an unknown relation.
    pub fn select_relation(self, key: impl Into<String>, name: &str) -> Result<Self, RelationError> {
        self.select_with(key, |q| q.related(name))
    }

    /// Select the node built by `build` from this one under output key `key`. The node
    /// must be a relation of this entity, e.g. `|q| Ok(q.related("posts")?.count())`.
    ///
    /// # Errors
    ///
    /// Returns whatever `build` returns, or a `ValidationError` when the node is not a
    /// relation of this entity.
    pub fn select_with<F>(mut self, key: impl Into<String>, build: F) -> Result<Self, RelationError>
    where
        F: FnOnce(&Query) -> Result<Query, RelationError>,
    {
        let key = key.into();
        let query = build(&self)?;
        match &query.anchor {
            Anchor::Parent { owner, .. } if *owner == self.entity => {}
            _ => {
                return Err(RelationError::Validation(format!(
                    "Selection `{key}` is not a relation of `{}`",
                    self.entity
                )))
            }
        }
        self.selections.push(Selection { key, query });
        Ok(self)
    }

    /// Whether this query provably matches at most one row: limited to one row, or filtered
    /// by equality on the full primary key or on a unique column.
    pub fn is_single_row(&self) -> bool {
        if self.limit == Some(1) {
            return true;
        }
        if self.to_one && matches!(self.anchor, Anchor::Record { .. }) {
            return true;
        }
        let Ok(entity) = self.entity_def() else {
            return false;
        };
        let columns = self.filters.iter().filter_map(|f| match f {
            Filter::Eq(column, value) if !value.is_null() => self.own_column(column),
            _ => None,
        });
        entity.is_unique_lookup(columns)
    }
}

impl RelationDef {
    /// The `related` query constrained by this relation's join condition against the alias
    /// of `base`, as it is compiled inside joins and sub-selects.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` when `related` does not query this relation's target or
    /// `base` does not query its owner.
    pub fn join_query(&self, related: &Query, base: &Query) -> Result<Query, RelationError> {
        if base.entity != self.owner {
            return Err(RelationError::Validation(format!(
                "Relation `{}` is defined on `{}`, not `{}`",
                self.name, self.owner, base.entity
            )));
        }
        let target = related.registry.target_of(self)?;
        if related.entity != target.name {
            return Err(RelationError::Validation(format!(
                "Relation `{}` targets `{}`, not `{}`",
                self.name, target.name, related.entity
            )));
        }

        let mut query = related.clone();
        query.anchor = Anchor::Correlated {
            owner: self.owner.clone(),
            relation: self.name.clone(),
            base_alias: base.alias_name().to_string(),
        };
        Ok(query)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("entity", &self.entity)
            .field("alias", &self.alias_name())
            .field("filters", &self.filters.len())
            .field("selections", &self.selections.iter().map(|s| s.key.as_str()).collect::<Vec<_>>())
            .field("joins", &self.joins.len())
            .field("limit", &self.limit)
            .field("shape", &self.shape)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fixtures;
    use serde_json::json;

    fn users() -> Query {
        Query::new(&fixtures::registry(), "user").unwrap()
    }

    #[test]
    fn test_unknown_entity_and_relation() {
        assert!(matches!(
            Query::new(&fixtures::registry(), "nope"),
            Err(RelationError::Configuration(_))
        ));
        let err = users().related("comments").unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: Unknown relation `comments` on `user`");
    }

    #[test]
    fn test_single_row_proof() {
        assert!(users().find([json!(1)]).unwrap().is_single_row());
        assert!(users().where_eq("email", json!("a@b.c")).is_single_row());
        assert!(users().take().is_single_row());
        assert!(!users().where_in("id", vec![json!(1), json!(2)]).is_single_row());
        assert!(!users().where_eq("name", json!("bob")).is_single_row());
        assert!(!users().where_eq("id", json!(null)).is_single_row());
    }

    #[test]
    fn test_composite_find_needs_every_key_column() {
        let registry = fixtures::registry();
        let links = Query::new(&registry, "postTag").unwrap();
        assert!(links.clone().find([json!(1)]).is_err());
        assert!(links.find([json!(1), json!(2)]).unwrap().is_single_row());
    }

    #[test]
    fn test_related_node_cardinality() {
        let q = users();
        assert!(q.related("profile").unwrap().to_one);
        assert!(!q.related("posts").unwrap().to_one);
        assert!(!q.related("tags").unwrap().to_one);
        assert_eq!(q.related("posts").unwrap().entity(), "post");
    }

    #[test]
    fn test_select_with_rejects_foreign_nodes() {
        let registry = fixtures::registry();
        let posts = Query::new(&registry, "post").unwrap();
        let err = users().select_with("x", |_| Ok(posts.clone())).unwrap_err();
        assert!(matches!(err, RelationError::Validation(_)));
    }
}
