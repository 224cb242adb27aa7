//! Entity and column metadata.
//!
//! An [`EntityDef`] names a table and describes its columns. Columns have a logical name
//! (the key used in records and filters) and a storage name (the SQL column). The column
//! type decides how a JSON value is bound as a statement parameter.

use sea_query::{Alias, Expr, ExprTrait, Value};
use serde_json::Value as Json;

use crate::executor::Record;
use crate::relation::RelationError;

/// How a column's values are bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    BigInt,
    Double,
    Boolean,
    Text,
    Json,
    /// Any other PostgreSQL type (`uuid`, `timestamptz`, `numeric`, ...). Values are bound as
    /// text and cast to this type.
    Custom(String),
}

impl ColumnType {
    /// PostgreSQL type name, for casts where a parameter's type cannot be inferred.
    pub fn sql_type(&self) -> &str {
        match self {
            ColumnType::Integer => "int4",
            ColumnType::BigInt => "int8",
            ColumnType::Double => "float8",
            ColumnType::Boolean => "bool",
            ColumnType::Text => "text",
            ColumnType::Json => "jsonb",
            ColumnType::Custom(sql_type) => sql_type,
        }
    }
}

/// A single column of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub storage: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        Self {
            storage: name.clone(),
            name,
            column_type,
            nullable: false,
            primary_key: false,
            unique: false,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    /// Store the column under a different SQL name.
    pub fn storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = storage.into();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Bind a JSON value as a typed parameter for this column.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` when the JSON value does not fit the column type.
    pub fn bind(&self, value: &Json) -> Result<Expr, RelationError> {
        let mismatch = || {
            RelationError::Validation(format!(
                "Value {value} does not fit column `{}` ({:?})",
                self.name, self.column_type
            ))
        };

        let bound = match (&self.column_type, value) {
            (ColumnType::Integer, Json::Null) => Value::Int(None),
            (ColumnType::Integer, Json::Number(n)) => {
                let i = n.as_i64().and_then(|i| i32::try_from(i).ok()).ok_or_else(mismatch)?;
                Value::Int(Some(i))
            }
            (ColumnType::BigInt, Json::Null) => Value::BigInt(None),
            (ColumnType::BigInt, Json::Number(n)) => Value::BigInt(Some(n.as_i64().ok_or_else(mismatch)?)),
            (ColumnType::Double, Json::Null) => Value::Double(None),
            (ColumnType::Double, Json::Number(n)) => Value::Double(Some(n.as_f64().ok_or_else(mismatch)?)),
            (ColumnType::Boolean, Json::Null) => Value::Bool(None),
            (ColumnType::Boolean, Json::Bool(b)) => Value::Bool(Some(*b)),
            (ColumnType::Text, Json::Null) => Value::String(None),
            (ColumnType::Text, Json::String(s)) => Value::String(Some(s.clone())),
            (ColumnType::Json, json) => Value::from(json.clone()),
            (ColumnType::Custom(sql_type), json) => {
                let text = match json {
                    Json::Null => None,
                    Json::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                };
                return Ok(Expr::val(Value::String(text)).cast_as(Alias::new(sql_type.clone())));
            }
            _ => return Err(mismatch()),
        };
        Ok(Expr::val(bound))
    }

    /// Whether `a` and `b` denote the same value of this column, as PostgreSQL compares
    /// them: `1` equals `1.0` in numeric columns and `uuid` text ignores case.
    pub fn same_value(&self, a: &Json, b: &Json) -> bool {
        if a == b {
            return true;
        }
        match (&self.column_type, a, b) {
            (ColumnType::Integer | ColumnType::BigInt | ColumnType::Double, Json::Number(x), Json::Number(y)) => {
                match (x.as_i64(), y.as_i64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => x.as_f64().is_some_and(|x| y.as_f64() == Some(x)),
                }
            }
            (ColumnType::Custom(sql_type), a, b) if !a.is_null() && !b.is_null() => {
                let (a, b) = (text_form(a), text_form(b));
                if sql_type.eq_ignore_ascii_case("uuid") {
                    a.eq_ignore_ascii_case(&b)
                } else {
                    a == b || matches!((a.parse::<f64>(), b.parse::<f64>()), (Ok(x), Ok(y)) if x == y)
                }
            }
            _ => false,
        }
    }
}

/// A value as it is bound to a custom-typed column.
fn text_form(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A table-backed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

impl EntityDef {
    /// An entity whose table carries the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            columns: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a column by logical name.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` naming the entity when the column is unknown.
    pub fn column_def(&self, name: &str) -> Result<&ColumnDef, RelationError> {
        self.find_column(name).ok_or_else(|| {
            RelationError::Validation(format!("Unknown column `{name}` on `{}`", self.name))
        })
    }

    /// Storage name of a logical column.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` when the column is unknown.
    pub fn storage_of(&self, name: &str) -> Result<&str, RelationError> {
        Ok(self.column_def(name)?.storage.as_str())
    }

    pub fn primary_key(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    /// Whether equality on `columns` pins down at most one row.
    pub fn is_unique_lookup<'a>(&self, mut columns: impl Iterator<Item = &'a str> + Clone) -> bool {
        let mut pk = self.primary_key().peekable();
        let covers_pk = pk.peek().is_some() && pk.all(|c| columns.clone().any(|n| n == c.name));
        covers_pk || columns.any(|n| self.find_column(n).is_some_and(|c| c.unique))
    }

    /// Rename the keys of a row read with `RETURNING *` from storage to logical names.
    /// Unknown keys are kept as-is.
    pub fn from_storage(&self, row: Record) -> Record {
        row.into_iter()
            .map(|(key, value)| {
                let name = self
                    .columns
                    .iter()
                    .find(|c| c.storage == key)
                    .map_or(key, |c| c.name.clone());
                (name, value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_query::{PostgresQueryBuilder, Query};
    use serde_json::json;

    fn profile() -> EntityDef {
        EntityDef::new("profile")
            .column(ColumnDef::integer("id").primary_key())
            .column(ColumnDef::integer("userId").storage("user_id").nullable())
            .column(ColumnDef::text("handle").unique())
            .column(ColumnDef::new("createdAt", ColumnType::Custom("timestamptz".into())).storage("created_at"))
    }

    #[test]
    fn test_storage_mapping() {
        let entity = profile();
        assert_eq!(entity.storage_of("userId").unwrap(), "user_id");
        assert!(matches!(entity.storage_of("nope"), Err(RelationError::Validation(_))));

        let row: Record = json!({"id": 1, "user_id": 5, "extra": true})
            .as_object()
            .cloned()
            .unwrap();
        let mapped = entity.from_storage(row);
        assert_eq!(mapped.get("userId"), Some(&json!(5)));
        assert_eq!(mapped.get("extra"), Some(&json!(true)));
    }

    #[test]
    fn test_unique_lookup_detection() {
        let entity = profile();
        assert!(entity.is_unique_lookup(["id"].into_iter()));
        assert!(entity.is_unique_lookup(["handle", "userId"].into_iter()));
        assert!(!entity.is_unique_lookup(["userId"].into_iter()));
    }

    #[test]
    fn test_bind_rejects_mismatched_json() {
        let entity = profile();
        let id = entity.column_def("id").unwrap();
        assert!(id.bind(&json!("five")).is_err());
        assert!(id.bind(&json!(5_000_000_000_i64)).is_err());
        assert!(id.bind(&json!(null)).is_ok());
    }

    #[test]
    fn test_same_value_follows_column_type() {
        let double = ColumnDef::new("score", ColumnType::Double);
        assert!(double.same_value(&json!(1), &json!(1.0)));
        assert!(!double.same_value(&json!(1), &json!(1.5)));

        let uuid = ColumnDef::new("token", ColumnType::Custom("uuid".into()));
        assert!(uuid.same_value(
            &json!("A0EEBC99-9C0B-4EF8-BB6D-6BB9BD380A11"),
            &json!("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11")
        ));

        let numeric = ColumnDef::new("price", ColumnType::Custom("numeric".into()));
        assert!(numeric.same_value(&json!("2.50"), &json!(2.5)));

        let text = ColumnDef::text("name");
        assert!(!text.same_value(&json!("Ann"), &json!("ann")));
        assert!(!double.same_value(&json!(null), &json!(0)));
    }

    #[test]
    fn test_bind_casts_custom_types() {
        let entity = profile();
        let created = entity.column_def("createdAt").unwrap();
        let expr = created.bind(&json!("2024-01-01T00:00:00Z")).unwrap();
        let sql = Query::select().expr(expr).to_string(PostgresQueryBuilder);
        assert!(sql.contains("CAST('2024-01-01T00:00:00Z' AS"), "{sql}");
        assert!(sql.contains("timestamptz"), "{sql}");
    }
}
