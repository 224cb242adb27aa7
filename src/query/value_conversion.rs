//! Conversion of `sea_query::Values` into `may_postgres` parameters.
//!
//! Each value becomes an owned `ToSql` box whose Rust type matches the column type the
//! value was bound for, NULLs included (`Option<i32>` for an integer column, `Option<String>`
//! for text, ...), so the server-side parameter type check accepts it.

use crate::executor::LifeError;
use may_postgres::types::ToSql;
use sea_query::{Value, Values};

fn to_param(value: &Value) -> Result<Box<dyn ToSql>, LifeError> {
    let param: Box<dyn ToSql> = match value {
        Value::Bool(b) => Box::new(*b),
        Value::TinyInt(i) => Box::new(i.map(i16::from)),
        Value::SmallInt(i) => Box::new(*i),
        Value::Int(i) => Box::new(*i),
        Value::BigInt(i) => Box::new(*i),
        Value::TinyUnsigned(u) => Box::new(u.map(i16::from)),
        Value::SmallUnsigned(u) => Box::new(u.map(i32::from)),
        Value::Unsigned(u) => Box::new(u.map(i64::from)),
        Value::BigUnsigned(u) => {
            let converted = u
                .map(|u| {
                    i64::try_from(u).map_err(|_| {
                        LifeError::Other(format!(
                            "BigUnsigned value {u} exceeds i64::MAX, cannot be bound as BIGINT"
                        ))
                    })
                })
                .transpose()?;
            Box::new(converted)
        }
        Value::Float(f) => Box::new(*f),
        Value::Double(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Json(j) => Box::new(j.as_ref().map(|j| serde_json::Value::clone(j))),
        other => {
            return Err(LifeError::Other(format!(
                "Unsupported value type in query: {other:?}"
            )))
        }
    };
    Ok(param)
}

/// Convert SeaQuery values to `may_postgres` parameters and run `f` with them.
///
/// The boxed parameters live for the duration of the closure call.
///
/// # Errors
///
/// Returns `LifeError::Other` if a value has no PostgreSQL parameter mapping, otherwise
/// whatever `f` returns.
pub fn with_converted_params<F, R>(values: &Values, f: F) -> Result<R, LifeError>
where
    F: FnOnce(&[&dyn ToSql]) -> Result<R, LifeError>,
{
    let owned = values.iter().map(to_param).collect::<Result<Vec<_>, _>>()?;
    let params: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref()).collect();
    f(&params)
}
