use rusqlite::types::Null;
use rusqlite::Statement;

use crate::models::Id;

/// A statement parameter. The variants are the only kinds of value the
/// repositories ever bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Int(i64),
    Text(String),
    OptText(Option<String>),
    Null,
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Param::Int(value)
    }
}

impl From<Id> for Param {
    fn from(id: Id) -> Self {
        Param::Int(id.0)
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Param::Int(i64::from(value))
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Text(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Text(value)
    }
}

impl From<&String> for Param {
    fn from(value: &String) -> Self {
        Param::Text(value.clone())
    }
}

impl From<Option<String>> for Param {
    fn from(value: Option<String>) -> Self {
        Param::OptText(value)
    }
}

impl From<Option<&str>> for Param {
    fn from(value: Option<&str>) -> Self {
        Param::OptText(value.map(str::to_string))
    }
}

/// Builds a `Vec<Param>` from heterogeneous values.
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::storage::Param>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::storage::Param::from($value)),+]
    };
}

type Binder = fn(&mut Statement<'_>, usize, &Param) -> rusqlite::Result<()>;

fn bind_int(stmt: &mut Statement<'_>, index: usize, param: &Param) -> rusqlite::Result<()> {
    match param {
        Param::Int(value) => stmt.raw_bind_parameter(index, *value),
        _ => unreachable!("bind_int dispatched for {param:?}"),
    }
}

fn bind_text(stmt: &mut Statement<'_>, index: usize, param: &Param) -> rusqlite::Result<()> {
    match param {
        Param::Text(value) => stmt.raw_bind_parameter(index, value.as_str()),
        _ => unreachable!("bind_text dispatched for {param:?}"),
    }
}

fn bind_opt_text(stmt: &mut Statement<'_>, index: usize, param: &Param) -> rusqlite::Result<()> {
    match param {
        Param::OptText(Some(value)) => bind_text(stmt, index, &Param::Text(value.clone())),
        Param::OptText(None) => bind_null(stmt, index, &Param::Null),
        _ => unreachable!("bind_opt_text dispatched for {param:?}"),
    }
}

fn bind_null(stmt: &mut Statement<'_>, index: usize, _param: &Param) -> rusqlite::Result<()> {
    stmt.raw_bind_parameter(index, Null)
}

fn binder_for(param: &Param) -> Binder {
    match param {
        Param::Int(_) => bind_int,
        Param::Text(_) => bind_text,
        Param::OptText(_) => bind_opt_text,
        Param::Null => bind_null,
    }
}

/// Binds `params` to the statement's positional slots, `?1` first.
pub(crate) fn bind_all(stmt: &mut Statement<'_>, params: &[Param]) -> rusqlite::Result<()> {
    for (offset, param) in params.iter().enumerate() {
        binder_for(param)(stmt, offset + 1, param)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::types::Value;
    use rusqlite::Connection;

    fn bound_row(params: &[Param]) -> Vec<Value> {
        let conn = Connection::open_in_memory().unwrap();
        let mut stmt = conn.prepare("SELECT ?1, ?2, ?3").unwrap();
        bind_all(&mut stmt, params).unwrap();
        let mut rows = stmt.raw_query();
        let row = rows.next().unwrap().unwrap();
        (0..3).map(|i| row.get::<_, Value>(i).unwrap()).collect()
    }

    #[test]
    fn test_binds_in_argument_order() {
        let row = bound_row(&params![7_i64, "seven", Some("7".to_string())]);
        assert_eq!(
            row,
            vec![
                Value::Integer(7),
                Value::Text("seven".to_string()),
                Value::Text("7".to_string())
            ]
        );
    }

    #[test]
    fn test_missing_optional_text_binds_null() {
        let row = bound_row(&[Param::Null, Param::OptText(None), Param::from(Option::<&str>::None)]);
        assert_eq!(row, vec![Value::Null, Value::Null, Value::Null]);
    }

    #[test]
    fn test_id_and_bool_bind_as_integers() {
        let row = bound_row(&params![Id(42), "x", true]);
        assert_eq!(row[0], Value::Integer(42));
        assert_eq!(row[2], Value::Integer(1));
    }

    #[test]
    fn test_out_of_range_slot_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        let mut stmt = conn.prepare("SELECT ?1").unwrap();
        assert!(bind_all(&mut stmt, &params![1_i64, 2_i64]).is_err());
    }
}
