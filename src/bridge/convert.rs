//! Conversion between host values and Lua values.
//!
//! Mapping:
//! - `Null` ↔ `nil` at the top level, `luadoop.null` inside lists and maps
//! - `Int` ↔ integer, `Float` ↔ number, `Bool` ↔ boolean
//! - `Text` ↔ string; strings that are not valid UTF-8 come back as `Bytes`
//! - `List` ↔ sequence table, `Map` ↔ table with string keys
//!
//! A table converts to a `List` when its keys are exactly `1..=n`, otherwise
//! to a `Map` (integer keys are stringified).

use std::collections::BTreeMap;

use mlua::{FromLua, IntoLua, Lua, Table, Value};

use crate::host::conf::Configuration;
use crate::host::datum::Datum;

/// Deepest nesting accepted in either direction
pub const MAX_DEPTH: usize = 64;

pub fn datum_to_lua<'lua>(lua: &'lua Lua, datum: &Datum) -> mlua::Result<Value<'lua>> {
    datum_to_lua_at(lua, datum, 0)
}

fn datum_to_lua_at<'lua>(lua: &'lua Lua, datum: &Datum, depth: usize) -> mlua::Result<Value<'lua>> {
    if depth > MAX_DEPTH {
        return Err(mlua::Error::runtime(format!(
            "value nesting exceeds {} levels",
            MAX_DEPTH
        )));
    }

    match datum {
        Datum::Null if depth == 0 => Ok(Value::Nil),
        Datum::Null => Ok(Value::NULL),
        Datum::Bool(b) => Ok(Value::Boolean(*b)),
        Datum::Int(i) => Ok(Value::Integer(*i)),
        Datum::Float(f) => Ok(Value::Number(*f)),
        Datum::Text(s) => Ok(Value::String(lua.create_string(s)?)),
        Datum::Bytes(b) => Ok(Value::String(lua.create_string(b)?)),
        Datum::List(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, datum_to_lua_at(lua, item, depth + 1)?)?;
            }
            Ok(Value::Table(table))
        }
        Datum::Map(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, value) in map {
                table.raw_set(key.as_str(), datum_to_lua_at(lua, value, depth + 1)?)?;
            }
            Ok(Value::Table(table))
        }
    }
}

/// Sequence element variant: `Null` always becomes the sentinel
pub fn datum_to_lua_element<'lua>(lua: &'lua Lua, datum: &Datum) -> mlua::Result<Value<'lua>> {
    match datum {
        Datum::Null => Ok(Value::NULL),
        other => datum_to_lua(lua, other),
    }
}

pub fn lua_to_datum(value: Value<'_>) -> mlua::Result<Datum> {
    lua_to_datum_at(value, 0)
}

fn lua_to_datum_at(value: Value<'_>, depth: usize) -> mlua::Result<Datum> {
    if depth > MAX_DEPTH {
        return Err(conversion_error(
            value.type_name(),
            format!("value nesting exceeds {} levels", MAX_DEPTH),
        ));
    }

    match value {
        Value::Nil => Ok(Datum::Null),
        Value::LightUserData(ud) if ud.0.is_null() => Ok(Datum::Null),
        Value::Boolean(b) => Ok(Datum::Bool(b)),
        Value::Integer(i) => Ok(Datum::Int(i)),
        Value::Number(n) => Ok(Datum::Float(n)),
        Value::String(s) => match s.to_str() {
            Ok(text) => Ok(Datum::Text(text.to_string())),
            Err(_) => Ok(Datum::Bytes(s.as_bytes().to_vec())),
        },
        Value::Table(table) => table_to_datum(table, depth),
        other => Err(conversion_error(
            other.type_name(),
            "only nil, booleans, numbers, strings and tables are record values".to_string(),
        )),
    }
}

fn table_to_datum(table: Table<'_>, depth: usize) -> mlua::Result<Datum> {
    let len = table.raw_len();
    let mut count = 0;
    for pair in table.clone().pairs::<Value, Value>() {
        pair?;
        count += 1;
    }

    if count == len {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            let item: Value = table.raw_get(i)?;
            items.push(lua_to_datum_at(item, depth + 1)?);
        }
        return Ok(Datum::List(items));
    }

    let mut map = BTreeMap::new();
    for pair in table.pairs::<Value, Value>() {
        let (key, value) = pair?;
        let key = match key {
            Value::String(s) => s.to_str()?.to_string(),
            Value::Integer(i) => i.to_string(),
            other => {
                return Err(conversion_error(
                    "table",
                    format!("unsupported key type {}", other.type_name()),
                ))
            }
        };
        map.insert(key, lua_to_datum_at(value, depth + 1)?);
    }
    Ok(Datum::Map(map))
}

fn conversion_error(from: &'static str, message: String) -> mlua::Error {
    mlua::Error::FromLuaConversionError {
        from,
        to: "Datum",
        message: Some(message),
    }
}

/// Read-only snapshot of a configuration as a plain table
pub fn conf_to_table<'lua>(lua: &'lua Lua, conf: &Configuration) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table_with_capacity(0, conf.len())?;
    for (key, value) in conf.iter() {
        table.raw_set(key, value)?;
    }
    Ok(table)
}

impl<'lua> FromLua<'lua> for Datum {
    fn from_lua(value: Value<'lua>, _lua: &'lua Lua) -> mlua::Result<Self> {
        lua_to_datum(value)
    }
}

impl<'lua> IntoLua<'lua> for Datum {
    fn into_lua(self, lua: &'lua Lua) -> mlua::Result<Value<'lua>> {
        datum_to_lua(lua, &self)
    }
}
