//! NF-008: Layer reference (`from`) parsing and index normalization.
//!
//! Accepted shapes:
//! - `drop` (the sentinel) or a string expression evaluating to any shape below
//! - `-1` (bare index, selector `all`)
//! - `{-2: 0}` (index mapped to an output selector, an int or `all`)
//! - a non-empty list mixing the two

use super::error::{Error, Result};
use super::expr::eval_string;
use super::types::{FromTuple, LayerFrom, Selector, ALL, DROP, INPUT_INDEX, LAYER_START_INDEX};
use super::value::{DictKey, Env, Value};
use indexmap::IndexMap;
use std::collections::BTreeSet;

fn invalid(from: &Value, why: &str) -> Error {
    Error::ConfigFormat(format!("invalid from {:?}, {}", from, why))
}

fn parse_single(from: &Value) -> Result<(i64, Selector)> {
    match from {
        Value::Int(i) => Ok((*i, Selector::All)),
        Value::Dict(d) => {
            let (key, value) = match (d.len(), d.first()) {
                (1, Some(entry)) => entry,
                _ => return Err(invalid(from, "mapping should have exactly one key")),
            };
            let DictKey::Int(index) = key else {
                return Err(invalid(from, "key should be int"));
            };
            let selector = match value {
                Value::Int(i) => Selector::Index(*i),
                Value::Str(s) if s == ALL => Selector::All,
                _ => return Err(invalid(from, &format!("value should be int or '{}'", ALL))),
            };
            Ok((*index, selector))
        }
        _ => Err(invalid(from, "should be int or single-key mapping")),
    }
}

fn format_parsed(from: &Value) -> Result<LayerFrom> {
    match from {
        Value::Str(s) if s == DROP => Ok(LayerFrom::Drop),
        Value::List(items) | Value::Tuple(items) => {
            if items.is_empty() {
                return Err(invalid(from, "should not be empty"));
            }
            Ok(LayerFrom::Refs(
                items.iter().map(parse_single).collect::<Result<_>>()?,
            ))
        }
        single => Ok(LayerFrom::Refs(vec![parse_single(single)?])),
    }
}

/// Parse a raw `from` field. Strings other than the drop sentinel are
/// evaluated against `env`; the result must be the sentinel or a valid
/// reference shape. Booleans are rejected even though they look like ints.
pub fn parse_from(raw: &Value, env: &Env) -> Result<LayerFrom> {
    match raw {
        Value::Str(s) if s == DROP => Ok(LayerFrom::Drop),
        Value::Str(s) => {
            let parsed = eval_string(s, env)?;
            if let Value::Str(p) = &parsed {
                if p != DROP {
                    return Err(Error::ConfigFormat(format!("invalid drop key '{}'", p)));
                }
            }
            format_parsed(&parsed)
        }
        other => format_parsed(other),
    }
}

/// Render a parsed reference back into config form.
pub fn from_to_value(from: &LayerFrom) -> Value {
    match from {
        LayerFrom::Drop => Value::from(DROP),
        LayerFrom::Refs(refs) => Value::List(
            refs.iter()
                .map(|(index, sel)| match sel {
                    Selector::All => Value::Int(*index),
                    Selector::Index(i) => {
                        let mut d = IndexMap::new();
                        d.insert(DictKey::Int(*index), Value::Int(*i));
                        Value::Dict(d)
                    }
                })
                .collect(),
        ),
    }
}

/// Absolute source index for reference `from` declared on layer `index`.
/// Negative values are relative to `index`; the result must point at the
/// graph input or an earlier layer.
pub fn normalize(index: i64, from: i64) -> Result<i64> {
    if from >= index {
        return Err(Error::Index(format!(
            "layer from {} should be less than index {}",
            from, index
        )));
    }
    if from >= INPUT_INDEX {
        return Ok(from);
    }
    match index.checked_add(from) {
        Some(abs) if abs >= INPUT_INDEX => Ok(abs),
        _ => Err(Error::Index(format!(
            "layer from {} out of range for index {}",
            from, index
        ))),
    }
}

/// Convert every reference of layer `index` to an absolute index.
pub fn to_absolute(index: i64, refs: &[(i64, Selector)]) -> Result<FromTuple> {
    refs.iter()
        .map(|(from, sel)| Ok((normalize(index, *from)?, *sel)))
        .collect()
}

/// Absolute indexes (from [`LAYER_START_INDEX`]) of drop-sentinel layers.
pub fn drop_indexes(froms: &[LayerFrom]) -> BTreeSet<i64> {
    (LAYER_START_INDEX..)
        .zip(froms)
        .filter(|(_, f)| f.is_drop())
        .map(|(i, _)| i)
        .collect()
}

/// Layers never consumed by a later layer. `froms` must be absolute and
/// numbered from [`LAYER_START_INDEX`]; the last layer is the graph output
/// and is never reported.
pub fn unused_indexes(froms: &[FromTuple]) -> BTreeSet<i64> {
    let used: BTreeSet<i64> = froms.iter().flatten().map(|(i, _)| *i).collect();
    let last = LAYER_START_INDEX + froms.len() as i64 - 1;
    (LAYER_START_INDEX..last).filter(|i| !used.contains(i)).collect()
}
