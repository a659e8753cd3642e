//! NF-013: Converter pipeline.
//!
//! A converter entry is `[converter]`, `[converter, args|kwargs]` or
//! `[converter, args, kwargs]`. The converter is a callable or an
//! expression naming one; it is called as `converter(config, *args,
//! **kwargs)` and returns the next config.

use super::error::{Error, Result};
use super::expr::eval_string;
use super::layers::{parse_args, parse_kwargs};
use super::types::ConverterLayer;
use super::value::{Env, Function, Value};
use log::debug;
use std::sync::Arc;

fn check_converter(entry: &Value) -> Result<&[Value]> {
    let items = match entry {
        Value::List(items) | Value::Tuple(items) => items.as_slice(),
        other => {
            return Err(Error::ConfigFormat(format!(
                "invalid converter {:?}, should be a list",
                other
            )))
        }
    };
    if !matches!(items.first(), Some(Value::Str(_) | Value::Function(_))) {
        return Err(Error::ConfigFormat(format!(
            "converter should have str or callable as first item {:?}",
            entry
        )));
    }
    let ok = match items {
        [_] => true,
        [_, rest] => matches!(rest, Value::List(_) | Value::Tuple(_) | Value::Dict(_)),
        [_, args, kwargs] => {
            matches!(args, Value::List(_) | Value::Tuple(_)) && matches!(kwargs, Value::Dict(_))
        }
        _ => false,
    };
    if !ok {
        return Err(Error::ConfigFormat(format!(
            "converter should be [converter, args?, kwargs?] {:?}",
            entry
        )));
    }
    Ok(items)
}

fn parse_converter(converter: &Value, env: &Env) -> Result<Arc<dyn Function>> {
    let resolved = match converter {
        Value::Str(src) => eval_string(src, env)?,
        other => other.clone(),
    };
    match resolved {
        Value::Function(f) => Ok(f),
        other => Err(Error::ConfigFormat(format!(
            "invalid converter {:?}, should be callable",
            other
        ))),
    }
}

/// Resolve a converter list against `env`.
pub fn parse_converters(converters: &Value, env: &Env) -> Result<Vec<ConverterLayer>> {
    let entries = match converters {
        Value::List(items) | Value::Tuple(items) => items,
        other => {
            return Err(Error::ConfigFormat(format!(
                "invalid converters {:?}, should be a list of lists",
                other
            )))
        }
    };
    let empty = Value::Dict(Default::default());
    let no_args: &[Value] = &[];
    entries
        .iter()
        .map(|entry| {
            let items = check_converter(entry)?;
            let (args, kwargs): (&[Value], &Value) = match items {
                [_, Value::List(a) | Value::Tuple(a)] => (a.as_slice(), &empty),
                [_, k @ Value::Dict(_)] => (no_args, k),
                [_, Value::List(a) | Value::Tuple(a), k] => (a.as_slice(), k),
                _ => (no_args, &empty),
            };
            Ok(ConverterLayer {
                converter: parse_converter(&items[0], env)?,
                args: parse_args(args, env)?,
                kwargs: parse_kwargs(kwargs, env)?,
            })
        })
        .collect()
}

/// Thread `config` through every converter in order.
pub fn apply_converters(config: Value, converters: &[ConverterLayer]) -> Result<Value> {
    converters.iter().try_fold(config, |config, c| {
        debug!("applying converter {} to {:?}", c.converter.name(), config);
        let mut args = Vec::with_capacity(c.args.len() + 1);
        args.push(config);
        args.extend(c.args.iter().cloned());
        c.converter.call(args, c.kwargs.clone())
    })
}
