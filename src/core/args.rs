//! NF-007: Parameter declarations and call-site binding.
//!
//! A module config declares `args` as an ordered list of bare names
//! (required) and `{name: default}` / `[name, default]` entries
//! (optional). Callers bind them positionally and by keyword, with the
//! same rules a function signature would enforce.

use super::error::{Error, Result};
use super::expr::resolve_value;
use super::types::ParamDecl;
use super::value::{DictKey, Env, Kwargs, Value};
use std::collections::HashSet;

fn parse_decl(entry: &Value) -> Result<ParamDecl> {
    match entry {
        Value::Str(name) => Ok(ParamDecl::Required(name.clone())),
        Value::Dict(d) => match (d.len(), d.first()) {
            (1, Some((DictKey::Str(name), default))) => {
                Ok(ParamDecl::Optional(name.clone(), default.clone()))
            }
            (1, _) => Err(Error::ConfigFormat(format!(
                "default param {:?} should have a str key",
                entry
            ))),
            _ => Err(Error::ConfigFormat(format!(
                "default param {:?} should have one item",
                entry
            ))),
        },
        Value::List(pair) | Value::Tuple(pair) => match pair.as_slice() {
            [Value::Str(name), default] => Ok(ParamDecl::Optional(name.clone(), default.clone())),
            _ => Err(Error::ConfigFormat(format!(
                "default param {:?} should be a (str, default) pair",
                entry
            ))),
        },
        other => Err(Error::ConfigFormat(format!(
            "invalid param {:?}, should be str, single-key mapping or pair",
            other
        ))),
    }
}

/// Parse and validate a declaration list.
pub fn parse_params(params: &Value) -> Result<Vec<ParamDecl>> {
    let entries = match params {
        Value::None => return Ok(Vec::new()),
        Value::List(items) | Value::Tuple(items) => items,
        other => {
            return Err(Error::ConfigFormat(format!(
                "invalid params {:?}, should be a list",
                other
            )))
        }
    };
    let decls = entries.iter().map(parse_decl).collect::<Result<Vec<_>>>()?;
    check_params(&decls)?;
    Ok(decls)
}

/// Declaration-order rules: unique names, no required after optional.
pub fn check_params(decls: &[ParamDecl]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut saw_optional = false;
    for decl in decls {
        if !seen.insert(decl.name()) {
            return Err(Error::ConfigFormat(format!(
                "duplicate parameter '{}'",
                decl.name()
            )));
        }
        match decl {
            ParamDecl::Optional(..) => saw_optional = true,
            ParamDecl::Required(name) if saw_optional => {
                return Err(Error::ConfigFormat(format!(
                    "non-default parameter '{}' follows default parameter",
                    name
                )))
            }
            ParamDecl::Required(_) => {}
        }
    }
    Ok(())
}

/// Bind call-site values to declarations: defaults, then positional
/// arguments in order, then keywords. Values are returned unevaluated.
pub fn resolve_params(decls: &[ParamDecl], args: &[Value], kwargs: &Kwargs) -> Result<Env> {
    check_params(decls)?;
    if args.len() > decls.len() {
        return Err(Error::Arity(format!(
            "expected at most {} positional arguments, got {}",
            decls.len(),
            args.len()
        )));
    }

    let open = &decls[args.len()..];
    if let Some(key) = kwargs.keys().find(|k| !open.iter().any(|d| d.name() == *k)) {
        return Err(Error::Arity(format!(
            "no parameter named '{}' or it is already bound by position",
            key
        )));
    }
    let missing: Vec<&str> = open
        .iter()
        .filter(|d| d.is_required() && !kwargs.contains_key(d.name()))
        .map(ParamDecl::name)
        .collect();
    if !missing.is_empty() {
        return Err(Error::Arity(format!(
            "argument missing for parameters {:?}",
            missing
        )));
    }

    let mut bound = Env::new();
    for decl in decls {
        let default = match decl {
            ParamDecl::Optional(_, v) => v.clone(),
            ParamDecl::Required(_) => Value::None,
        };
        bound.insert(decl.name().to_string(), default);
    }
    for (decl, arg) in decls.iter().zip(args) {
        bound.insert(decl.name().to_string(), arg.clone());
    }
    for (key, value) in kwargs {
        bound.insert(key.clone(), value.clone());
    }
    Ok(bound)
}

/// Bind and evaluate a module's inputs: the environment contributed by
/// the caller's arguments. String values are evaluated against `env`.
pub fn input_env(params: &Value, args: &[Value], kwargs: &Kwargs, env: &Env) -> Result<Env> {
    let decls = parse_params(params)?;
    let bound = resolve_params(&decls, args, kwargs)?;
    bound
        .into_iter()
        .map(|(k, v)| Ok((k, resolve_value(&v, env)?)))
        .collect()
}
