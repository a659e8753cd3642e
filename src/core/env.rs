//! NF-006: Environment builder.
//!
//! Environments are merged left to right with later keys overriding
//! earlier ones. Import statements bind registry namespaces (or their
//! members); variable lists bind names one at a time so each value can
//! refer to the names bound before it.

use super::error::{Error, Result};
use super::expr::resolve_value;
use super::registry::Registry;
use super::value::{DictKey, Env, Value};
use std::collections::HashSet;

/// Merge environments left to right; later keys override earlier ones.
pub fn merge_envs<'a>(envs: impl IntoIterator<Item = &'a Env>) -> Env {
    let mut merged = Env::new();
    for env in envs {
        for (k, v) in env {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// True when the two environments bind any common name.
pub fn is_env_conflict(a: &Env, b: &Env) -> bool {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.keys().any(|k| large.contains_key(k))
}

/// One parsed import statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Import {
    /// `import ns [as alias]`
    Namespace { name: String, alias: Option<String> },
    /// `from ns import member [as alias], ...`
    Members {
        namespace: String,
        members: Vec<(String, Option<String>)>,
    },
}

impl Import {
    /// Names this statement binds.
    pub fn bound_names(&self) -> Vec<&str> {
        match self {
            Self::Namespace { name, alias } => vec![alias.as_deref().unwrap_or(name)],
            Self::Members { members, .. } => members
                .iter()
                .map(|(m, alias)| alias.as_deref().unwrap_or(m))
                .collect(),
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Split `a as b, c` into `[(a, Some(b)), (c, None)]`.
fn parse_aliases(statement: &str, list: &str) -> Result<Vec<(String, Option<String>)>> {
    let invalid = || Error::ConfigFormat(format!("invalid import statement: {}", statement));
    list.split(',')
        .map(|item| {
            let words: Vec<&str> = item.split_whitespace().collect();
            match words.as_slice() {
                [name] if is_identifier(name) => Ok((name.to_string(), None)),
                [name, "as", alias] if is_identifier(name) && is_identifier(alias) => {
                    Ok((name.to_string(), Some(alias.to_string())))
                }
                _ => Err(invalid()),
            }
        })
        .collect()
}

/// Parse one `import` / `from ... import` statement.
pub fn parse_import(statement: &str) -> Result<Vec<Import>> {
    let trimmed = statement.trim();
    let invalid = || Error::ConfigFormat(format!("invalid import statement: {}", statement));

    if let Some(rest) = trimmed.strip_prefix("import ") {
        return Ok(parse_aliases(statement, rest)?
            .into_iter()
            .map(|(name, alias)| Import::Namespace { name, alias })
            .collect());
    }
    if let Some(rest) = trimmed.strip_prefix("from ") {
        let (namespace, members) = rest.split_once(" import ").ok_or_else(invalid)?;
        let namespace = namespace.trim();
        if !is_identifier(namespace) {
            return Err(invalid());
        }
        let members = members.trim();
        let members = members
            .strip_prefix('(')
            .and_then(|m| m.strip_suffix(')'))
            .unwrap_or(members);
        return Ok(vec![Import::Members {
            namespace: namespace.to_string(),
            members: parse_aliases(statement, members)?,
        }]);
    }
    Err(invalid())
}

/// Bind import statements against the namespaces known to `registry`.
pub fn imports_env(imports: &Value, registry: &Registry) -> Result<Env> {
    let statements = match imports {
        Value::None => return Ok(Env::new()),
        Value::List(items) | Value::Tuple(items) => items,
        other => {
            return Err(Error::ConfigFormat(format!(
                "invalid imports {:?}, should be a list of str",
                other
            )))
        }
    };

    let mut parsed = Vec::new();
    for statement in statements {
        let text = statement.as_str().ok_or_else(|| {
            Error::ConfigFormat(format!(
                "invalid imports {:?}, should be a list of str",
                imports
            ))
        })?;
        parsed.extend(parse_import(text)?);
    }

    let mut seen = HashSet::new();
    for import in &parsed {
        for name in import.bound_names() {
            if !seen.insert(name) {
                return Err(Error::ConfigFormat(format!(
                    "duplicate import name '{}' in {:?}",
                    name, imports
                )));
            }
        }
    }

    let mut env = Env::new();
    for import in &parsed {
        match import {
            Import::Namespace { name, alias } => {
                let ns = registry
                    .namespace(name)
                    .ok_or_else(|| Error::Resolution(format!("no namespace named '{}'", name)))?;
                env.insert(alias.clone().unwrap_or_else(|| name.clone()), Value::Namespace(ns));
            }
            Import::Members { namespace, members } => {
                let ns = registry.namespace(namespace).ok_or_else(|| {
                    Error::Resolution(format!("no namespace named '{}'", namespace))
                })?;
                for (member, alias) in members {
                    let value = ns.members.get(member).cloned().ok_or_else(|| {
                        Error::Resolution(format!(
                            "cannot import name '{}' from '{}'",
                            member, namespace
                        ))
                    })?;
                    env.insert(alias.clone().unwrap_or_else(|| member.clone()), value);
                }
            }
        }
    }
    Ok(env)
}

/// Split a variable entry into its name and unevaluated value.
fn var_entry(entry: &Value) -> Result<(String, Value)> {
    match entry {
        Value::Dict(d) if d.len() == 1 => match d.first() {
            Some((DictKey::Str(k), v)) => Ok((k.clone(), v.clone())),
            _ => Err(Error::ConfigFormat(format!(
                "invalid var {:?}, mapping should have a str key",
                entry
            ))),
        },
        Value::Dict(_) => Err(Error::ConfigFormat(format!(
            "invalid var {:?}, mapping should have one item",
            entry
        ))),
        Value::List(pair) | Value::Tuple(pair) => match pair.as_slice() {
            [Value::Str(k), v] => Ok((k.clone(), v.clone())),
            _ => Err(Error::ConfigFormat(format!(
                "invalid var {:?}, pair should be (str, value)",
                entry
            ))),
        },
        other => Err(Error::ConfigFormat(format!(
            "invalid var {:?}, should be a single-key mapping or a pair",
            other
        ))),
    }
}

/// Evaluate an ordered variable list. Each value sees `env` plus every
/// variable bound before it; only the new bindings are returned.
pub fn vars_env(vars: &Value, env: &Env) -> Result<Env> {
    let entries: Vec<(String, Value)> = match vars {
        Value::None => return Ok(Env::new()),
        Value::List(items) | Value::Tuple(items) => {
            items.iter().map(var_entry).collect::<Result<_>>()?
        }
        Value::Dict(d) => d
            .iter()
            .map(|(k, v)| match k {
                DictKey::Str(k) => Ok((k.clone(), v.clone())),
                other => Err(Error::ConfigFormat(format!(
                    "invalid var name {}, should be str",
                    other
                ))),
            })
            .collect::<Result<_>>()?,
        other => {
            return Err(Error::ConfigFormat(format!(
                "invalid vars {:?}, should be a list of single-key mappings",
                other
            )))
        }
    };

    let mut used = env.clone();
    let mut bound = Env::new();
    for (name, raw) in entries {
        let value = resolve_value(&raw, &used)?;
        used.insert(name.clone(), value.clone());
        bound.insert(name, value);
    }
    Ok(bound)
}
