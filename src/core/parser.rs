//! NF-015: YAML loading and structural validation.
//!
//! Parses a config document into a [`Value`] and checks the shape of each
//! module entry without evaluating anything:
//! - The document must be a mapping
//! - Module entries must be mappings with `layers` or `converters`
//! - Only known keys may appear in a module entry
//! - Layers must be strings or 2-4 item lists
//! - Buffers and params must not share a name

use super::error::{Error, Result};
use super::types::{
    ARGS_KEY, AUTO_REGISTER_KEY, BUFFERS_KEY, CONVERTERS_KEY, GLOBAL_IMPORTS_KEY,
    GLOBAL_VARS_KEY, IMPORTS_KEY, LAYERS_KEY, PARAMS_KEY, VARS_KEY,
};
use super::value::{DictKey, Value};
use std::collections::BTreeSet;
use std::path::Path;

const MODULE_KEYS: &[&str] = &[
    IMPORTS_KEY,
    ARGS_KEY,
    VARS_KEY,
    BUFFERS_KEY,
    PARAMS_KEY,
    LAYERS_KEY,
    CONVERTERS_KEY,
];

const RESERVED_KEYS: &[&str] = &[GLOBAL_IMPORTS_KEY, GLOBAL_VARS_KEY, AUTO_REGISTER_KEY];

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a config document from disk.
pub fn parse_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse a config document from a string.
pub fn parse_config(yaml: &str) -> Result<Value> {
    let raw: serde_yaml_ng::Value = serde_yaml_ng::from_str(yaml)?;
    Value::from_yaml(&raw)
}

/// Top-level module names, reserved keys excluded.
pub fn module_names(config: &Value) -> Vec<String> {
    config
        .as_dict()
        .into_iter()
        .flatten()
        .filter_map(|(k, _)| match k {
            DictKey::Str(s) if !RESERVED_KEYS.contains(&s.as_str()) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

/// Single-key names declared by a `buffers`/`params` list or mapping.
fn declared_names(decls: Option<&Value>) -> BTreeSet<String> {
    let names = |d: &indexmap::IndexMap<DictKey, Value>| -> Vec<String> {
        d.keys().map(|k| k.to_string()).collect()
    };
    match decls {
        Some(Value::Dict(d)) => names(d).into_iter().collect(),
        Some(Value::List(items)) | Some(Value::Tuple(items)) => items
            .iter()
            .filter_map(Value::as_dict)
            .flat_map(names)
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn validate_layers(name: &str, layers: &Value, errors: &mut Vec<ValidationError>) {
    let Some(items) = layers.as_seq() else {
        errors.push(ValidationError {
            message: format!("module '{}' layers must be a list", name),
        });
        return;
    };
    for (i, layer) in items.iter().enumerate() {
        match layer {
            Value::Str(_) => {}
            Value::List(parts) | Value::Tuple(parts) if (2..=4).contains(&parts.len()) => {}
            Value::List(parts) | Value::Tuple(parts) => errors.push(ValidationError {
                message: format!(
                    "module '{}' layer {} has {} items, expected 2 to 4",
                    name,
                    i + 1,
                    parts.len()
                ),
            }),
            other => errors.push(ValidationError {
                message: format!(
                    "module '{}' layer {} must be a list or string, got {}",
                    name,
                    i + 1,
                    other.type_name()
                ),
            }),
        }
    }
}

fn validate_module(name: &str, entry: &Value, errors: &mut Vec<ValidationError>) {
    let Some(fields) = entry.as_dict() else {
        errors.push(ValidationError {
            message: format!("'{}' is not a mapping and can't be a module", name),
        });
        return;
    };

    for key in fields.keys() {
        let known = matches!(key, DictKey::Str(k) if MODULE_KEYS.contains(&k.as_str()));
        if !known {
            errors.push(ValidationError {
                message: format!("module '{}' has unknown key '{}'", name, key),
            });
        }
    }

    match (entry.get(LAYERS_KEY), entry.get(CONVERTERS_KEY)) {
        (None, None) => errors.push(ValidationError {
            message: format!("module '{}' has neither layers nor converters", name),
        }),
        (Some(layers), _) => validate_layers(name, layers, errors),
        _ => {}
    }

    for key in [IMPORTS_KEY, ARGS_KEY, CONVERTERS_KEY] {
        if let Some(v) = entry.get(key) {
            if v.as_seq().is_none() {
                errors.push(ValidationError {
                    message: format!("module '{}' {} must be a list", name, key),
                });
            }
        }
    }

    let buffers = declared_names(entry.get(BUFFERS_KEY));
    let params = declared_names(entry.get(PARAMS_KEY));
    for shared in buffers.intersection(&params) {
        errors.push(ValidationError {
            message: format!(
                "module '{}' declares '{}' as both buffer and param",
                name, shared
            ),
        });
    }
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &Value) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let Some(entries) = config.as_dict() else {
        errors.push(ValidationError {
            message: format!("config must be a mapping, got {}", config.type_name()),
        });
        return errors;
    };

    if let Some(imports) = config.get(GLOBAL_IMPORTS_KEY) {
        let all_str = imports
            .as_seq()
            .is_some_and(|items| items.iter().all(|i| i.as_str().is_some()));
        if !all_str {
            errors.push(ValidationError {
                message: format!("{} must be a list of import statements", GLOBAL_IMPORTS_KEY),
            });
        }
    }

    for (key, entry) in entries {
        match key {
            DictKey::Str(name) if RESERVED_KEYS.contains(&name.as_str()) => {}
            DictKey::Str(name) => validate_module(name, entry, &mut errors),
            other => errors.push(ValidationError {
                message: format!("module name {} must be a string", other),
            }),
        }
    }

    errors
}

/// Fail with the first validation error, if any.
pub fn check_config(config: &Value) -> Result<()> {
    match validate_config(config).into_iter().next() {
        Some(e) => Err(Error::ConfigFormat(e.message)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(yaml: &str) -> Vec<String> {
        let config = parse_config(yaml).unwrap();
        validate_config(&config)
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[test]
    fn test_nf015_parse_valid() {
        let yaml = r#"
global_imports: ["from nn import Linear"]
Block:
  args: [c, {hidden: 8}]
  layers:
    - [-1, Linear, [c, hidden]]
    - [-1, ReLU]
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(module_names(&config), vec!["Block"]);
        let errors = validate_config(&config);
        assert!(
            errors.is_empty(),
            "unexpected errors: {:?}",
            errors.iter().map(|e| &e.message).collect::<Vec<_>>()
        );
        check_config(&config).unwrap();
    }

    #[test]
    fn test_nf015_not_a_mapping() {
        assert!(messages("[1, 2]")[0].contains("must be a mapping"));
    }

    #[test]
    fn test_nf015_module_shape() {
        let errs = messages(
            r#"
Empty: {}
Scalar: 3
Odd:
  layerz: []
  layers:
    - [-1]
    - 5
"#,
        );
        assert!(errs.iter().any(|e| e.contains("'Empty' has neither layers")));
        assert!(errs.iter().any(|e| e.contains("'Scalar' is not a mapping")));
        assert!(errs.iter().any(|e| e.contains("unknown key 'layerz'")));
        assert!(errs.iter().any(|e| e.contains("layer 1 has 1 items")));
        assert!(errs.iter().any(|e| e.contains("layer 2 must be a list")));
    }

    #[test]
    fn test_nf015_buffer_param_conflict() {
        let errs = messages(
            r#"
Net:
  buffers: [{scale: 'ones(1)'}]
  params: {scale: 'zeros(1)'}
  layers: [[-1, Identity]]
"#,
        );
        assert!(errs.iter().any(|e| e.contains("both buffer and param")));
    }

    #[test]
    fn test_nf015_converters_only_is_valid() {
        let errs = messages("Net: {converters: [[widen]]}\nauto_register: [mods]");
        assert!(errs.is_empty(), "{:?}", errs);
    }

    #[test]
    fn test_nf015_bad_global_imports() {
        let errs = messages("global_imports: import nn\nNet: {layers: []}");
        assert!(errs.iter().any(|e| e.contains("global_imports")));
    }

    #[test]
    fn test_nf015_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.yaml");
        std::fs::write(&path, "Net:\n  layers: [[-1, ReLU]]\n").unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(module_names(&config), vec!["Net"]);
        assert!(matches!(
            parse_config_file(&dir.path().join("missing.yaml")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_nf015_parse_invalid_yaml() {
        assert!(matches!(
            parse_config("not: [valid: yaml: {{"),
            Err(Error::Yaml(_))
        ));
    }
}
