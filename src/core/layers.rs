//! NF-009: Layer list parsing.
//!
//! A layer is `[from, module]`, `[from, module, args|kwargs]` or
//! `[from, module, args, kwargs]`. A string entry is evaluated and may
//! expand to one layer or a list of layers spliced in place.

use super::error::{Error, Result};
use super::expr::{eval_string, resolve_value};
use super::layer_from::parse_from;
use super::types::Layer;
use super::value::{DictKey, Env, Kwargs, Value};
use crate::graph::module::{FunctionBuilder, ModuleBuilder};
use std::sync::Arc;

fn check_layer(layer: &Value) -> Result<()> {
    let items = match layer {
        Value::Str(_) => return Ok(()),
        Value::List(items) | Value::Tuple(items) => items,
        other => {
            return Err(Error::ConfigFormat(format!(
                "invalid layer {:?}, should be str or list",
                other
            )))
        }
    };
    match items.len() {
        0 | 1 => Err(Error::ConfigFormat(format!(
            "layer should have at least two items {:?}",
            layer
        ))),
        2 => Ok(()),
        3 if matches!(items[2], Value::List(_) | Value::Tuple(_) | Value::Dict(_)) => Ok(()),
        3 => Err(Error::ConfigFormat(format!(
            "layer should have list/tuple/dict as third item {:?}",
            layer
        ))),
        4 if matches!(items[2], Value::List(_) | Value::Tuple(_))
            && matches!(items[3], Value::Dict(_)) =>
        {
            Ok(())
        }
        4 => Err(Error::ConfigFormat(format!(
            "layer should have list args and dict kwargs {:?}",
            layer
        ))),
        _ => Err(Error::ConfigFormat(format!(
            "layer should have at most four items {:?}",
            layer
        ))),
    }
}

fn check_layers(layers: &Value) -> Result<&[Value]> {
    let items = match layers {
        Value::List(items) | Value::Tuple(items) => items,
        other => {
            return Err(Error::ConfigFormat(format!(
                "invalid layers {:?}, should be a list of str/list",
                other
            )))
        }
    };
    for layer in items {
        check_layer(layer)?;
    }
    Ok(items)
}

fn is_layer_list(value: &Value) -> bool {
    value
        .as_seq()
        .is_some_and(|items| items.iter().all(|i| matches!(i, Value::List(_) | Value::Tuple(_))))
}

/// Evaluate string entries, splicing multi-layer results in place.
fn expand_layers(layers: &[Value], env: &Env) -> Result<Vec<Value>> {
    let mut expanded = Vec::with_capacity(layers.len());
    for layer in layers {
        let Value::Str(src) = layer else {
            expanded.push(layer.clone());
            continue;
        };
        let parsed = eval_string(src, env)?;
        let parsed = if is_layer_list(&parsed) {
            parsed
        } else {
            Value::List(vec![parsed])
        };
        for item in check_layers(&parsed)? {
            if matches!(item, Value::Str(_)) {
                return Err(Error::ConfigFormat(format!(
                    "layer expression {:?} should evaluate to layers, got a string",
                    src
                )));
            }
            expanded.push(item.clone());
        }
    }
    Ok(expanded)
}

/// Resolve a layer's module field into a builder. Plain callables become
/// non-persistent function modules.
pub fn parse_module(module: &Value, env: &Env) -> Result<Arc<dyn ModuleBuilder>> {
    let resolved = resolve_value(module, env)?;
    match resolved {
        Value::Builder(b) => Ok(b),
        Value::Function(f) => Ok(Arc::new(FunctionBuilder::new(f))),
        other => Err(Error::ConfigFormat(format!(
            "invalid module {:?}, should be a module or a callable",
            other
        ))),
    }
}

/// Evaluate top-level string arguments.
pub fn parse_args(args: &[Value], env: &Env) -> Result<Vec<Value>> {
    args.iter().map(|a| resolve_value(a, env)).collect()
}

/// Evaluate top-level string keyword values; keys must be strings.
pub fn parse_kwargs(kwargs: &Value, env: &Env) -> Result<Kwargs> {
    let Value::Dict(d) = kwargs else {
        return Err(Error::ConfigFormat(format!(
            "invalid kwargs {:?}, should be a mapping",
            kwargs
        )));
    };
    d.iter()
        .map(|(k, v)| match k {
            DictKey::Str(name) => Ok((name.clone(), resolve_value(v, env)?)),
            other => Err(Error::ConfigFormat(format!(
                "invalid kwarg name {}, should be str",
                other
            ))),
        })
        .collect()
}

fn parse_layer(items: &[Value], env: &Env) -> Result<Layer> {
    let empty = Value::Dict(Default::default());
    let no_args: &[Value] = &[];
    let (args, kwargs): (&[Value], &Value) = match items {
        [_, _] => (no_args, &empty),
        [_, _, Value::List(a) | Value::Tuple(a)] => (a.as_slice(), &empty),
        [_, _, k @ Value::Dict(_)] => (no_args, k),
        [_, _, Value::List(a) | Value::Tuple(a), k] => (a.as_slice(), k),
        _ => {
            return Err(Error::ConfigFormat(format!(
                "invalid layer format {:?}",
                items
            )))
        }
    };
    Ok(Layer {
        from: parse_from(&items[0], env)?,
        module: parse_module(&items[1], env)?,
        args: parse_args(args, env)?,
        kwargs: parse_kwargs(kwargs, env)?,
    })
}

/// Parse and resolve a config's layer list against `env`.
pub fn parse_layers(layers: &Value, env: &Env) -> Result<Vec<Layer>> {
    let raw = check_layers(layers)?;
    let expanded = expand_layers(raw, env)?;
    expanded
        .iter()
        .map(|layer| match layer {
            Value::List(items) | Value::Tuple(items) => parse_layer(items, env),
            other => Err(Error::ConfigFormat(format!("invalid layer {:?}", other))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::merge_envs;
    use crate::core::registry::Registry;
    use crate::core::types::{LayerFrom, Selector};

    fn yaml(src: &str) -> Value {
        Value::from_yaml(&serde_yaml_ng::from_str(src).unwrap()).unwrap()
    }

    fn nn_env() -> Env {
        merge_envs([&Registry::new().env(), &crate::nn::namespace().members])
    }

    #[test]
    fn test_nf009_layer_forms() {
        let env = nn_env();
        let layers = parse_layers(
            &yaml(
                "[[-1, Linear, [4, 8]], [-1, ReLU], [-1, Linear, {in_features: 8, out_features: 2}], \
                 [-1, Linear, [2, 2], {bias: false}]]",
            ),
            &env,
        )
        .unwrap();
        assert_eq!(layers.len(), 4);
        assert_eq!(layers[0].args, vec![Value::Int(4), Value::Int(8)]);
        assert!(layers[1].args.is_empty());
        assert_eq!(layers[2].kwargs["out_features"], Value::Int(2));
        assert_eq!(layers[3].kwargs["bias"], Value::Bool(false));
        assert_eq!(layers[0].from, LayerFrom::Refs(vec![(-1, Selector::All)]));
        assert_eq!(layers[0].module.name(), "Linear");
    }

    #[test]
    fn test_nf009_args_evaluated() {
        let mut env = nn_env();
        env.insert("width".into(), Value::Int(16));
        let layers =
            parse_layers(&yaml("[[-1, Linear, [width, 'width * 2', '~width']]]"), &env).unwrap();
        assert_eq!(
            layers[0].args,
            vec![Value::Int(16), Value::Int(32), Value::from("width")]
        );
    }

    #[test]
    fn test_nf009_string_layers_splice() {
        let mut env = nn_env();
        env.insert(
            "block".into(),
            yaml("[[-1, Linear, [4, 4]], [-1, ReLU]]"),
        );
        let layers = parse_layers(&yaml("[block, [-1, Sigmoid], '[-1, Identity]']"), &env).unwrap();
        let names: Vec<_> = layers.iter().map(|l| l.module.name().to_string()).collect();
        assert_eq!(names, vec!["Linear", "ReLU", "Sigmoid", "Identity"]);
    }

    #[test]
    fn test_nf009_function_module() {
        let env = nn_env();
        let layers = parse_layers(&yaml("[[-1, 'lambda x: x * 2']]"), &env).unwrap();
        assert_eq!(layers[0].module.name(), "<lambda>");
    }

    #[test]
    fn test_nf009_malformed() {
        let env = nn_env();
        for src in [
            "[[-1]]",
            "[[-1, ReLU, 3]]",
            "[[-1, ReLU, [], [], []]]",
            "[[-1, ReLU, {}, {}]]",
            "[[-1, 3]]",
            "[[-1, '~ReLU']]",
            "[[-1, ReLU, [], {1: 2}]]",
            "[5]",
            "layers",
        ] {
            assert!(
                matches!(parse_layers(&yaml(src), &env), Err(Error::ConfigFormat(_))),
                "{} should be rejected",
                src
            );
        }
        assert!(matches!(
            parse_layers(&yaml("[[-1, Conv2d]]"), &env),
            Err(Error::Resolution(_))
        ));
    }
}
