//! NF-002: Dynamic values flowing through environments and forward passes.
//!
//! Config primitives (YAML scalars, sequences, mappings) lower into [`Value`],
//! and expressions evaluate to it. Constructors, callables and import
//! namespaces are values too, so a layer's `module` field can be looked up
//! by name in the same environment as its arguments.

use super::error::{Error, Result};
use crate::graph::module::ModuleBuilder;
use crate::nn::tensor::Tensor;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Name → value scope used to resolve expressions and module lookups.
pub type Env = IndexMap<String, Value>;

/// Keyword arguments, in call-site order.
pub type Kwargs = IndexMap<String, Value>;

/// Mapping key. Layer references key their mappings by integer index, so
/// keys are not restricted to strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl DictKey {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::Int(*i),
            Self::Bool(b) => Value::Bool(*b),
            Self::Str(s) => Value::Str(s.clone()),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(Self::Int(*i)),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Str(s) => Ok(Self::Str(s.clone())),
            other => Err(Error::Resolution(format!(
                "unhashable mapping key of type {}",
                other.type_name()
            ))),
        }
    }
}

impl fmt::Display for DictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

/// A callable value: allow-listed builtins, host functions, converters and
/// lambdas written in config expressions.
pub trait Function: Send + Sync {
    fn name(&self) -> &str;

    fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value>;
}

type NativeFn = dyn Fn(Vec<Value>, Kwargs) -> Result<Value> + Send + Sync;

/// A host-provided function.
pub struct NativeFunction {
    name: String,
    func: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(Vec<Value>, Kwargs) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    /// Wrap straight into a [`Value::Function`].
    pub fn value(
        name: impl Into<String>,
        func: impl Fn(Vec<Value>, Kwargs) -> Result<Value> + Send + Sync + 'static,
    ) -> Value {
        Value::Function(Arc::new(Self::new(name, func)))
    }
}

impl Function for NativeFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        (self.func)(args, kwargs)
    }
}

/// A named group of values bound by an import statement (`import nn`).
#[derive(Debug, Clone)]
pub struct Namespace {
    pub name: String,
    pub members: Env,
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(IndexMap<DictKey, Value>),
    Tensor(Tensor),
    Builder(Arc<dyn ModuleBuilder>),
    Function(Arc<dyn Function>),
    Namespace(Arc<Namespace>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Tensor(_) => "tensor",
            Self::Builder(_) => "module",
            Self::Function(_) => "function",
            Self::Namespace(_) => "namespace",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(v) | Self::Tuple(v) => !v.is_empty(),
            Self::Dict(d) => !d.is_empty(),
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list or tuple.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) | Self::Tuple(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&IndexMap<DictKey, Value>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a string key in a mapping value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()
            .and_then(|d| d.get(&DictKey::Str(key.to_string())))
    }

    /// Index into a list/tuple with Python-style negative indices.
    pub fn index(&self, index: i64) -> Result<Value> {
        let items = self.as_seq().ok_or_else(|| {
            Error::Index(format!("{} is not indexable by position", self.type_name()))
        })?;
        let len = items.len() as i64;
        let pos = if index < 0 { len + index } else { index };
        if pos < 0 || pos >= len {
            return Err(Error::Index(format!(
                "index {} out of range for length {}",
                index, len
            )));
        }
        Ok(items[pos as usize].clone())
    }

    /// Lower a YAML document node. Tagged nodes have no counterpart.
    pub fn from_yaml(yaml: &serde_yaml_ng::Value) -> Result<Self> {
        use serde_yaml_ng::Value as Y;
        Ok(match yaml {
            Y::Null => Self::None,
            Y::Bool(b) => Self::Bool(*b),
            Y::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Y::String(s) => Self::Str(s.clone()),
            Y::Sequence(items) => Self::List(
                items
                    .iter()
                    .map(Self::from_yaml)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Y::Mapping(map) => {
                let mut dict = IndexMap::new();
                for (k, v) in map {
                    let key = DictKey::from_value(&Self::from_yaml(k)?).map_err(|_| {
                        Error::ConfigFormat(format!("unsupported mapping key {:?}", k))
                    })?;
                    dict.insert(key, Self::from_yaml(v)?);
                }
                Self::Dict(dict)
            }
            Y::Tagged(tagged) => {
                return Err(Error::ConfigFormat(format!(
                    "tagged YAML values are not supported: {}",
                    tagged.tag
                )))
            }
        })
    }

    /// Build a string-keyed mapping value.
    pub fn dict<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (DictKey::Str(k.into()), v))
                .collect(),
        )
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Int(_) | Self::Float(_), Self::Int(_) | Self::Float(_)) => {
                self.as_float() == other.as_float()
            }
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) | (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (Self::Tensor(a), Self::Tensor(b)) => a == b,
            (Self::Builder(a), Self::Builder(b)) => Arc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            (Self::Namespace(a), Self::Namespace(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{:?}", item)?;
    }
    Ok(())
}

/// Debug renders the config-expression spelling of a value (strings quoted).
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "'{}'", s),
            Self::List(items) => {
                write!(f, "[")?;
                write_items(f, items)?;
                write!(f, "]")
            }
            Self::Tuple(items) => {
                write!(f, "(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Self::Dict(d) => {
                write!(f, "{{")?;
                for (i, (k, v)) in d.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {:?}", k.to_value(), v)?;
                }
                write!(f, "}}")
            }
            other => write!(f, "{}", other),
        }
    }
}

/// Display is the `str()` spelling: strings unquoted, containers as Debug.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{:?}", x),
            Self::Str(s) => write!(f, "{}", s),
            Self::List(_) | Self::Tuple(_) | Self::Dict(_) => write!(f, "{:?}", self),
            Self::Tensor(t) => write!(f, "{}", t),
            Self::Builder(b) => write!(f, "<module {}>", b.name()),
            Self::Function(func) => write!(f, "<function {}>", func.name()),
            Self::Namespace(ns) => write!(f, "<namespace {}>", ns.name),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<Tensor> for Value {
    fn from(v: Tensor) -> Self {
        Self::Tensor(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nf002_from_yaml_layer() {
        let yaml: serde_yaml_ng::Value =
            serde_yaml_ng::from_str("[-1, Linear, [4, 8], {bias: false}]").unwrap();
        let v = Value::from_yaml(&yaml).unwrap();
        let items = v.as_seq().unwrap();
        assert_eq!(items[0], Value::Int(-1));
        assert_eq!(items[1], Value::from("Linear"));
        assert_eq!(items[2], Value::List(vec![4.into(), 8.into()]));
        assert_eq!(items[3].get("bias"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_nf002_from_yaml_int_keys() {
        let yaml: serde_yaml_ng::Value = serde_yaml_ng::from_str("{1: 0}").unwrap();
        let v = Value::from_yaml(&yaml).unwrap();
        let d = v.as_dict().unwrap();
        assert_eq!(d.get(&DictKey::Int(1)), Some(&Value::Int(0)));
    }

    #[test]
    fn test_nf002_from_yaml_rejects_tags() {
        let yaml: serde_yaml_ng::Value = serde_yaml_ng::from_str("!weird 3").unwrap();
        assert!(matches!(
            Value::from_yaml(&yaml),
            Err(Error::ConfigFormat(_))
        ));
    }

    #[test]
    fn test_nf002_negative_index() {
        let v = Value::Tuple(vec![1.into(), 2.into(), 3.into()]);
        assert_eq!(v.index(-1).unwrap(), Value::Int(3));
        assert!(matches!(v.index(3), Err(Error::Index(_))));
        assert!(Value::Int(1).index(0).is_err());
    }

    #[test]
    fn test_nf002_numeric_equality() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Bool(true), Value::Int(1));
    }

    #[test]
    fn test_nf002_repr() {
        let v = Value::List(vec![
            Value::Int(1),
            Value::from("a"),
            Value::Tuple(vec![Value::Float(0.5)]),
            Value::None,
        ]);
        assert_eq!(format!("{:?}", v), "[1, 'a', (0.5,), None]");
        assert_eq!(Value::from("a").to_string(), "a");
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
    }

    #[test]
    fn test_nf002_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(!Value::Int(0).is_truthy());
    }

    #[test]
    fn test_nf002_native_function() {
        let f = NativeFunction::value("double", |args, _| {
            Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2))
        });
        let Value::Function(func) = f else {
            panic!("expected function");
        };
        assert_eq!(func.name(), "double");
        assert_eq!(func.call(vec![Value::Int(4)], Kwargs::new()).unwrap(), Value::Int(8));
    }
}
