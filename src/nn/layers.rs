//! NF-021: Reference modules.
//!
//! Small stand-ins for a tensor library's layer set, enough to wire and
//! run real graphs: parameterized (`Linear`), activations, and the
//! multi-input combinators (`Add`, `Mul`, `Concat`).

use super::tensor::{checked_numel, Tensor};
use crate::core::args::resolve_params;
use crate::core::error::{Error, Result};
use crate::core::expr::{binary, BinOp};
use crate::core::types::ParamDecl;
use crate::core::value::{Env, Kwargs, Value};
use crate::graph::module::{auto_unpack, replace_tensor, Module, StateDict};

/// Bind constructor arguments against a fixed signature.
pub(crate) fn signature(
    decls: &[ParamDecl],
    args: &[Value],
    kwargs: &Kwargs,
    module: &str,
) -> Result<Env> {
    resolve_params(decls, args, kwargs).map_err(|e| match e {
        Error::Arity(msg) => Error::Arity(format!("{}(): {}", module, msg)),
        other => other,
    })
}

fn usize_arg(env: &Env, name: &str, module: &str) -> Result<usize> {
    match env.get(name) {
        Some(Value::Int(i)) if *i > 0 => Ok(*i as usize),
        other => Err(Error::ConfigFormat(format!(
            "{}(): {} should be a positive int, got {:?}",
            module,
            name,
            other.cloned().unwrap_or_default()
        ))),
    }
}

fn int_arg(env: &Env, name: &str, module: &str) -> Result<i64> {
    match env.get(name) {
        Some(Value::Int(i)) => Ok(*i),
        other => Err(Error::ConfigFormat(format!(
            "{}(): {} should be an int, got {:?}",
            module,
            name,
            other.cloned().unwrap_or_default()
        ))),
    }
}

fn bool_arg(env: &Env, name: &str, module: &str) -> Result<bool> {
    match env.get(name) {
        Some(Value::Bool(b)) => Ok(*b),
        other => Err(Error::ConfigFormat(format!(
            "{}(): {} should be a bool, got {:?}",
            module,
            name,
            other.cloned().unwrap_or_default()
        ))),
    }
}

fn no_params(module: &str, args: &[Value], kwargs: &Kwargs) -> Result<()> {
    signature(&[], args, kwargs, module).map(|_| ())
}

fn one_tensor(module: &str, mut inputs: Vec<Value>) -> Result<Tensor> {
    match (inputs.len(), inputs.pop()) {
        (1, Some(Value::Tensor(t))) => Ok(t),
        (1, Some(other)) => Err(Error::Forward(format!(
            "{} expects a tensor, got {}",
            module,
            other.type_name()
        ))),
        (n, _) => Err(Error::Forward(format!(
            "{} expects one input, got {}",
            module, n
        ))),
    }
}

fn py_bool(b: bool) -> &'static str {
    if b {
        "True"
    } else {
        "False"
    }
}

// ============================================================================
// Linear
// ============================================================================

/// `y = x W^T + b` over the last dimension. Parameters start at zero.
pub struct Linear {
    in_features: usize,
    out_features: usize,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        Self {
            in_features,
            out_features,
            weight: Tensor::zeros(&[out_features, in_features]),
            bias: bias.then(|| Tensor::zeros(&[out_features])),
        }
    }

    pub fn build(args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
        let decls = [
            ParamDecl::Required("in_features".into()),
            ParamDecl::Required("out_features".into()),
            ParamDecl::Optional("bias".into(), Value::Bool(true)),
        ];
        let env = signature(&decls, &args, &kwargs, "Linear")?;
        let in_features = usize_arg(&env, "in_features", "Linear")?;
        let out_features = usize_arg(&env, "out_features", "Linear")?;
        if checked_numel(&[out_features, in_features]).is_none() {
            return Err(Error::ConfigFormat(format!(
                "Linear(): weight [{}, {}] is too large",
                out_features, in_features
            )));
        }
        Ok(Box::new(Self::new(
            in_features,
            out_features,
            bool_arg(&env, "bias", "Linear")?,
        )))
    }
}

impl Module for Linear {
    fn type_name(&self) -> &str {
        "Linear"
    }

    fn extra_repr(&self) -> String {
        format!(
            "in_features={}, out_features={}, bias={}",
            self.in_features,
            self.out_features,
            py_bool(self.bias.is_some())
        )
    }

    fn forward(&self, inputs: Vec<Value>) -> Result<Value> {
        let x = one_tensor("Linear", inputs)?;
        if x.shape().last() != Some(&self.in_features) {
            return Err(Error::Forward(format!(
                "Linear expects last dimension {}, got shape {:?}",
                self.in_features,
                x.shape()
            )));
        }
        let rows = x.numel() / self.in_features;
        let w = self.weight.data();
        let mut data = Vec::with_capacity(rows * self.out_features);
        for row in x.data().chunks(self.in_features) {
            for o in 0..self.out_features {
                let weights = &w[o * self.in_features..(o + 1) * self.in_features];
                let dot: f32 = row.iter().zip(weights).map(|(a, b)| a * b).sum();
                let b = self.bias.as_ref().map_or(0.0, |b| b.data()[o]);
                data.push(dot + b);
            }
        }
        let mut shape = x.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = self.out_features;
        }
        Ok(Value::Tensor(Tensor::from_vec(&shape, data)?))
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("weight".into(), self.weight.clone());
        if let Some(b) = &self.bias {
            state.insert("bias".into(), b.clone());
        }
        state
    }

    fn load_tensor(&mut self, key: &str, tensor: Tensor) -> Result<()> {
        match (key, self.bias.as_mut()) {
            ("weight", _) => replace_tensor(&mut self.weight, "Linear", key, tensor),
            ("bias", Some(b)) => replace_tensor(b, "Linear", key, tensor),
            _ => Err(Error::State(format!("unexpected key '{}' for Linear", key))),
        }
    }
}

// ============================================================================
// Activations
// ============================================================================

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Apply a scalar activation to a tensor or a number.
pub fn activate(name: &str, value: &Value, f: fn(f32) -> f32) -> Result<Value> {
    match value {
        Value::Tensor(t) => Ok(Value::Tensor(t.map(f))),
        Value::Int(_) | Value::Float(_) => {
            let x = value.as_float().unwrap_or_default() as f32;
            Ok(Value::Float(f(x) as f64))
        }
        other => Err(Error::Forward(format!(
            "{} expects a tensor or number, got {}",
            name,
            other.type_name()
        ))),
    }
}

/// Parameterless elementwise module.
pub struct Activation {
    name: &'static str,
    f: fn(f32) -> f32,
}

impl Activation {
    pub fn relu() -> Self {
        Self { name: "ReLU", f: relu }
    }

    pub fn sigmoid() -> Self {
        Self {
            name: "Sigmoid",
            f: sigmoid,
        }
    }
}

impl Module for Activation {
    fn type_name(&self) -> &str {
        self.name
    }

    fn forward(&self, inputs: Vec<Value>) -> Result<Value> {
        let x = one_tensor(self.name, inputs)?;
        Ok(Value::Tensor(x.map(self.f)))
    }
}

pub fn build_relu(args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
    no_params("ReLU", &args, &kwargs)?;
    Ok(Box::new(Activation::relu()))
}

pub fn build_sigmoid(args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
    no_params("Sigmoid", &args, &kwargs)?;
    Ok(Box::new(Activation::sigmoid()))
}

// ============================================================================
// Structural
// ============================================================================

/// Passes its input through unchanged; several inputs become a tuple.
pub struct Identity;

impl Identity {
    pub fn build(args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
        // Accepts and ignores any arguments.
        let _ = (args, kwargs);
        Ok(Box::new(Self))
    }
}

impl Module for Identity {
    fn type_name(&self) -> &str {
        "Identity"
    }

    fn forward(&self, inputs: Vec<Value>) -> Result<Value> {
        Ok(auto_unpack(inputs))
    }
}

/// Folds all inputs with one arithmetic operator (`Add`, `Mul`).
pub struct Reduce {
    name: &'static str,
    op: BinOp,
}

impl Reduce {
    pub fn build_add(args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
        no_params("Add", &args, &kwargs)?;
        Ok(Box::new(Self {
            name: "Add",
            op: BinOp::Add,
        }))
    }

    pub fn build_mul(args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
        no_params("Mul", &args, &kwargs)?;
        Ok(Box::new(Self {
            name: "Mul",
            op: BinOp::Mul,
        }))
    }
}

impl Module for Reduce {
    fn type_name(&self) -> &str {
        self.name
    }

    fn forward(&self, inputs: Vec<Value>) -> Result<Value> {
        let mut iter = inputs.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| Error::Forward(format!("{} expects at least one input", self.name)))?;
        iter.try_fold(first, |acc, v| {
            binary(self.op, &acc, &v).map_err(|e| Error::Forward(format!("{}: {}", self.name, e)))
        })
    }
}

/// Concatenates tensor inputs along `dim`. A single list or tuple input is
/// unpacked first.
pub struct Concat {
    dim: i64,
}

impl Concat {
    pub fn build(args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
        let decls = [ParamDecl::Optional("dim".into(), Value::Int(1))];
        let env = signature(&decls, &args, &kwargs, "Concat")?;
        Ok(Box::new(Self {
            dim: int_arg(&env, "dim", "Concat")?,
        }))
    }
}

impl Module for Concat {
    fn type_name(&self) -> &str {
        "Concat"
    }

    fn extra_repr(&self) -> String {
        format!("dim={}", self.dim)
    }

    fn forward(&self, inputs: Vec<Value>) -> Result<Value> {
        let inputs = match inputs.as_slice() {
            [Value::List(items) | Value::Tuple(items)] => items.clone(),
            _ => inputs,
        };
        let tensors = inputs
            .iter()
            .map(|v| match v {
                Value::Tensor(t) => Ok(t),
                other => Err(Error::Forward(format!(
                    "Concat expects tensors, got {}",
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Tensor(Tensor::concat(&tensors, self.dim)?))
    }
}

/// Collapses dimensions from `start_dim` onward.
pub struct Flatten {
    start_dim: i64,
}

impl Flatten {
    pub fn build(args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
        let decls = [ParamDecl::Optional("start_dim".into(), Value::Int(1))];
        let env = signature(&decls, &args, &kwargs, "Flatten")?;
        Ok(Box::new(Self {
            start_dim: int_arg(&env, "start_dim", "Flatten")?,
        }))
    }
}

impl Module for Flatten {
    fn type_name(&self) -> &str {
        "Flatten"
    }

    fn extra_repr(&self) -> String {
        format!("start_dim={}, end_dim=-1", self.start_dim)
    }

    fn forward(&self, inputs: Vec<Value>) -> Result<Value> {
        let x = one_tensor("Flatten", inputs)?;
        let start = x.axis(self.start_dim)?;
        let mut shape = x.shape()[..start].to_vec();
        shape.push(x.shape()[start..].iter().product());
        Ok(Value::Tensor(x.reshape(&shape)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(pairs: &[(&str, Value)]) -> Kwargs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_nf021_linear_signature() {
        let m = Linear::build(vec![Value::Int(4), Value::Int(8)], Kwargs::new()).unwrap();
        assert_eq!(m.describe(), "Linear(in_features=4, out_features=8, bias=True)");
        let m = Linear::build(
            vec![Value::Int(4)],
            kw(&[("out_features", Value::Int(2)), ("bias", Value::Bool(false))]),
        )
        .unwrap();
        assert_eq!(m.describe(), "Linear(in_features=4, out_features=2, bias=False)");
        let keys: Vec<_> = m.state_dict().keys().cloned().collect();
        assert_eq!(keys, vec!["weight"]);

        assert!(matches!(
            Linear::build(vec![Value::Int(4)], Kwargs::new()),
            Err(Error::Arity(_))
        ));
        assert!(matches!(
            Linear::build(vec![Value::Int(4), Value::from("8")], Kwargs::new()),
            Err(Error::ConfigFormat(_))
        ));
        assert!(matches!(
            Linear::build(
                vec![Value::Int(4_294_967_296), Value::Int(4_294_967_296)],
                Kwargs::new()
            ),
            Err(Error::ConfigFormat(_))
        ));
    }

    #[test]
    fn test_nf021_linear_forward() {
        let mut m = Linear::new(2, 1, true);
        m.load_tensor("weight", Tensor::from_vec(&[1, 2], vec![1.0, 2.0]).unwrap())
            .unwrap();
        m.load_tensor("bias", Tensor::ones(&[1])).unwrap();
        let x = Tensor::from_vec(&[2, 2], vec![1.0, 1.0, 3.0, -1.0]).unwrap();
        let Value::Tensor(y) = m.forward(vec![Value::Tensor(x)]).unwrap() else {
            panic!("expected tensor");
        };
        assert_eq!(y.shape(), &[2, 1]);
        assert_eq!(y.data(), &[4.0, 2.0]);

        assert!(matches!(
            m.forward(vec![Value::Tensor(Tensor::zeros(&[1, 3]))]),
            Err(Error::Forward(_))
        ));
        assert!(matches!(
            m.load_tensor("weight", Tensor::zeros(&[2, 2])),
            Err(Error::State(_))
        ));
    }

    #[test]
    fn test_nf021_activations() {
        let x = Tensor::from_vec(&[3], vec![-1.0, 0.0, 2.0]).unwrap();
        let Value::Tensor(y) = Activation::relu().forward(vec![Value::Tensor(x)]).unwrap() else {
            panic!("expected tensor");
        };
        assert_eq!(y.data(), &[0.0, 0.0, 2.0]);
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(build_relu(vec![Value::Int(1)], Kwargs::new()).is_err());
        assert_eq!(activate("relu", &Value::Int(-3), relu).unwrap(), Value::Float(0.0));
    }

    #[test]
    fn test_nf021_reduce_and_concat() {
        let add = Reduce::build_add(vec![], Kwargs::new()).unwrap();
        let out = add
            .forward(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
            .unwrap();
        assert_eq!(out, Value::Int(6));
        assert!(matches!(add.forward(vec![]), Err(Error::Forward(_))));
        assert!(matches!(
            add.forward(vec![Value::Int(1), Value::from("a")]),
            Err(Error::Forward(_))
        ));

        let cat = Concat::build(vec![], kw(&[("dim", Value::Int(-1))])).unwrap();
        let pair = Value::Tuple(vec![
            Value::Tensor(Tensor::zeros(&[2, 1])),
            Value::Tensor(Tensor::zeros(&[2, 3])),
        ]);
        let Value::Tensor(y) = cat.forward(vec![pair]).unwrap() else {
            panic!("expected tensor");
        };
        assert_eq!(y.shape(), &[2, 4]);
        assert_eq!(cat.describe(), "Concat(dim=-1)");
    }

    #[test]
    fn test_nf021_flatten() {
        let m = Flatten::build(vec![], Kwargs::new()).unwrap();
        let Value::Tensor(y) = m.forward(vec![Value::Tensor(Tensor::zeros(&[2, 3, 4]))]).unwrap()
        else {
            panic!("expected tensor");
        };
        assert_eq!(y.shape(), &[2, 12]);
    }
}
