//! NF-010: Module and builder traits.
//!
//! A [`ModuleBuilder`] is what a layer's `module` field resolves to; the
//! pipeline calls `build(args, kwargs)` once per layer and owns the
//! resulting [`Module`]. Four builder kinds exist:
//!
//! - [`NativeBuilder`]: a plain constructor (the `nn` set, host modules)
//! - [`FunctionBuilder`]: wraps a callable as a non-persistent module
//! - [`SharedBuilder`]: hands out one pre-built instance to every layer
//! - [`BoundBuilder`]: another builder with some arguments already bound
//!
//! Config-defined modules ([`crate::core::config::LazyModule`]) are a fifth.

use crate::core::error::{Error, Result};
use crate::core::registry::Registry;
use crate::core::value::{Function, Kwargs, Value};
use crate::graph::pipeline::PipelineModule;
use crate::nn::tensor::Tensor;
use indexmap::IndexMap;
use std::sync::{Arc, RwLock};

/// Ordered parameter/buffer tensors keyed by dotted path.
pub type StateDict = IndexMap<String, Tensor>;

/// An instantiated graph node.
pub trait Module: Send + Sync {
    /// Name shown in summaries, e.g. `Linear`.
    fn type_name(&self) -> &str;

    /// Constructor arguments shown inside the parentheses of a summary.
    fn extra_repr(&self) -> String {
        String::new()
    }

    fn forward(&self, inputs: Vec<Value>) -> Result<Value>;

    /// Whether the module is registered for persistence. Function modules
    /// carry no state and are not.
    fn is_persistent(&self) -> bool {
        true
    }

    /// Identity of the underlying instance. Modules reporting the same key
    /// are registered once.
    fn instance_key(&self) -> Option<usize> {
        None
    }

    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }

    /// Replace one named tensor. The shape must match the current one.
    fn load_tensor(&mut self, key: &str, _tensor: Tensor) -> Result<()> {
        Err(Error::State(format!(
            "unexpected key '{}' for {}",
            key,
            self.type_name()
        )))
    }

    /// Finalize pending drops in this module and everything it owns.
    /// Only pipelines have any.
    fn finalize_drops(&mut self, _resort: bool) {}

    /// The state dict after [`finalize_drops`](Self::finalize_drops),
    /// computed without mutating anything.
    fn finalized_state_dict(&self, _resort: bool) -> StateDict {
        self.state_dict()
    }

    fn as_pipeline(&self) -> Option<&PipelineModule> {
        None
    }

    fn as_pipeline_mut(&mut self) -> Option<&mut PipelineModule> {
        None
    }

    /// One-node summary, e.g. `Linear(in_features=4, out_features=8, bias=True)`.
    fn describe(&self) -> String {
        format!("{}({})", self.type_name(), self.extra_repr())
    }
}

/// Constructs modules from resolved layer arguments.
pub trait ModuleBuilder: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, registry: &Registry, args: Vec<Value>, kwargs: Kwargs)
        -> Result<Box<dyn Module>>;
}

/// Collapse a single value out of an argument list, otherwise a tuple.
pub fn auto_unpack(mut values: Vec<Value>) -> Value {
    if values.len() == 1 {
        values.pop().unwrap_or_default()
    } else {
        Value::Tuple(values)
    }
}

/// Shared check for a module's tensor replacement.
pub fn replace_tensor(slot: &mut Tensor, owner: &str, key: &str, tensor: Tensor) -> Result<()> {
    if slot.shape() != tensor.shape() {
        return Err(Error::State(format!(
            "size mismatch for {}.{}: expected {:?}, got {:?}",
            owner,
            key,
            slot.shape(),
            tensor.shape()
        )));
    }
    *slot = tensor;
    Ok(())
}

// ============================================================================
// Native constructors
// ============================================================================

type Ctor = dyn Fn(Vec<Value>, Kwargs) -> Result<Box<dyn Module>> + Send + Sync;

/// A constructor implemented in Rust.
pub struct NativeBuilder {
    name: String,
    ctor: Box<Ctor>,
}

impl NativeBuilder {
    pub fn new(
        name: impl Into<String>,
        ctor: impl Fn(Vec<Value>, Kwargs) -> Result<Box<dyn Module>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            ctor: Box::new(ctor),
        }
    }
}

impl ModuleBuilder for NativeBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, _: &Registry, args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
        (self.ctor)(args, kwargs)
    }
}

// ============================================================================
// Function modules
// ============================================================================

/// Wraps a callable; each layer binds its own trailing args and kwargs.
pub struct FunctionBuilder {
    func: Arc<dyn Function>,
}

impl FunctionBuilder {
    pub fn new(func: Arc<dyn Function>) -> Self {
        Self { func }
    }
}

impl ModuleBuilder for FunctionBuilder {
    fn name(&self) -> &str {
        self.func.name()
    }

    fn build(&self, _: &Registry, args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
        Ok(Box::new(FunctionModule {
            func: Arc::clone(&self.func),
            args,
            kwargs,
        }))
    }
}

/// Calls `func(*inputs, *args, **kwargs)` on every forward pass.
pub struct FunctionModule {
    func: Arc<dyn Function>,
    args: Vec<Value>,
    kwargs: Kwargs,
}

impl Module for FunctionModule {
    fn type_name(&self) -> &str {
        self.func.name()
    }

    fn forward(&self, mut inputs: Vec<Value>) -> Result<Value> {
        inputs.extend(self.args.iter().cloned());
        self.func.call(inputs, self.kwargs.clone())
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("Function({})", self.func.name())
    }
}

// ============================================================================
// Shared instances
// ============================================================================

/// One pre-built module handed to every layer that names it. Loading state
/// through any handle updates all of them.
pub struct SharedBuilder {
    name: String,
    module: Arc<RwLock<Box<dyn Module>>>,
}

impl SharedBuilder {
    pub fn new(module: Box<dyn Module>) -> Self {
        Self {
            name: module.type_name().to_string(),
            module: Arc::new(RwLock::new(module)),
        }
    }
}

impl ModuleBuilder for SharedBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, _: &Registry, args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
        if !args.is_empty() || !kwargs.is_empty() {
            return Err(Error::Arity(format!(
                "shared module {} is already built and takes no arguments",
                self.name
            )));
        }
        Ok(Box::new(SharedModule {
            name: self.name.clone(),
            module: Arc::clone(&self.module),
        }))
    }
}

pub struct SharedModule {
    name: String,
    module: Arc<RwLock<Box<dyn Module>>>,
}

impl SharedModule {
    fn poisoned(&self) -> Error {
        Error::Forward(format!("shared module {} is poisoned", self.name))
    }
}

impl Module for SharedModule {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn extra_repr(&self) -> String {
        self.module
            .read()
            .map(|m| m.extra_repr())
            .unwrap_or_default()
    }

    fn forward(&self, inputs: Vec<Value>) -> Result<Value> {
        self.module.read().map_err(|_| self.poisoned())?.forward(inputs)
    }

    fn is_persistent(&self) -> bool {
        self.module.read().map(|m| m.is_persistent()).unwrap_or(true)
    }

    fn instance_key(&self) -> Option<usize> {
        Some(Arc::as_ptr(&self.module) as *const () as usize)
    }

    fn state_dict(&self) -> StateDict {
        self.module
            .read()
            .map(|m| m.state_dict())
            .unwrap_or_default()
    }

    fn load_tensor(&mut self, key: &str, tensor: Tensor) -> Result<()> {
        let mut guard = self.module.write().map_err(|_| self.poisoned())?;
        guard.load_tensor(key, tensor)
    }

    fn finalize_drops(&mut self, resort: bool) {
        match self.module.write() {
            Ok(mut guard) => guard.finalize_drops(resort),
            Err(_) => log::warn!("shared module {} is poisoned, drops not finalized", self.name),
        }
    }

    fn finalized_state_dict(&self, resort: bool) -> StateDict {
        self.module
            .read()
            .map(|m| m.finalized_state_dict(resort))
            .unwrap_or_default()
    }

    fn describe(&self) -> String {
        self.module
            .read()
            .map(|m| m.describe())
            .unwrap_or_else(|_| format!("{}(<poisoned>)", self.name))
    }
}

// ============================================================================
// Partially applied builders
// ============================================================================

/// A builder with leading args and default kwargs bound, produced by
/// calling a module in an expression (`Linear(4, 8)`).
pub struct BoundBuilder {
    inner: Arc<dyn ModuleBuilder>,
    args: Vec<Value>,
    kwargs: Kwargs,
}

impl BoundBuilder {
    pub fn new(inner: Arc<dyn ModuleBuilder>, args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self {
            inner,
            args,
            kwargs,
        }
    }
}

impl ModuleBuilder for BoundBuilder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn build(
        &self,
        registry: &Registry,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Box<dyn Module>> {
        let mut all_args = self.args.clone();
        all_args.extend(args);
        let mut all_kwargs = self.kwargs.clone();
        all_kwargs.extend(kwargs);
        self.inner.build(registry, all_args, all_kwargs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::NativeFunction;
    use crate::nn::layers::Linear;

    fn double() -> Arc<dyn Function> {
        Arc::new(NativeFunction::new("double", |args, kwargs| {
            let scale = kwargs.get("scale").and_then(Value::as_int).unwrap_or(2);
            let extra = args.get(1).and_then(Value::as_int).unwrap_or(0);
            Ok(Value::Int(args[0].as_int().unwrap_or(0) * scale + extra))
        }))
    }

    #[test]
    fn test_nf010_auto_unpack() {
        assert_eq!(auto_unpack(vec![Value::Int(1)]), Value::Int(1));
        assert_eq!(
            auto_unpack(vec![Value::Int(1), Value::Int(2)]),
            Value::Tuple(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(auto_unpack(vec![]), Value::Tuple(vec![]));
    }

    #[test]
    fn test_nf010_function_module_binds_trailing_args() {
        let registry = Registry::new();
        let mut kwargs = Kwargs::new();
        kwargs.insert("scale".into(), Value::Int(10));
        let m = FunctionBuilder::new(double())
            .build(&registry, vec![Value::Int(3)], kwargs)
            .unwrap();
        assert!(!m.is_persistent());
        assert_eq!(m.forward(vec![Value::Int(4)]).unwrap(), Value::Int(43));
        assert_eq!(m.describe(), "Function(double)");
    }

    #[test]
    fn test_nf010_shared_same_instance() {
        let registry = Registry::new();
        let shared = SharedBuilder::new(Box::new(Linear::new(2, 2, true)));
        let a = shared.build(&registry, vec![], Kwargs::new()).unwrap();
        let mut b = shared.build(&registry, vec![], Kwargs::new()).unwrap();
        assert!(a.instance_key().is_some());
        assert_eq!(a.instance_key(), b.instance_key());

        b.load_tensor("bias", Tensor::ones(&[2])).unwrap();
        assert_eq!(a.state_dict()["bias"], Tensor::ones(&[2]));
        assert!(matches!(
            shared.build(&registry, vec![Value::Int(1)], Kwargs::new()),
            Err(Error::Arity(_))
        ));
    }

    #[test]
    fn test_nf010_bound_builder_prepends() {
        let registry = Registry::new();
        let linear = crate::nn::builder("Linear").unwrap();
        let bound = BoundBuilder::new(linear, vec![Value::Int(3)], Kwargs::new());
        let m = bound.build(&registry, vec![Value::Int(5)], Kwargs::new()).unwrap();
        assert_eq!(m.describe(), "Linear(in_features=3, out_features=5, bias=True)");
        assert_eq!(bound.name(), "Linear");
    }

    #[test]
    fn test_nf010_default_load_rejects() {
        let registry = Registry::new();
        let mut m = FunctionBuilder::new(double())
            .build(&registry, vec![], Kwargs::new())
            .unwrap();
        assert!(matches!(
            m.load_tensor("weight", Tensor::zeros(&[1])),
            Err(Error::State(_))
        ));
    }
}
