//! Built-in `nn` namespace: a dense tensor and a reference module set.

pub mod layers;
pub mod tensor;

use crate::core::value::{Env, Namespace, NativeFunction, Value};
use crate::graph::module::{ModuleBuilder, NativeBuilder};
use layers::{Concat, Flatten, Identity, Linear, Reduce};
use std::sync::Arc;

fn module(env: &mut Env, builder: NativeBuilder) {
    env.insert(builder.name().to_string(), Value::Builder(Arc::new(builder)));
}

fn activation(env: &mut Env, name: &'static str, f: fn(f32) -> f32) {
    let func = NativeFunction::value(name, move |args, _| match args.as_slice() {
        [x] => layers::activate(name, x, f),
        _ => Err(crate::core::error::Error::Arity(format!(
            "{}() takes exactly one argument ({} given)",
            name,
            args.len()
        ))),
    });
    env.insert(name.to_string(), func);
}

/// The namespace bound by `import nn`.
pub fn namespace() -> Arc<Namespace> {
    let mut members = Env::new();
    module(&mut members, NativeBuilder::new("Identity", Identity::build));
    module(&mut members, NativeBuilder::new("Linear", Linear::build));
    module(&mut members, NativeBuilder::new("ReLU", layers::build_relu));
    module(&mut members, NativeBuilder::new("Sigmoid", layers::build_sigmoid));
    module(&mut members, NativeBuilder::new("Add", Reduce::build_add));
    module(&mut members, NativeBuilder::new("Mul", Reduce::build_mul));
    module(&mut members, NativeBuilder::new("Concat", Concat::build));
    module(&mut members, NativeBuilder::new("Flatten", Flatten::build));
    activation(&mut members, "relu", layers::relu);
    activation(&mut members, "sigmoid", layers::sigmoid);
    Arc::new(Namespace {
        name: "nn".to_string(),
        members,
    })
}

/// Look up one `nn` module constructor.
pub fn builder(name: &str) -> Option<Arc<dyn ModuleBuilder>> {
    match namespace().members.get(name) {
        Some(Value::Builder(b)) => Some(Arc::clone(b)),
        _ => None,
    }
}
