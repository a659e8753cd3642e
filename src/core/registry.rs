//! NF-012: Module, converter and namespace registry.
//!
//! An explicit object passed to every resolution step. A registry may sit
//! on top of a parent: lookups try the built-ins, then local entries, then
//! the parent, so independent configs can share a base table without
//! colliding.

use super::error::{Error, Result};
use super::types::OUTPUT_MODULE;
use super::value::{Env, Function, Namespace, NativeFunction, Value};
use crate::graph::module::{auto_unpack, FunctionBuilder, ModuleBuilder};
use indexmap::IndexMap;
use log::debug;
use std::sync::Arc;

/// Names no registry may redefine.
const BUILTINS: &[&str] = &[OUTPUT_MODULE];

fn builtin(name: &str) -> Option<Arc<dyn ModuleBuilder>> {
    match name {
        OUTPUT_MODULE => {
            let output = NativeFunction::new(OUTPUT_MODULE, |args, _| Ok(auto_unpack(args)));
            Some(Arc::new(FunctionBuilder::new(Arc::new(output))))
        }
        _ => None,
    }
}

fn builtin_namespaces() -> IndexMap<String, Arc<Namespace>> {
    let nn = crate::nn::namespace();
    IndexMap::from([(nn.name.clone(), nn)])
}

pub struct Registry {
    modules: IndexMap<String, Arc<dyn ModuleBuilder>>,
    converters: IndexMap<String, Arc<dyn Function>>,
    namespaces: IndexMap<String, Arc<Namespace>>,
    parent: Option<Arc<Registry>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A root registry holding only the built-ins and the `nn` namespace.
    pub fn new() -> Self {
        Self {
            modules: IndexMap::new(),
            converters: IndexMap::new(),
            namespaces: builtin_namespaces(),
            parent: None,
        }
    }

    /// An empty layer over `parent`. Local names shadow the parent's.
    pub fn with_parent(parent: Arc<Registry>) -> Self {
        Self {
            modules: IndexMap::new(),
            converters: IndexMap::new(),
            namespaces: IndexMap::new(),
            parent: Some(parent),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, builder: Arc<dyn ModuleBuilder>) -> Result<()> {
        let name = name.into();
        if BUILTINS.contains(&name.as_str()) || self.modules.contains_key(&name) {
            return Err(Error::Registration(format!(
                "module {} is already registered",
                name
            )));
        }
        debug!("module {} registered", name);
        self.modules.insert(name, builder);
        Ok(())
    }

    /// Register under the builder's own name.
    pub fn register_module(&mut self, builder: Arc<dyn ModuleBuilder>) -> Result<()> {
        let name = builder.name().to_string();
        self.register(name, builder)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ModuleBuilder>> {
        self.lookup(name)
            .ok_or_else(|| Error::Registration(format!("module {} is not registered", name)))
    }

    pub fn has(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn ModuleBuilder>> {
        builtin(name)
            .or_else(|| self.modules.get(name).cloned())
            .or_else(|| self.parent.as_ref().and_then(|p| p.lookup(name)))
    }

    /// Register a converter under its own name.
    pub fn register_converter(&mut self, converter: Arc<dyn Function>) -> Result<()> {
        let name = converter.name().to_string();
        self.register_converter_as(name, converter)
    }

    pub fn register_converter_as(
        &mut self,
        name: impl Into<String>,
        converter: Arc<dyn Function>,
    ) -> Result<()> {
        let name = name.into();
        if self.converters.contains_key(&name) {
            return Err(Error::Registration(format!(
                "converter {} is already registered",
                name
            )));
        }
        debug!("converter {} registered", name);
        self.converters.insert(name, converter);
        Ok(())
    }

    pub fn get_converter(&self, name: &str) -> Result<Arc<dyn Function>> {
        self.lookup_converter(name)
            .ok_or_else(|| Error::Registration(format!("converter {} is not registered", name)))
    }

    pub fn has_converter(&self, name: &str) -> bool {
        self.lookup_converter(name).is_some()
    }

    fn lookup_converter(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.converters
            .get(name)
            .cloned()
            .or_else(|| self.parent.as_ref().and_then(|p| p.lookup_converter(name)))
    }

    pub fn register_namespace(&mut self, namespace: Namespace) -> Result<()> {
        if self.namespace(&namespace.name).is_some() {
            return Err(Error::Registration(format!(
                "namespace {} is already registered",
                namespace.name
            )));
        }
        debug!("namespace {} registered", namespace.name);
        self.namespaces
            .insert(namespace.name.clone(), Arc::new(namespace));
        Ok(())
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .get(name)
            .cloned()
            .or_else(|| self.parent.as_ref().and_then(|p| p.namespace(name)))
    }

    /// Forget every local module and converter; namespaces go back to the
    /// built-in set. The parent is untouched.
    pub fn clear(&mut self) {
        self.modules.clear();
        self.converters.clear();
        self.namespaces = if self.parent.is_some() {
            IndexMap::new()
        } else {
            builtin_namespaces()
        };
        debug!("registry cleared");
    }

    /// Every visible module name: built-ins, then the parent's, then local.
    pub fn module_names(&self) -> Vec<String> {
        self.env().into_keys().collect()
    }

    /// Visible modules as an expression environment.
    pub fn env(&self) -> Env {
        let mut env = Env::new();
        for name in BUILTINS {
            if let Some(b) = builtin(name) {
                env.insert(name.to_string(), Value::Builder(b));
            }
        }
        if let Some(parent) = &self.parent {
            env.extend(parent.env());
        }
        for (name, builder) in &self.modules {
            env.insert(name.clone(), Value::Builder(Arc::clone(builder)));
        }
        env
    }

    /// Visible converters as an expression environment.
    pub fn converter_env(&self) -> Env {
        let mut env = self
            .parent
            .as_ref()
            .map(|p| p.converter_env())
            .unwrap_or_default();
        for (name, converter) in &self.converters {
            env.insert(name.clone(), Value::Function(Arc::clone(converter)));
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Kwargs;

    fn linear() -> Arc<dyn ModuleBuilder> {
        crate::nn::builder("Linear").unwrap()
    }

    fn noop(name: &str) -> Arc<dyn Function> {
        Arc::new(NativeFunction::new(name, |mut args, _| Ok(args.remove(0))))
    }

    #[test]
    fn test_nf012_register_get_has() {
        let mut r = Registry::new();
        assert!(!r.has("Dense"));
        r.register("Dense", linear()).unwrap();
        assert!(r.has("Dense"));
        assert_eq!(r.get("Dense").unwrap().name(), "Linear");
        assert!(matches!(r.register("Dense", linear()), Err(Error::Registration(_))));
        assert!(matches!(r.get("Missing"), Err(Error::Registration(_))));
    }

    #[test]
    fn test_nf012_output_builtin() {
        let mut r = Registry::new();
        assert!(r.has(OUTPUT_MODULE));
        assert!(matches!(
            r.register(OUTPUT_MODULE, linear()),
            Err(Error::Registration(_))
        ));
        let out = r
            .get(OUTPUT_MODULE)
            .unwrap()
            .build(&r, vec![], Kwargs::new())
            .unwrap();
        assert!(!out.is_persistent());
        assert_eq!(
            out.forward(vec![Value::Int(1), Value::Int(2)]).unwrap(),
            Value::Tuple(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(out.forward(vec![Value::Int(1)]).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_nf012_clear_resets_to_builtins() {
        let mut r = Registry::new();
        r.register_module(linear()).unwrap();
        r.register_converter(noop("strip")).unwrap();
        r.register_namespace(Namespace {
            name: "extra".into(),
            members: Env::new(),
        })
        .unwrap();
        r.clear();
        assert_eq!(r.module_names(), vec![OUTPUT_MODULE.to_string()]);
        assert!(!r.has_converter("strip"));
        assert!(r.namespace("extra").is_none());
        assert!(r.namespace("nn").is_some());
        r.register_module(linear()).unwrap();
    }

    #[test]
    fn test_nf012_layered_lookup() {
        let mut base = Registry::new();
        base.register("Block", linear()).unwrap();
        base.register_converter(noop("fold")).unwrap();
        let base = Arc::new(base);

        let mut a = Registry::with_parent(Arc::clone(&base));
        let mut b = Registry::with_parent(Arc::clone(&base));
        a.register("Head", linear()).unwrap();
        b.register("Head", linear()).unwrap();
        // Local entries shadow the parent's.
        a.register("Block", linear()).unwrap();

        assert!(a.has("Block") && b.has("Block"));
        assert!(a.has_converter("fold"));
        assert!(a.namespace("nn").is_some());
        assert!(!base.has("Head"));
        assert_eq!(a.module_names(), vec![OUTPUT_MODULE, "Block", "Head"]);
        assert!(a.converter_env().contains_key("fold"));
    }

    #[test]
    fn test_nf012_converter_duplicates() {
        let mut r = Registry::new();
        r.register_converter_as("c", noop("x")).unwrap();
        assert!(matches!(
            r.register_converter_as("c", noop("y")),
            Err(Error::Registration(_))
        ));
        assert_eq!(r.get_converter("c").unwrap().name(), "x");
        assert!(matches!(r.get_converter("d"), Err(Error::Registration(_))));
    }
}
