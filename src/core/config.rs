//! NF-014: Config registration.
//!
//! Every module entry of a config document is registered as a
//! [`LazyModule`]; nothing is evaluated until the module is built with
//! concrete arguments. A build resolves, in order: converters, the
//! environment (global env, registered modules, imports, bound inputs),
//! buffers and params, vars, then the layer list.

use super::args::input_env;
use super::converters::{apply_converters, parse_converters};
use super::env::{imports_env, is_env_conflict, merge_envs, vars_env};
use super::error::{Error, Result};
use super::layers::parse_layers;
use super::parser::parse_config_file;
use super::registry::Registry;
use super::types::{
    ARGS_KEY, AUTO_REGISTER_KEY, BUFFERS_KEY, CONVERTERS_KEY, GLOBAL_IMPORTS_KEY,
    GLOBAL_VARS_KEY, IMPORTS_KEY, LAYERS_KEY, PARAMS_KEY, VARS_KEY,
};
use super::value::{DictKey, Env, Kwargs, Value};
use crate::graph::module::{Module, ModuleBuilder};
use crate::graph::pipeline::PipelineModule;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

fn field(config: &Value, key: &str) -> Value {
    config.get(key).cloned().unwrap_or_default()
}

fn without(config: Value, key: &str) -> Value {
    match config {
        Value::Dict(mut d) => {
            d.shift_remove(&DictKey::Str(key.to_string()));
            Value::Dict(d)
        }
        other => other,
    }
}

/// Environment shared by every module of one document: the `nn` prelude
/// (the namespace and its members), then `global_imports` and
/// `global_vars`.
fn global_env(config: &Value, registry: &Registry) -> Result<Env> {
    let mut prelude = Env::new();
    if let Some(nn) = registry.namespace("nn") {
        prelude.extend(nn.members.iter().map(|(k, v)| (k.clone(), v.clone())));
        prelude.insert(nn.name.clone(), Value::Namespace(nn));
    }
    let imports = imports_env(&field(config, GLOBAL_IMPORTS_KEY), registry)?;
    let env = merge_envs([&prelude, &imports]);
    let vars = vars_env(&field(config, GLOBAL_VARS_KEY), &env)?;
    Ok(merge_envs([&env, &vars]))
}

/// Register every module entry of `config`. Returns the registered names
/// in document order.
pub fn register_config(registry: &mut Registry, config: &Value) -> Result<Vec<String>> {
    let Some(entries) = config.as_dict() else {
        return Err(Error::ConfigFormat(format!(
            "invalid config, expected a mapping, got {}",
            config.type_name()
        )));
    };
    if let Some(paths) = config.get(AUTO_REGISTER_KEY) {
        info!("{} {:?} is not supported here and is ignored", AUTO_REGISTER_KEY, paths);
    }

    let global = global_env(config, registry)?;
    let mut registered = Vec::new();
    for (key, entry) in entries {
        let name = match key {
            DictKey::Str(s) if [AUTO_REGISTER_KEY, GLOBAL_IMPORTS_KEY, GLOBAL_VARS_KEY]
                .contains(&s.as_str()) =>
            {
                continue
            }
            DictKey::Str(s) => s,
            other => {
                warn!("{} can't be recognized as a module, skipping", other);
                continue;
            }
        };
        if !matches!(entry, Value::Dict(_)) {
            warn!("{} can't be recognized as a module, skipping", name);
            continue;
        }
        if entry.get(LAYERS_KEY).is_none() && entry.get(CONVERTERS_KEY).is_none() {
            warn!("{} can't be recognized as a module", name);
            continue;
        }
        let module = LazyModule::new(name.clone(), entry.clone(), global.clone());
        registry.register(name.clone(), Arc::new(module))?;
        registered.push(name.clone());
    }
    info!("registered modules {:?}", registered);
    Ok(registered)
}

/// Read a YAML document and register it.
pub fn register_config_file(registry: &mut Registry, path: &Path) -> Result<Vec<String>> {
    info!("registering config from {}", path.display());
    let config = parse_config_file(path)?;
    register_config(registry, &config)
}

/// Where `get_module` takes an extra config from.
pub enum ConfigSource<'a> {
    Inline(&'a Value),
    File(&'a Path),
}

/// Register `config` when given, then build module `name`.
pub fn get_module(
    registry: &mut Registry,
    name: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
    config: Option<ConfigSource<'_>>,
) -> Result<Box<dyn Module>> {
    match config {
        Some(ConfigSource::Inline(c)) => {
            register_config(registry, c)?;
        }
        Some(ConfigSource::File(p)) => {
            register_config_file(registry, p)?;
        }
        None => {}
    }
    registry.get(name)?.build(registry, args, kwargs)
}

/// A config-defined module, built into a [`PipelineModule`] on demand.
pub struct LazyModule {
    name: String,
    config: Value,
    global_env: Env,
}

impl LazyModule {
    pub fn new(name: impl Into<String>, config: Value, global_env: Env) -> Self {
        Self {
            name: name.into(),
            config,
            global_env,
        }
    }

    /// Run the entry's converters, if any, and return the resulting config.
    fn convert(&self, registry: &Registry, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        let Some(converters) = self.config.get(CONVERTERS_KEY) else {
            return Ok(self.config.clone());
        };
        let imports = imports_env(&field(&self.config, IMPORTS_KEY), registry)?;
        let env = merge_envs([
            &self.global_env,
            &registry.env(),
            &registry.converter_env(),
            &imports,
        ]);
        let input = input_env(&field(&self.config, ARGS_KEY), args, kwargs, &env)?;
        let env = merge_envs([&env, &input]);

        let converters = parse_converters(converters, &env)?;
        let config = without(self.config.clone(), CONVERTERS_KEY);
        debug!("{} config before converters: {:?}", self.name, config);
        let converted = apply_converters(config, &converters)?;
        debug!("{} config after converters: {:?}", self.name, converted);
        Ok(converted)
    }
}

impl ModuleBuilder for LazyModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, registry: &Registry, args: Vec<Value>, kwargs: Kwargs) -> Result<Box<dyn Module>> {
        let config = self.convert(registry, &args, &kwargs)?;
        if !matches!(config, Value::Dict(_)) {
            return Err(Error::ConfigFormat(format!(
                "invalid config for {}, expected a mapping, got {}",
                self.name,
                config.type_name()
            )));
        }
        let layers = config.get(LAYERS_KEY).ok_or_else(|| {
            Error::ConfigFormat(format!(
                "invalid config for {}, missing {} key",
                self.name, LAYERS_KEY
            ))
        })?;

        let imports = imports_env(&field(&config, IMPORTS_KEY), registry)?;
        let env = merge_envs([&self.global_env, &registry.env(), &imports]);
        let input = input_env(&field(&config, ARGS_KEY), &args, &kwargs, &env)?;
        let env = merge_envs([&env, &input]);

        let buffers = vars_env(&field(&config, BUFFERS_KEY), &env)?;
        let params = vars_env(&field(&config, PARAMS_KEY), &env)?;
        if is_env_conflict(&buffers, &params) {
            return Err(Error::ConfigFormat(format!(
                "{}: buffers and params should not have the same key",
                self.name
            )));
        }
        let env = merge_envs([&env, &buffers, &params]);
        let vars = vars_env(&field(&config, VARS_KEY), &env)?;
        let env = merge_envs([&env, &vars]);

        debug!("{} layers before parsing: {:?}", self.name, layers);
        let layers = parse_layers(layers, &env)?;
        debug!("{} layers after parsing: {:?}", self.name, layers);
        let module = PipelineModule::new(self.name.clone(), layers, buffers, params, registry)?;
        Ok(Box::new(module))
    }
}
