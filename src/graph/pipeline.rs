//! NF-011: Pipeline graph module.
//!
//! Builds a DAG from resolved layers and executes it in declaration order.
//!
//! Every layer's module is instantiated at construction, including layers
//! marked `drop` and layers no later layer consumes, and every persistent
//! module is registered under a numeric key from 1. Checkpoints written
//! before a layer was disabled therefore still load. Dropped and unused
//! layers are only skipped by `forward`; their keys seed the drop set so a
//! later [`PipelineModule::drop`] removes them for good.

use super::module::{auto_unpack, replace_tensor, Module, StateDict};
use crate::core::error::{Error, Result};
use crate::core::layer_from::{drop_indexes, to_absolute, unused_indexes};
use crate::core::registry::Registry;
use crate::core::types::{
    FromTuple, Layer, LayerFrom, LayerReport, Selector, INPUT_INDEX, LAYER_START_INDEX,
    MODULE_START_INDEX,
};
use crate::core::value::{Env, Value};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// One executed layer.
struct Step {
    index: i64,
    from: FromTuple,
    slot: usize,
}

pub struct PipelineModule {
    name: String,
    params: StateDict,
    buffers: StateDict,
    /// Every instantiated layer module, in declaration order.
    slots: Vec<Box<dyn Module>>,
    /// Persistence view: module key -> slot.
    registered: BTreeMap<usize, usize>,
    steps: Vec<Step>,
    drop_set: BTreeSet<usize>,
}

fn tensors(kind: &str, env: Env) -> Result<StateDict> {
    env.into_iter()
        .map(|(k, v)| match v {
            Value::Tensor(t) => Ok((k, t)),
            other => Err(Error::ConfigFormat(format!(
                "{} '{}' should be a tensor, got {}",
                kind,
                k,
                other.type_name()
            ))),
        })
        .collect()
}

fn select(results: &HashMap<i64, Value>, index: i64, selector: Selector) -> Result<Value> {
    let value = results.get(&index).ok_or_else(|| {
        Error::Index(format!("output of layer {} is not available", index))
    })?;
    match selector {
        Selector::All => Ok(value.clone()),
        Selector::Index(i) => value.index(i),
    }
}

/// Shape of a tensor, shapes of a tuple's items, otherwise the type name.
fn shape_of(value: &Value) -> String {
    match value {
        Value::Tensor(t) => format!("{:?}", t.shape()),
        Value::List(items) | Value::Tuple(items) => {
            let inner: Vec<String> = items.iter().map(shape_of).collect();
            format!("({})", inner.join(", "))
        }
        other => other.type_name().to_string(),
    }
}

impl PipelineModule {
    /// Instantiate and wire `layers`. Buffers and params must be tensors
    /// with disjoint names.
    pub fn new(
        name: impl Into<String>,
        layers: Vec<Layer>,
        buffers: Env,
        params: Env,
        registry: &Registry,
    ) -> Result<Self> {
        let name = name.into();
        let buffers = tensors("buffer", buffers)?;
        let params = tensors("param", params)?;
        if let Some(key) = buffers.keys().find(|k| params.contains_key(*k)) {
            return Err(Error::ConfigFormat(format!(
                "'{}' is declared as both buffer and param",
                key
            )));
        }

        let froms: Vec<LayerFrom> = layers.iter().map(|l| l.from.clone()).collect();
        let dropped = drop_indexes(&froms);
        if !dropped.is_empty() {
            info!(
                "{}: layers {:?} are set to be dropped in forward pass",
                name, dropped
            );
        }

        // Drop layers take no part in numbering; relative references skip them.
        let kept: Vec<usize> = (0..layers.len())
            .filter(|&p| !layers[p].from.is_drop())
            .collect();
        let kept_froms = kept
            .iter()
            .enumerate()
            .map(|(k, &p)| to_absolute(LAYER_START_INDEX + k as i64, layers[p].from.refs()))
            .collect::<Result<Vec<_>>>()?;
        let unused = unused_indexes(&kept_froms);
        if !unused.is_empty() {
            warn!(
                "{}: layers {:?} are not connected to any other layer and will be dropped in forward pass",
                name, unused
            );
        }

        let mut slots = Vec::with_capacity(layers.len());
        for (p, layer) in layers.iter().enumerate() {
            let module = layer
                .module
                .build(registry, layer.args.clone(), layer.kwargs.clone())
                .map_err(|e| {
                    debug!("{}: building layer {} ({}) failed", name, p + 1, layer.module.name());
                    e
                })?;
            slots.push(module);
        }

        let mut excluded: BTreeSet<usize> = (0..layers.len())
            .filter(|&p| layers[p].from.is_drop())
            .collect();
        excluded.extend(unused.iter().map(|&i| kept[(i - LAYER_START_INDEX) as usize]));

        let (registered, groups) = register(&name, &slots);
        let drop_set = groups
            .iter()
            .filter(|(_, positions)| positions.iter().all(|p| excluded.contains(p)))
            .map(|(key, _)| *key)
            .collect();

        let steps = kept
            .iter()
            .zip(kept_froms)
            .enumerate()
            .filter_map(|(k, (&slot, from))| {
                let index = LAYER_START_INDEX + k as i64;
                (!unused.contains(&index)).then_some(Step { index, from, slot })
            })
            .collect();

        let module = Self {
            name,
            params,
            buffers,
            slots,
            registered,
            steps,
            drop_set,
        };
        if module.registered.is_empty() {
            debug!("{} is created without submodules", module.name);
        } else {
            debug!("{} is created with submodules:\n{}", module.name, module.describe());
        }
        Ok(module)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered sub-module keys in ascending order.
    pub fn module_keys(&self) -> Vec<usize> {
        self.registered.keys().copied().collect()
    }

    pub fn submodule(&self, key: usize) -> Option<&dyn Module> {
        self.registered.get(&key).map(|&slot| self.slots[slot].as_ref())
    }

    /// Absolute indexes of the layers `forward` executes.
    pub fn executed_indexes(&self) -> Vec<i64> {
        self.steps.iter().map(|s| s.index).collect()
    }

    /// Wiring of every executed layer.
    pub fn layer_reports(&self) -> Vec<LayerReport> {
        self.steps
            .iter()
            .map(|s| LayerReport {
                index: s.index,
                from: LayerFrom::Refs(s.from.clone()).to_string(),
                module: self.slots[s.slot].describe(),
            })
            .collect()
    }

    pub fn drop_set(&self) -> &BTreeSet<usize> {
        &self.drop_set
    }

    pub fn add_drop(&mut self, keys: impl IntoIterator<Item = usize>) {
        self.drop_set.extend(keys);
    }

    pub fn remove_drop(&mut self, keys: impl IntoIterator<Item = usize>) {
        for key in keys {
            self.drop_set.remove(&key);
        }
    }

    /// Unregister every sub-module in the drop set and clear it. Forward
    /// execution is unaffected; only the persistence view changes.
    pub fn drop(&mut self, resort: bool) {
        let drop_set = std::mem::take(&mut self.drop_set);
        for key in &drop_set {
            if self.registered.remove(key).is_none() {
                debug!("{}: no submodule {} to drop", self.name, key);
            }
        }
        if !drop_set.is_empty() {
            info!("{}: dropped submodules {:?}", self.name, drop_set);
        }
        if resort {
            self.resort();
        }
    }

    /// Renumber registered sub-modules contiguously from 1, keeping order.
    pub fn resort(&mut self) {
        let renumbered: BTreeMap<usize, usize> = self
            .registered
            .keys()
            .enumerate()
            .map(|(i, &old)| (old, i + MODULE_START_INDEX))
            .collect();
        self.drop_set = self
            .drop_set
            .iter()
            .filter_map(|k| renumbered.get(k).copied())
            .collect();
        self.registered = self
            .registered
            .iter()
            .map(|(old, &slot)| (renumbered[old], slot))
            .collect();
    }

    /// [`drop`](Self::drop) this module and every nested pipeline it owns.
    pub fn drop_recursive(&mut self, resort: bool) {
        let slots: Vec<usize> = self.registered.values().copied().collect();
        for slot in slots {
            self.slots[slot].finalize_drops(resort);
        }
        self.drop(resort);
    }

    /// The state dict this module would have after `drop_recursive(resort)`,
    /// computed without mutating it.
    pub fn dropped_state_dict(&self, resort: bool) -> StateDict {
        let mut state = self.own_state();
        let kept = self
            .registered
            .iter()
            .filter(|(key, _)| !self.drop_set.contains(key));
        for (i, (&key, &slot)) in kept.enumerate() {
            let key = if resort { i + MODULE_START_INDEX } else { key };
            for (k, t) in self.slots[slot].finalized_state_dict(resort) {
                state.insert(format!("{}.{}", key, k), t);
            }
        }
        state
    }

    /// Load tensors by key. Strict mode rejects missing and unexpected
    /// keys; shape mismatches are always rejected.
    pub fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<()> {
        let expected = self.state_dict();
        if strict {
            let missing: Vec<&String> = expected.keys().filter(|k| !state.contains_key(*k)).collect();
            let unexpected: Vec<&String> =
                state.keys().filter(|k| !expected.contains_key(*k)).collect();
            if !missing.is_empty() || !unexpected.is_empty() {
                return Err(Error::State(format!(
                    "error loading state dict for {}: missing keys {:?}, unexpected keys {:?}",
                    self.name, missing, unexpected
                )));
            }
        }
        for (key, tensor) in state {
            if expected.contains_key(key) {
                self.load_tensor(key, tensor.clone())?;
            } else {
                debug!("{}: ignoring unexpected key {}", self.name, key);
            }
        }
        Ok(())
    }

    /// Indented module tree.
    pub fn summary(&self) -> String {
        self.describe()
    }

    fn own_state(&self) -> StateDict {
        let mut state = StateDict::new();
        for (k, t) in self.params.iter().chain(&self.buffers) {
            state.insert(k.clone(), t.clone());
        }
        state
    }
}

/// Assign module keys to persistent slots. Slots sharing an instance get
/// the key of the first one. Returns the key -> slot map and, per key, all
/// slot positions using it.
fn register(
    name: &str,
    slots: &[Box<dyn Module>],
) -> (BTreeMap<usize, usize>, BTreeMap<usize, Vec<usize>>) {
    let mut registered = BTreeMap::new();
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut by_instance: HashMap<usize, usize> = HashMap::new();
    let mut next = MODULE_START_INDEX;

    for (p, module) in slots.iter().enumerate() {
        if !module.is_persistent() {
            continue;
        }
        if let Some(instance) = module.instance_key() {
            if let Some(&key) = by_instance.get(&instance) {
                info!(
                    "{}: layer {} reuses the module of submodule {} and is registered once",
                    name,
                    p + 1,
                    key
                );
                groups.entry(key).or_default().push(p);
                continue;
            }
            by_instance.insert(instance, next);
        }
        registered.insert(next, p);
        groups.insert(next, vec![p]);
        next += 1;
    }
    (registered, groups)
}

impl Module for PipelineModule {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn forward(&self, inputs: Vec<Value>) -> Result<Value> {
        let mut results: HashMap<i64, Value> = HashMap::new();
        results.insert(INPUT_INDEX, auto_unpack(inputs));
        let mut last = INPUT_INDEX;

        for step in &self.steps {
            let args = step
                .from
                .iter()
                .map(|&(index, selector)| select(&results, index, selector))
                .collect::<Result<Vec<_>>>()?;
            if log::log_enabled!(log::Level::Debug) {
                let shapes: Vec<String> = args.iter().map(shape_of).collect();
                debug!("{} layer {} input: {}", self.name, step.index, shapes.join(", "));
            }
            let out = self.slots[step.slot].forward(args).map_err(|e| match e {
                Error::Forward(msg) => {
                    Error::Forward(format!("{} layer {}: {}", self.name, step.index, msg))
                }
                other => other,
            })?;
            debug!("{} layer {} output: {}", self.name, step.index, shape_of(&out));
            results.insert(step.index, out);
            last = step.index;
        }
        Ok(results.remove(&last).unwrap_or_default())
    }

    fn state_dict(&self) -> StateDict {
        let mut state = self.own_state();
        for (key, &slot) in &self.registered {
            for (k, t) in self.slots[slot].state_dict() {
                state.insert(format!("{}.{}", key, k), t);
            }
        }
        state
    }

    fn load_tensor(&mut self, key: &str, tensor: crate::nn::tensor::Tensor) -> Result<()> {
        if let Some(slot) = self.params.get_mut(key) {
            return replace_tensor(slot, &self.name, key, tensor);
        }
        if let Some(slot) = self.buffers.get_mut(key) {
            return replace_tensor(slot, &self.name, key, tensor);
        }
        let unexpected = || Error::State(format!("unexpected key '{}' for {}", key, self.name));
        let (head, rest) = key.split_once('.').ok_or_else(unexpected)?;
        let module_key: usize = head.parse().map_err(|_| unexpected())?;
        let slot = *self.registered.get(&module_key).ok_or_else(unexpected)?;
        self.slots[slot].load_tensor(rest, tensor)
    }

    fn finalize_drops(&mut self, resort: bool) {
        self.drop_recursive(resort);
    }

    fn finalized_state_dict(&self, resort: bool) -> StateDict {
        self.dropped_state_dict(resort)
    }

    fn as_pipeline(&self) -> Option<&PipelineModule> {
        Some(self)
    }

    fn as_pipeline_mut(&mut self) -> Option<&mut PipelineModule> {
        Some(self)
    }

    fn describe(&self) -> String {
        if self.registered.is_empty() {
            return format!("{}()", self.name);
        }
        let mut lines = vec![format!("{}(", self.name)];
        for (key, &slot) in &self.registered {
            let child = self.slots[slot].describe().replace('\n', "\n  ");
            lines.push(format!("  ({}): {}", key, child));
        }
        lines.push(")".to_string());
        lines.join("\n")
    }
}

impl fmt::Display for PipelineModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl fmt::Debug for PipelineModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineModule")
            .field("name", &self.name)
            .field("modules", &self.module_keys())
            .field("executed", &self.executed_indexes())
            .field("drop_set", &self.drop_set)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::merge_envs;
    use crate::core::layers::parse_layers;
    use crate::graph::module::SharedBuilder;
    use crate::nn::layers::Linear;
    use crate::nn::tensor::Tensor;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn env() -> Env {
        merge_envs([&Registry::new().env(), &crate::nn::namespace().members])
    }

    fn build_with(name: &str, layers: &str, env: &Env) -> Result<PipelineModule> {
        let value = Value::from_yaml(&serde_yaml_ng::from_str(layers).unwrap()).unwrap();
        let layers = parse_layers(&value, env)?;
        PipelineModule::new(name, layers, Env::new(), Env::new(), &Registry::new())
    }

    fn build(name: &str, layers: &str) -> PipelineModule {
        build_with(name, layers, &env()).unwrap()
    }

    fn shape(v: &Value) -> Vec<usize> {
        match v {
            Value::Tensor(t) => t.shape().to_vec(),
            other => panic!("expected tensor, got {:?}", other),
        }
    }

    #[test]
    fn test_nf011_chain_wiring_and_forward() {
        let m = build(
            "Chain",
            "[[-1, Linear, [3, 16]], [-1, Sigmoid], [-1, ReLU]]",
        );
        let froms: Vec<_> = m.layer_reports().into_iter().map(|r| r.from).collect();
        assert_eq!(froms, vec!["((0, 'all'),)", "((1, 'all'),)", "((2, 'all'),)"]);
        let out = m.forward(vec![Value::Tensor(Tensor::ones(&[2, 3]))]).unwrap();
        assert_eq!(shape(&out), vec![2, 16]);
        assert_eq!(
            m.summary(),
            "Chain(\n  (1): Linear(in_features=3, out_features=16, bias=True)\n  (2): Sigmoid()\n  (3): ReLU()\n)"
        );
    }

    #[test]
    fn test_nf011_drop_layers_registered_until_dropped() {
        let mut m = build(
            "Net",
            "[[-1, Linear, [4, 4]], [drop, 'lambda x: None'], [drop, Linear, [4, 4]], \
             [-1, 'lambda x: x'], [-1, ReLU]]",
        );
        assert_eq!(
            m.summary(),
            "Net(\n  (1): Linear(in_features=4, out_features=4, bias=True)\n  \
             (2): Linear(in_features=4, out_features=4, bias=True)\n  (3): ReLU()\n)"
        );
        assert_eq!(m.drop_set(), &BTreeSet::from([2]));
        assert_eq!(m.executed_indexes(), vec![1, 2, 3]);
        let x = Value::Tensor(Tensor::zeros(&[1, 4]));
        assert_eq!(shape(&m.forward(vec![x.clone()]).unwrap()), vec![1, 4]);

        m.drop(false);
        assert_eq!(m.module_keys(), vec![1, 3]);
        assert!(m.drop_set().is_empty());
        assert_eq!(shape(&m.forward(vec![x.clone()]).unwrap()), vec![1, 4]);

        m.resort();
        assert_eq!(
            m.summary(),
            "Net(\n  (1): Linear(in_features=4, out_features=4, bias=True)\n  (2): ReLU()\n)"
        );
        assert_eq!(shape(&m.forward(vec![x]).unwrap()), vec![1, 4]);
    }

    #[test]
    fn test_nf011_drop_with_resort() {
        let mut m = build(
            "Net",
            "[[-1, Linear, [4, 4]], [drop, Linear, [4, 4]], [-1, ReLU]]",
        );
        m.drop(true);
        assert_eq!(m.module_keys(), vec![1, 2]);
        assert_eq!(m.submodule(2).map(|s| s.describe()), Some("ReLU()".to_string()));
    }

    #[test]
    fn test_nf011_unused_layer_excluded() {
        let m = build(
            "Net",
            "[[-1, Linear, [4, 8]], [-1, Linear, [8, 8]], [1, ReLU]]",
        );
        assert_eq!(m.executed_indexes(), vec![1, 3]);
        assert_eq!(m.drop_set(), &BTreeSet::from([2]));
        assert!(m.state_dict().contains_key("2.weight"));
        let out = m.forward(vec![Value::Tensor(Tensor::zeros(&[1, 4]))]).unwrap();
        assert_eq!(shape(&out), vec![1, 8]);
    }

    #[test]
    fn test_nf011_index_errors() {
        let env = env();
        for layers in ["[[1, ReLU]]", "[[-2, ReLU]]", "[[-1, ReLU], [5, ReLU]]"] {
            assert!(
                matches!(build_with("Bad", layers, &env), Err(Error::Index(_))),
                "{}",
                layers
            );
        }
    }

    #[test]
    fn test_nf011_selectors_and_tuple_input() {
        let m = build(
            "Branch",
            "[[-1, 'lambda x: (x, x * 2)'], [[{1: 0}, {1: 1}], Add], [{1: all}, 'lambda t: len(t)'], [[2, 3], 'lambda a, n: a * n']]",
        );
        let out = m.forward(vec![Value::Tensor(Tensor::ones(&[2]))]).unwrap();
        let Value::Tensor(t) = out else {
            panic!("expected tensor");
        };
        assert_eq!(t.data(), &[6.0, 6.0]);

        let m = build("Pair", "[[[{0: 0}, {0: 1}], Add]]");
        let out = m
            .forward(vec![Value::Int(2), Value::Int(5)])
            .unwrap();
        assert_eq!(out, Value::Int(7));
    }

    #[test]
    fn test_nf011_selector_out_of_range() {
        let m = build("Sel", "[[{0: 3}, Identity]]");
        let err = m.forward(vec![Value::Int(1), Value::Int(2)]).unwrap_err();
        assert!(matches!(err, Error::Index(_)));
    }

    #[test]
    fn test_nf011_shared_instance_registered_once() {
        let mut env = env();
        let shared = SharedBuilder::new(Box::new(Linear::new(4, 4, false)));
        env.insert("block".into(), Value::Builder(Arc::new(shared)));

        let m = build_with("Shared", "[[-1, block], [-1, block], [-1, ReLU]]", &env).unwrap();
        assert_eq!(m.module_keys(), vec![1, 2]);
        assert!(m.drop_set().is_empty());

        // One use excluded, one kept: the instance stays.
        let m = build_with("Shared", "[[-1, block], [drop, block], [-1, ReLU]]", &env).unwrap();
        assert!(m.drop_set().is_empty());

        // Every use excluded: dropped.
        let m = build_with(
            "Shared",
            "[[-1, ReLU], [drop, block], [drop, block], [-1, Sigmoid]]",
            &env,
        )
        .unwrap();
        assert_eq!(m.drop_set(), &BTreeSet::from([2]));
    }

    #[test]
    fn test_nf011_shared_pipeline_drops_finalized() {
        let inner = build("Inner", "[[-1, Linear, [4, 4]], [drop, Linear, [4, 4]], [-1, ReLU]]");
        assert_eq!(inner.drop_set(), &BTreeSet::from([2]));
        let mut env = env();
        let shared = SharedBuilder::new(Box::new(inner));
        env.insert("inner".into(), Value::Builder(Arc::new(shared)));

        let mut m =
            build_with("Outer", "[[-1, inner], [-1, inner], [-1, Linear, [4, 2]]]", &env).unwrap();
        assert_eq!(m.module_keys(), vec![1, 2]);
        let keys: Vec<_> = m.state_dict().keys().cloned().collect();
        assert_eq!(
            keys,
            vec!["1.1.weight", "1.1.bias", "1.2.weight", "1.2.bias", "2.weight", "2.bias"]
        );

        let expected = vec!["1.1.weight", "1.1.bias", "2.weight", "2.bias"];
        let dropped: Vec<_> = m.dropped_state_dict(true).keys().cloned().collect();
        assert_eq!(dropped, expected);

        m.drop_recursive(true);
        let keys: Vec<_> = m.state_dict().keys().cloned().collect();
        assert_eq!(keys, expected);
        let inner_desc = m.submodule(1).map(|s| s.describe()).unwrap();
        assert!(inner_desc.contains("(2): ReLU()"));
        assert!(!inner_desc.contains("(3)"));

        let out = m.forward(vec![Value::Tensor(Tensor::zeros(&[1, 4]))]).unwrap();
        assert_eq!(shape(&out), vec![1, 2]);
    }

    #[test]
    fn test_nf011_shape_of_for_layer_trace() {
        assert_eq!(shape_of(&Value::Tensor(Tensor::zeros(&[2, 3]))), "[2, 3]");
        let pair = Value::Tuple(vec![Value::Tensor(Tensor::zeros(&[1])), Value::Int(3)]);
        assert_eq!(shape_of(&pair), "([1], int)");
        assert_eq!(shape_of(&Value::None), "none");
    }

    #[test]
    fn test_nf011_state_dict_and_load() {
        let mut m = build(
            "Net",
            "[[-1, Linear, [2, 3]], [drop, Linear, [3, 3]], [-1, Linear, [3, 1]]]",
        );
        let keys: Vec<_> = m.state_dict().keys().cloned().collect();
        assert_eq!(
            keys,
            vec!["1.weight", "1.bias", "2.weight", "2.bias", "3.weight", "3.bias"]
        );
        let dropped: Vec<_> = m.dropped_state_dict(true).keys().cloned().collect();
        assert_eq!(dropped, vec!["1.weight", "1.bias", "2.weight", "2.bias"]);
        assert_eq!(m.dropped_state_dict(true)["2.weight"].shape(), &[1, 3]);

        let mut state = m.state_dict();
        state.insert("3.bias".into(), Tensor::ones(&[1]));
        m.load_state_dict(&state, true).unwrap();
        assert_eq!(m.state_dict()["3.bias"], Tensor::ones(&[1]));

        state.insert("9.weight".into(), Tensor::ones(&[1]));
        assert!(matches!(m.load_state_dict(&state, true), Err(Error::State(_))));
        m.load_state_dict(&state, false).unwrap();

        let mut bad = m.state_dict();
        bad.insert("1.bias".into(), Tensor::ones(&[7]));
        assert!(matches!(m.load_state_dict(&bad, false), Err(Error::State(_))));

        let mut partial = m.state_dict();
        partial.shift_remove("1.weight");
        assert!(matches!(m.load_state_dict(&partial, true), Err(Error::State(_))));
    }

    #[test]
    fn test_nf011_buffers_and_params() {
        let mut buffers = Env::new();
        buffers.insert("scale".into(), Value::Tensor(Tensor::ones(&[1])));
        let mut params = Env::new();
        params.insert("gain".into(), Value::Tensor(Tensor::zeros(&[2])));
        let m = PipelineModule::new("P", vec![], buffers.clone(), params.clone(), &Registry::new())
            .unwrap();
        let keys: Vec<_> = m.state_dict().keys().cloned().collect();
        assert_eq!(keys, vec!["gain", "scale"]);
        assert_eq!(m.summary(), "P()");

        assert!(matches!(
            PipelineModule::new("P", vec![], buffers.clone(), buffers, &Registry::new()),
            Err(Error::ConfigFormat(_))
        ));
        let mut not_tensor = Env::new();
        not_tensor.insert("x".into(), Value::Int(1));
        assert!(matches!(
            PipelineModule::new("P", vec![], not_tensor, Env::new(), &Registry::new()),
            Err(Error::ConfigFormat(_))
        ));
    }

    #[test]
    fn test_nf011_add_remove_drop() {
        let mut m = build("Net", "[[-1, Linear, [1, 1]], [-1, Linear, [1, 1]], [-1, ReLU]]");
        m.add_drop([1, 2]);
        m.remove_drop([1]);
        assert_eq!(m.drop_set(), &BTreeSet::from([2]));
        m.drop(false);
        assert_eq!(m.module_keys(), vec![1, 3]);
        // Forward still runs every executed layer.
        assert_eq!(m.executed_indexes(), vec![1, 2, 3]);
    }

    #[test]
    fn test_nf011_resort_remaps_pending_drops() {
        let mut m = build("Net", "[[-1, Linear, [1, 1]], [-1, Linear, [1, 1]], [-1, ReLU]]");
        m.add_drop([1]);
        m.drop(false);
        m.add_drop([3]);
        m.resort();
        assert_eq!(m.module_keys(), vec![1, 2]);
        assert_eq!(m.drop_set(), &BTreeSet::from([2]));
    }

    proptest! {
        #[test]
        fn prop_nf011_resort_contiguous(
            n in 1usize..8,
            drops in proptest::collection::btree_set(1usize..8, 0..8),
        ) {
            let layers = format!("[{}]", vec!["[-1, Linear, [1, 1]]"; n].join(", "));
            let mut m = build("P", &layers);
            let drops: BTreeSet<usize> = drops.into_iter().filter(|d| *d <= n).collect();
            m.add_drop(drops.iter().copied());
            m.drop(true);
            let expected: Vec<usize> = (1..=n - drops.len()).collect();
            prop_assert_eq!(m.module_keys(), expected);
        }

        #[test]
        fn prop_nf011_last_layer_always_executed(
            reads in proptest::collection::vec(0usize..10, 1..8),
        ) {
            // Layer k+1 reads an arbitrary earlier index.
            let layers: Vec<String> = reads
                .iter()
                .enumerate()
                .map(|(k, r)| format!("[{}, Identity]", r % (k + 1)))
                .collect();
            let m = build("P", &format!("[{}]", layers.join(", ")));
            let last = reads.len() as i64;
            prop_assert_eq!(m.executed_indexes().last().copied(), Some(last));
        }
    }
}
