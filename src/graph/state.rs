//! NF-016: State-dict helpers and layout lock files.
//!
//! A layout lock records the key order and tensor shapes of a module's
//! state dict. Comparing a rebuilt module against its lock shows whether
//! a config edit kept existing checkpoints loadable.

use super::module::{Module, StateDict};
use super::pipeline::PipelineModule;
use crate::core::error::{Error, Result};
use crate::core::types::{PipelineReport, StateEntry};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Re-key `old` onto the key order of `new_layout`, entry by entry.
pub fn convert_state_dict(old: &StateDict, new_layout: &StateDict) -> Result<StateDict> {
    if old.len() != new_layout.len() {
        return Err(Error::State(format!(
            "length of state dicts must be equal, got {} and {}",
            old.len(),
            new_layout.len()
        )));
    }
    Ok(new_layout
        .keys()
        .zip(old.values())
        .map(|(k, t)| (k.clone(), t.clone()))
        .collect())
}

/// Hash of the ordered keys and shapes. Returns `"blake3:{hex}"`.
pub fn state_fingerprint(state: &StateDict) -> String {
    let mut hasher = blake3::Hasher::new();
    for (key, tensor) in state {
        hasher.update(key.as_bytes());
        hasher.update(b"\0");
        let dims: Vec<String> = tensor.shape().iter().map(|d| d.to_string()).collect();
        hasher.update(dims.join(",").as_bytes());
        hasher.update(b"\n");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Serializable description of a built pipeline.
pub fn report(module: &PipelineModule) -> PipelineReport {
    let state = module.state_dict();
    PipelineReport {
        name: module.name().to_string(),
        layers: module.layer_reports(),
        drop_set: module.drop_set().iter().copied().collect(),
        state: state
            .iter()
            .map(|(key, t)| StateEntry {
                key: key.clone(),
                shape: t.shape().to_vec(),
            })
            .collect(),
        fingerprint: state_fingerprint(&state),
    }
}

/// Key order and shapes of a state dict, as written to a lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLayout {
    pub schema: String,
    pub module: String,
    pub generator: String,
    pub fingerprint: String,
    pub entries: IndexMap<String, Vec<usize>>,
}

pub fn layout_of(module: &str, state: &StateDict) -> StateLayout {
    StateLayout {
        schema: "1.0".to_string(),
        module: module.to_string(),
        generator: format!("netforge {}", env!("CARGO_PKG_VERSION")),
        fingerprint: state_fingerprint(state),
        entries: state
            .iter()
            .map(|(k, t)| (k.clone(), t.shape().to_vec()))
            .collect(),
    }
}

/// Load a layout lock. Returns None if the file doesn't exist.
pub fn load_layout(path: &Path) -> Result<Option<StateLayout>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_yaml_ng::from_str(&content)?))
}

/// Save a layout lock atomically (write to temp, then rename).
pub fn save_layout(path: &Path, layout: &StateLayout) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let yaml = serde_yaml_ng::to_string(layout)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);
    std::fs::write(tmp_path, yaml)?;
    std::fs::rename(tmp_path, path)?;
    Ok(())
}

/// One difference between a lock and a live state dict.
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutChange {
    Missing(String),
    Unexpected(String),
    Reshaped {
        key: String,
        locked: Vec<usize>,
        found: Vec<usize>,
    },
    /// Same keys and shapes in a different order.
    Reordered,
}

impl fmt::Display for LayoutChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(k) => write!(f, "missing key {}", k),
            Self::Unexpected(k) => write!(f, "unexpected key {}", k),
            Self::Reshaped { key, locked, found } => {
                write!(f, "{} changed shape {:?} -> {:?}", key, locked, found)
            }
            Self::Reordered => write!(f, "entries were reordered"),
        }
    }
}

/// Differences between `lock` and `state` (empty = compatible).
pub fn compare_layout(lock: &StateLayout, state: &StateDict) -> Vec<LayoutChange> {
    let mut changes = Vec::new();
    for (key, locked) in &lock.entries {
        match state.get(key) {
            None => changes.push(LayoutChange::Missing(key.clone())),
            Some(t) if t.shape() != locked.as_slice() => changes.push(LayoutChange::Reshaped {
                key: key.clone(),
                locked: locked.clone(),
                found: t.shape().to_vec(),
            }),
            Some(_) => {}
        }
    }
    for key in state.keys().filter(|k| !lock.entries.contains_key(*k)) {
        changes.push(LayoutChange::Unexpected(key.clone()));
    }
    if changes.is_empty() && !lock.entries.keys().eq(state.keys()) {
        changes.push(LayoutChange::Reordered);
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::tensor::Tensor;

    fn state(entries: &[(&str, Vec<usize>)]) -> StateDict {
        entries
            .iter()
            .map(|(k, s)| (k.to_string(), Tensor::zeros(s)))
            .collect()
    }

    #[test]
    fn test_nf016_convert_instance_order() {
        let mut old = state(&[("1.weight", vec![2, 2]), ("3.weight", vec![2, 1])]);
        old.insert("3.bias".into(), Tensor::ones(&[1]));
        let new = state(&[("1.weight", vec![2, 2]), ("2.weight", vec![2, 1]), ("2.bias", vec![1])]);
        let converted = convert_state_dict(&old, &new).unwrap();
        let keys: Vec<_> = converted.keys().cloned().collect();
        assert_eq!(keys, vec!["1.weight", "2.weight", "2.bias"]);
        assert_eq!(converted["2.bias"], Tensor::ones(&[1]));

        let short = state(&[("1.weight", vec![2, 2])]);
        assert!(matches!(convert_state_dict(&old, &short), Err(Error::State(_))));
    }

    #[test]
    fn test_nf016_fingerprint() {
        let a = state(&[("1.weight", vec![2, 2]), ("1.bias", vec![2])]);
        let b = state(&[("1.bias", vec![2]), ("1.weight", vec![2, 2])]);
        let c = state(&[("1.weight", vec![2, 3]), ("1.bias", vec![2])]);
        let fa = state_fingerprint(&a);
        assert!(fa.starts_with("blake3:"));
        assert_eq!(fa.len(), 7 + 64);
        assert_eq!(fa, state_fingerprint(&a.clone()));
        assert_ne!(fa, state_fingerprint(&b));
        assert_ne!(fa, state_fingerprint(&c));
    }

    #[test]
    fn test_nf016_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("net.layout.yaml");
        let layout = layout_of("Net", &state(&[("1.weight", vec![4, 2]), ("1.bias", vec![4])]));
        save_layout(&path, &layout).unwrap();

        let loaded = load_layout(&path).unwrap().unwrap();
        assert_eq!(loaded, layout);
        let keys: Vec<_> = loaded.entries.keys().collect();
        assert_eq!(keys, vec!["1.weight", "1.bias"]);
        assert!(!dir.path().join("locks").join("net.layout.yaml.tmp").exists());
    }

    #[test]
    fn test_nf016_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_layout(&dir.path().join("ghost.yaml")).unwrap().is_none());
    }

    #[test]
    fn test_nf016_compare() {
        let lock = layout_of("Net", &state(&[("1.weight", vec![4, 2]), ("1.bias", vec![4])]));
        assert!(compare_layout(&lock, &state(&[("1.weight", vec![4, 2]), ("1.bias", vec![4])])).is_empty());

        let changes = compare_layout(&lock, &state(&[("1.weight", vec![4, 3]), ("2.bias", vec![4])]));
        assert_eq!(
            changes,
            vec![
                LayoutChange::Reshaped {
                    key: "1.weight".into(),
                    locked: vec![4, 2],
                    found: vec![4, 3],
                },
                LayoutChange::Missing("1.bias".into()),
                LayoutChange::Unexpected("2.bias".into()),
            ]
        );
        assert_eq!(changes[0].to_string(), "1.weight changed shape [4, 2] -> [4, 3]");

        let swapped = state(&[("1.bias", vec![4]), ("1.weight", vec![4, 2])]);
        assert_eq!(compare_layout(&lock, &swapped), vec![LayoutChange::Reordered]);
    }
}
