//! NF-005: Shared types for config-defined graphs.
//!
//! Constants for the config schema, parameter declarations, layer
//! references and the fully-resolved layer records handed to the graph
//! builder.

use super::value::{Function, Kwargs, Value};
use crate::graph::module::ModuleBuilder;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Constants
// ============================================================================

/// Strings starting with this marker are taken verbatim, never evaluated.
pub const LITERAL_PREFIX: &str = "~";

/// `from` value marking a layer as dropped from the forward pass.
pub const DROP: &str = "drop";

/// Selector passing a referenced layer's whole output.
pub const ALL: &str = "all";

/// Built-in pass-through module closing a graph.
pub const OUTPUT_MODULE: &str = "Output";

/// Index of the graph input; layers are numbered from here + 1.
pub const INPUT_INDEX: i64 = 0;
pub const LAYER_START_INDEX: i64 = 1;
/// Persistence keys of sub-modules start here.
pub const MODULE_START_INDEX: usize = 1;

pub const IMPORTS_KEY: &str = "imports";
pub const ARGS_KEY: &str = "args";
pub const VARS_KEY: &str = "vars";
pub const BUFFERS_KEY: &str = "buffers";
pub const PARAMS_KEY: &str = "params";
pub const LAYERS_KEY: &str = "layers";
pub const CONVERTERS_KEY: &str = "converters";

pub const GLOBAL_IMPORTS_KEY: &str = "global_imports";
pub const GLOBAL_VARS_KEY: &str = "global_vars";
pub const AUTO_REGISTER_KEY: &str = "auto_register";

// ============================================================================
// Parameters
// ============================================================================

/// One entry of a module's `args` declaration list.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamDecl {
    /// Bare name, must be supplied by the caller.
    Required(String),
    /// Name with a default (itself possibly an expression string).
    Optional(String, Value),
}

impl ParamDecl {
    pub fn name(&self) -> &str {
        match self {
            Self::Required(n) | Self::Optional(n, _) => n,
        }
    }

    pub fn is_required(&self) -> bool {
        matches!(self, Self::Required(_))
    }
}

// ============================================================================
// Layer references
// ============================================================================

/// Which part of a referenced layer's output is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    All,
    Index(i64),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "'{}'", ALL),
            Self::Index(i) => write!(f, "{}", i),
        }
    }
}

/// Normalized `(source index, selector)` pairs in declaration order.
pub type FromTuple = Vec<(i64, Selector)>;

/// A layer's parsed `from` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerFrom {
    Drop,
    Refs(FromTuple),
}

impl LayerFrom {
    pub fn is_drop(&self) -> bool {
        matches!(self, Self::Drop)
    }

    pub fn refs(&self) -> &[(i64, Selector)] {
        match self {
            Self::Drop => &[],
            Self::Refs(r) => r,
        }
    }
}

impl fmt::Display for LayerFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => write!(f, "'{}'", DROP),
            Self::Refs(refs) => {
                write!(f, "(")?;
                for (i, (index, sel)) in refs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "({}, {})", index, sel)?;
                }
                if refs.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
        }
    }
}

// ============================================================================
// Resolved layers and converters
// ============================================================================

/// A layer with every expression resolved, ready to instantiate.
#[derive(Clone)]
pub struct Layer {
    pub from: LayerFrom,
    pub module: Arc<dyn ModuleBuilder>,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("from", &self.from)
            .field("module", &self.module.name())
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .finish()
    }
}

/// A converter with its resolved arguments.
#[derive(Clone)]
pub struct ConverterLayer {
    pub converter: Arc<dyn Function>,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

// ============================================================================
// Reports
// ============================================================================

/// Machine-readable description of a built pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub name: String,
    pub layers: Vec<LayerReport>,
    pub drop_set: Vec<usize>,
    pub state: Vec<StateEntry>,
    pub fingerprint: String,
}

/// One executed layer: its absolute index, wiring and module.
#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    pub index: i64,
    pub from: String,
    pub module: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateEntry {
    pub key: String,
    pub shape: Vec<usize>,
}
