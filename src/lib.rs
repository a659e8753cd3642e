//! Netforge: declarative computation graphs.
//!
//! Layers are declared in YAML, resolved through a small expression
//! language, and compiled into a pipeline whose sub-module numbering stays
//! stable across drops, so checkpoints keep loading after graph edits.

pub mod cli;
pub mod core;
pub mod graph;
pub mod nn;

pub use crate::core::config::{get_module, register_config, register_config_file, ConfigSource};
pub use crate::core::error::{Error, Result};
pub use crate::core::registry::Registry;
pub use crate::core::value::{Env, Kwargs, Value};
pub use crate::graph::module::{Module, ModuleBuilder};
pub use crate::graph::pipeline::PipelineModule;
