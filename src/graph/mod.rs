//! Graph layer: module traits, the pipeline module, persistence helpers.

pub mod module;
pub mod pipeline;
pub mod state;
