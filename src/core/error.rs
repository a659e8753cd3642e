//! NF-001: Error taxonomy.
//!
//! Every failure surfaces synchronously at the point of detection; nothing
//! is retried or suppressed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed layer / param / from shape: wrong arity, wrong types.
    #[error("config format error: {0}")]
    ConfigFormat(String),

    /// Unbound name, expression syntax or evaluation failure.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Out-of-range, self- or forward-referencing layer index.
    #[error("index error: {0}")]
    Index(String),

    /// Duplicate name on register, unknown name on lookup.
    #[error("registration error: {0}")]
    Registration(String),

    /// Missing or extra arguments.
    #[error("arity error: {0}")]
    Arity(String),

    /// A sub-module failed while executing a forward pass.
    #[error("forward error: {0}")]
    Forward(String),

    /// Missing, unexpected or mis-shaped state-dict entries.
    #[error("state error: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
