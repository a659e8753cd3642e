//! Core resolution logic: values, expressions, environments, parameters, layers, registration.

pub mod args;
pub mod config;
pub mod converters;
pub mod env;
pub mod error;
pub mod expr;
pub mod layer_from;
pub mod layers;
pub mod lexer;
pub mod parser;
pub mod registry;
pub mod types;
pub mod value;
