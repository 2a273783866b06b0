//! Model Registry: resolves a unified model name to the provider-specific
//! model identifier.
//!
//! The registry is just a read view over the [`ModelMapping`] built at
//! startup from config, there's no separate runtime state to own, so
//! this module re-exports the type under the name the component table uses.

pub use crate::config::{ModelMapping as ModelRegistry, Resolution};
