//! strata: resource-graph synthesis and state coordination for
//! infrastructure as code.
//!
//! Typed resource declarations are validated into a graph, compiled to the
//! provisioning engine's JSON configuration, and applied under a per-template
//! state lock.

pub mod audit;
pub mod cli;
pub mod components;
pub mod core;
pub mod engine;
pub mod error;
pub mod providers;
pub mod sandbox;
pub mod state;
