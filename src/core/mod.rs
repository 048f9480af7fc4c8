//! Core pipeline: types, evaluation, resolution, synthesis, orchestration.

pub mod cost;
pub mod evaluator;
pub mod graph;
pub mod orchestrator;
pub mod parser;
pub mod project;
pub mod resolver;
pub mod synth;
pub mod template;
pub mod types;
