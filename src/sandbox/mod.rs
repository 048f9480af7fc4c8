//! ST-030: Module sandbox.
//!
//! A module instance evaluates in its own [`Evaluator`] over a registry that
//! grants only the resource types the parent allowed. The child never sees
//! the parent's graph; its definitions reach the parent only through
//! [`Sandbox::run`], after the output contract is checked. A failing module
//! produces one [`ModuleEvaluationError`] and leaves the parent's own
//! definitions untouched.

pub mod cache;
pub mod module;

use crate::core::evaluator::Evaluator;
use crate::core::graph::{Origin, ResourceAddress};
use crate::core::types::Value;
use crate::error::{DuplicateResourceError, EvalError, ModuleEvaluationError};
use indexmap::IndexMap;
use module::{ModuleFile, Namespacer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What happens to a failing module's already-validated resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleIsolation {
    /// Resources declared before the failure are committed
    #[default]
    KeepValidated,
    /// Nothing from the failing module is committed
    DiscardPartial,
}

/// A module instance to evaluate.
#[derive(Debug, Clone, Copy)]
pub struct ModuleCall<'a> {
    /// Instance name (prefixes every resource)
    pub instance: &'a str,
    /// `source@version`, for error messages
    pub identity: &'a str,
    pub module: &'a ModuleFile,
    pub inputs: &'a IndexMap<String, Value>,
    /// Resource types granted to the module
    pub allow: &'a [String],
}

/// A successful module evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleOutcome {
    /// Output name -> expression, per the declared contract
    pub outputs: BTreeMap<String, String>,
    /// Definitions committed to the parent, in declaration order
    pub committed: Vec<ResourceAddress>,
}

/// Evaluates module instances into a parent evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sandbox {
    isolation: ModuleIsolation,
}

impl Sandbox {
    pub fn new(isolation: ModuleIsolation) -> Self {
        Self { isolation }
    }

    pub fn isolation(&self) -> ModuleIsolation {
        self.isolation
    }

    pub fn run(
        &self,
        parent: &mut Evaluator<'_>,
        call: ModuleCall<'_>,
    ) -> Result<ModuleOutcome, ModuleEvaluationError> {
        let label = format!("{} ({})", call.instance, call.identity);
        let setup_error = |resource: &str, cause: EvalError| ModuleEvaluationError {
            module: label.clone(),
            resource: resource.to_string(),
            cause,
            kept: Vec::new(),
            discarded: Vec::new(),
        };

        let registry = parent
            .registry()
            .restrict(call.instance, call.allow)
            .map_err(|e| setup_error("<allow>", e))?;
        let inputs = module::validate_inputs(&call.module.module, call.inputs)
            .map_err(|e| setup_error("<inputs>", e))?;

        let namespacer = Namespacer::new(call.instance, call.module);
        let mut child = Evaluator::new(&registry)
            .with_base_tags(parent.effective_tags())
            .with_origin(Origin::Module(call.instance.to_string()));
        child.set_template(parent.template());

        let mut failure: Option<(String, EvalError)> = None;
        for resource in &call.module.resources {
            let address = namespacer.address(&resource.rtype, &resource.name);
            let declared = namespacer
                .expand_attributes(&resource.attributes, &inputs)
                .and_then(|attrs| child.declare(&resource.rtype, &address.name, attrs));
            if let Err(e) = declared {
                failure = Some((address.to_string(), e));
                break;
            }
        }

        let mut outputs = BTreeMap::new();
        if failure.is_none() {
            match namespacer
                .expand_outputs(&call.module.outputs, &inputs)
                .and_then(|o| module::check_contract(&call.module.module, &o).map(|()| o))
            {
                Ok(o) => outputs = o,
                Err(e) => failure = Some(("<outputs>".to_string(), e)),
            }
        }

        let validated = child.into_graph();
        let all: Vec<ResourceAddress> = validated.iter().map(|d| d.address.clone()).collect();
        let keep = failure.is_none() || self.isolation == ModuleIsolation::KeepValidated;

        // Commit all-or-nothing: a name clash with the parent drops the lot.
        let mut committed = Vec::new();
        if keep {
            let clash = validated
                .iter()
                .map(|d| &d.address)
                .find(|a| parent.graph().contains(a))
                .cloned();
            match clash {
                Some(address) => {
                    let existing_template = parent
                        .graph()
                        .get(&address)
                        .map(|d| d.template.clone())
                        .unwrap_or_default();
                    // a clash outranks any earlier failure
                    failure = Some((
                        address.to_string(),
                        EvalError::Duplicate(DuplicateResourceError {
                            address,
                            existing_template,
                        }),
                    ));
                }
                None => {
                    for definition in validated.iter().cloned() {
                        let address = definition.address.clone();
                        if let Err(e) = parent.commit(definition) {
                            failure = Some((address.to_string(), e));
                            break;
                        }
                        committed.push(address);
                    }
                }
            }
        }

        match failure {
            None => {
                tracing::debug!(module = %label, resources = committed.len(), "module committed");
                Ok(ModuleOutcome { outputs, committed })
            }
            Some((resource, cause)) => {
                let discarded = all
                    .into_iter()
                    .filter(|a| !committed.contains(a))
                    .collect();
                tracing::warn!(module = %label, %resource, error = %cause, "module failed");
                Err(ModuleEvaluationError {
                    module: label,
                    resource,
                    cause,
                    kept: committed,
                    discarded,
                })
            }
        }
    }
}
