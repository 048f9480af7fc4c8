//! ST-031: Module files, input validation, and expansion.
//!
//! A module is a reusable set of resource declarations with typed inputs and
//! a declared output contract. When instantiated as `<instance>`, every
//! resource is renamed `<instance>_<name>` and references between the
//! module's own resources follow the rename.

use crate::components::cidr::Ipv4Cidr;
use crate::core::graph::ResourceAddress;
use crate::core::resolver::{resolve_placeholders, resolve_value, rewrite_str, rewrite_value};
use crate::core::types::{Attributes, Value};
use crate::error::EvalError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A module file: metadata, resources and output expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleFile {
    pub module: ModuleMetadata,
    #[serde(default)]
    pub resources: Vec<ModuleResource>,
    /// Output name -> expression
    #[serde(default)]
    pub outputs: IndexMap<String, String>,
}

/// Module metadata, inputs and output contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: IndexMap<String, ModuleInput>,
    /// Outputs the module promises to produce, exactly
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A typed input declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInput {
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
    #[serde(default)]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Int,
    Bool,
    Enum,
    Cidr,
}

/// A resource declaration inside a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleResource {
    #[serde(rename = "resource")]
    pub rtype: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Parse a module from YAML.
pub fn parse_module(yaml: &str) -> Result<ModuleFile, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("module parse error: {}", e))
}

/// Check provided inputs against the declarations and fill defaults.
pub fn validate_inputs(
    meta: &ModuleMetadata,
    provided: &IndexMap<String, Value>,
) -> Result<IndexMap<String, Value>, EvalError> {
    if let Some(unknown) = provided.keys().find(|k| !meta.inputs.contains_key(*k)) {
        return Err(invalid(
            unknown,
            format!("module '{}' declares no such input", meta.name),
        ));
    }

    let mut resolved = IndexMap::new();
    for (name, decl) in &meta.inputs {
        let value = match provided.get(name).or(decl.default.as_ref()) {
            Some(v) => v.clone(),
            None => {
                return Err(invalid(
                    name,
                    format!(
                        "required by module '{}' (type: {:?})",
                        meta.name, decl.input_type
                    ),
                ))
            }
        };
        check_input(name, decl, &value)?;
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

fn invalid(name: &str, reason: impl Into<String>) -> EvalError {
    EvalError::InvalidInput {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn check_input(name: &str, decl: &ModuleInput, value: &Value) -> Result<(), EvalError> {
    match decl.input_type {
        InputType::String => match value {
            Value::Str(_) => Ok(()),
            _ => Err(invalid(name, "must be a string")),
        },
        InputType::Int => {
            let n = value
                .as_i64()
                .ok_or_else(|| invalid(name, "must be an integer"))?;
            if let Some(min) = decl.min.filter(|m| n < *m) {
                return Err(invalid(name, format!("must be >= {}", min)));
            }
            if let Some(max) = decl.max.filter(|m| n > *m) {
                return Err(invalid(name, format!("must be <= {}", max)));
            }
            Ok(())
        }
        InputType::Bool => match value {
            Value::Bool(_) => Ok(()),
            _ => Err(invalid(name, "must be a boolean")),
        },
        InputType::Enum => match value.as_str() {
            Some(s) if decl.choices.is_empty() || decl.choices.iter().any(|c| c == s) => Ok(()),
            Some(_) => Err(invalid(
                name,
                format!("must be one of: {}", decl.choices.join(", ")),
            )),
            None => Err(invalid(name, "must be a string")),
        },
        InputType::Cidr => match value {
            Value::Str(_) if value.is_interpolation() => Ok(()),
            Value::Str(s) => s
                .parse::<Ipv4Cidr>()
                .map(|_| ())
                .map_err(|e| invalid(name, e)),
            _ => Err(invalid(name, "must be a CIDR string")),
        },
    }
}

/// Renames a module's resources into its instance namespace.
#[derive(Debug, Clone)]
pub struct Namespacer {
    instance: String,
    locals: BTreeSet<ResourceAddress>,
}

impl Namespacer {
    pub fn new(instance: &str, module: &ModuleFile) -> Self {
        Self {
            instance: instance.to_string(),
            locals: module
                .resources
                .iter()
                .map(|r| ResourceAddress::new(&r.rtype, &r.name))
                .collect(),
        }
    }

    /// `<instance>_<name>`
    pub fn name(&self, local: &str) -> String {
        format!("{}_{}", self.instance, local)
    }

    pub fn address(&self, rtype: &str, local: &str) -> ResourceAddress {
        ResourceAddress::new(rtype, self.name(local))
    }

    fn rename(&self, target: &crate::core::resolver::RefTarget) -> Option<String> {
        self.locals.contains(&target.address).then(|| {
            self.address(&target.address.rtype, &target.address.name)
                .interpolation(&target.attribute)
        })
    }

    /// Substitute inputs and follow renames throughout a declaration.
    pub fn expand_attributes(
        &self,
        attrs: &Attributes,
        inputs: &IndexMap<String, Value>,
    ) -> Result<Attributes, EvalError> {
        let lookup = input_lookup(inputs);
        let rename = |t: &crate::core::resolver::RefTarget| self.rename(t);
        let mut out = Attributes::new();
        for (key, value) in attrs {
            let value = resolve_value(value, &lookup).map_err(EvalError::Template)?;
            let value = if key == "depends_on" {
                self.rename_depends_on(&value)
            } else {
                rewrite_value(&value, &rename)
            };
            out.insert(key.clone(), value);
        }
        Ok(out)
    }

    fn rename_depends_on(&self, value: &Value) -> Value {
        match value {
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| match item.as_str().map(ResourceAddress::parse) {
                        Some(Ok(addr)) if self.locals.contains(&addr) => {
                            Value::Str(self.address(&addr.rtype, &addr.name).to_string())
                        }
                        _ => item.clone(),
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Evaluate output expressions.
    pub fn expand_outputs(
        &self,
        outputs: &IndexMap<String, String>,
        inputs: &IndexMap<String, Value>,
    ) -> Result<BTreeMap<String, String>, EvalError> {
        let lookup = input_lookup(inputs);
        let rename = |t: &crate::core::resolver::RefTarget| self.rename(t);
        outputs
            .iter()
            .map(|(name, expr)| {
                let resolved = resolve_placeholders(expr, &lookup).map_err(EvalError::Template)?;
                Ok((name.clone(), rewrite_str(&resolved, &rename)))
            })
            .collect()
    }
}

fn input_lookup(inputs: &IndexMap<String, Value>) -> impl Fn(&str) -> Result<Value, String> + '_ {
    move |key: &str| {
        let name = key
            .strip_prefix("inputs.")
            .ok_or_else(|| format!("modules may only reference inputs, found '{{{{{}}}}}'", key))?;
        inputs
            .get(name)
            .cloned()
            .ok_or_else(|| format!("unknown input: {}", name))
    }
}

/// Declared outputs must match produced outputs exactly.
pub fn check_contract(
    meta: &ModuleMetadata,
    produced: &BTreeMap<String, String>,
) -> Result<(), EvalError> {
    let declared: BTreeSet<&str> = meta.outputs.iter().map(String::as_str).collect();
    let missing: Vec<&str> = declared
        .iter()
        .copied()
        .filter(|o| !produced.contains_key(*o))
        .collect();
    let extra: Vec<&str> = produced
        .keys()
        .map(String::as_str)
        .filter(|o| !declared.contains(o))
        .collect();
    if missing.is_empty() && extra.is_empty() {
        return Ok(());
    }
    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("missing declared output(s): {}", missing.join(", ")));
    }
    if !extra.is_empty() {
        problems.push(format!("undeclared output(s): {}", extra.join(", ")));
    }
    Err(EvalError::Contract(format!(
        "module '{}': {}",
        meta.name,
        problems.join("; ")
    )))
}
