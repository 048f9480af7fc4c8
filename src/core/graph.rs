//! ST-004: Resource graph model.
//!
//! Addresses, definitions, references and the order-preserving graph that one
//! evaluation pass builds.

use super::types::Attributes;
use crate::error::{DuplicateResourceError, EvalError};
use crate::providers::{Computed, ResourceSpec};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a resource: `(type, name)`, rendered `type.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceAddress {
    pub rtype: String,
    pub name: String,
}

impl ResourceAddress {
    pub fn new(rtype: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            rtype: rtype.into(),
            name: name.into(),
        }
    }

    /// Parse `type.name`.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.split_once('.') {
            Some((t, n)) if !t.is_empty() && !n.is_empty() && !n.contains('.') => {
                Ok(Self::new(t, n))
            }
            _ => Err(format!("invalid resource address '{}' (expected type.name)", s)),
        }
    }

    /// Interpolation expression for one output attribute.
    pub fn interpolation(&self, attr: &str) -> String {
        format!("${{{}.{}.{}}}", self.rtype, self.name, attr)
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.rtype, self.name)
    }
}

/// Where a definition came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Origin {
    Declaration,
    Component(String),
    Module(String),
}

/// One validated, registered resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    pub address: ResourceAddress,
    /// Owning template
    pub template: String,
    /// Typed spec the attributes were validated into
    pub spec: ResourceSpec,
    /// Flattened IR attributes in emit order
    pub attributes: Attributes,
    /// Merged tags (empty for untaggable types)
    pub tags: BTreeMap<String, String>,
    pub depends_on: Vec<ResourceAddress>,
    pub origin: Origin,
}

/// Read-only handle returned by constructor calls.
///
/// Output values are interpolation expressions, never provisioned values.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceReference {
    address: ResourceAddress,
    outputs: BTreeMap<String, String>,
    computed: Computed,
}

impl ResourceReference {
    pub fn new(address: ResourceAddress, output_names: &[&str], computed: Computed) -> Self {
        let outputs = output_names
            .iter()
            .map(|attr| (attr.to_string(), address.interpolation(attr)))
            .collect();
        Self {
            address,
            outputs,
            computed,
        }
    }

    pub fn address(&self) -> &ResourceAddress {
        &self.address
    }

    pub fn rtype(&self) -> &str {
        &self.address.rtype
    }

    pub fn name(&self) -> &str {
        &self.address.name
    }

    pub fn outputs(&self) -> &BTreeMap<String, String> {
        &self.outputs
    }

    /// Interpolation expression for an output attribute.
    pub fn attr(&self, output: &str) -> Result<String, EvalError> {
        self.outputs
            .get(output)
            .cloned()
            .ok_or_else(|| EvalError::UnknownOutput {
                address: self.address.to_string(),
                output: output.to_string(),
            })
    }

    /// `${type.name.id}`; every type exports `id`.
    pub fn id(&self) -> String {
        self.address.interpolation("id")
    }

    pub fn computed(&self) -> &Computed {
        &self.computed
    }
}

/// Definitions from one evaluation pass, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    definitions: IndexMap<ResourceAddress, ResourceDefinition>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. The first registration of a key wins.
    pub fn insert(&mut self, def: ResourceDefinition) -> Result<(), DuplicateResourceError> {
        if let Some(existing) = self.definitions.get(&def.address) {
            return Err(DuplicateResourceError {
                address: def.address.clone(),
                existing_template: existing.template.clone(),
            });
        }
        self.definitions.insert(def.address.clone(), def);
        Ok(())
    }

    pub fn get(&self, address: &ResourceAddress) -> Option<&ResourceDefinition> {
        self.definitions.get(address)
    }

    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.definitions.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Definitions owned by one template, in declaration order.
    pub fn in_template<'a>(
        &'a self,
        template: &'a str,
    ) -> impl Iterator<Item = &'a ResourceDefinition> + 'a {
        self.definitions
            .values()
            .filter(move |d| d.template == template)
    }

    /// Template names in order of first appearance.
    pub fn templates(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for def in self.definitions.values() {
            if !seen.contains(&def.template) {
                seen.push(def.template.clone());
            }
        }
        seen
    }

    /// Count definitions of one resource type.
    pub fn count_type(&self, rtype: &str) -> usize {
        self.definitions.keys().filter(|a| a.rtype == rtype).count()
    }
}
