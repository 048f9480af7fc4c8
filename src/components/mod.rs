//! ST-020: Higher-level components composed from primitive constructors.

pub mod cidr;
pub mod vpc;

use crate::core::evaluator::Evaluator;
use crate::core::types::Attributes;
use crate::error::EvalError;
use std::collections::BTreeMap;

/// Derived fields a component exposes to later declarations.
pub type ComponentFields = BTreeMap<String, String>;

type InvokeFn = fn(
    &mut Evaluator<'_>,
    &str,
    &Attributes,
    BTreeMap<String, String>,
) -> Result<ComponentFields, EvalError>;

/// A named component available to declarations.
#[derive(Debug, Clone, Copy)]
pub struct ComponentKind {
    pub name: &'static str,
    pub invoke: InvokeFn,
}

pub static COMPONENTS: &[ComponentKind] = &[ComponentKind {
    name: "vpc",
    invoke: vpc::invoke,
}];

/// Run component `kind` as `name` with `inputs`, under scope `tags`.
pub fn invoke(
    ev: &mut Evaluator<'_>,
    kind: &str,
    name: &str,
    inputs: &Attributes,
    tags: BTreeMap<String, String>,
) -> Result<ComponentFields, EvalError> {
    let component = COMPONENTS
        .iter()
        .find(|c| c.name == kind)
        .ok_or_else(|| EvalError::UnknownComponent(kind.to_string()))?;
    (component.invoke)(ev, name, inputs, tags)
}
