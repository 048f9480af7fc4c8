//! ST-005: Template evaluator.
//!
//! Exposes one constructor per registered resource type through
//! [`Evaluator::declare`]: validate the attribute map against the type's
//! schema, register the definition, return a reference. References are built
//! from the address alone, so forward and backward references look the same.

use super::graph::{Origin, ResourceAddress, ResourceDefinition, ResourceGraph, ResourceReference};
use super::types::{Attributes, Value};
use crate::error::{EvalError, ValidationError};
use crate::providers::{AttrReader, Computed, Registry};
use std::collections::BTreeMap;

/// Meta-arguments accepted by every constructor alongside schema attributes.
const META_TAGS: &str = "tags";
const META_DEPENDS_ON: &str = "depends_on";

#[derive(Debug, Clone)]
struct Scope {
    name: String,
    tags: BTreeMap<String, String>,
}

/// One evaluation pass over a namespace (or one module instance).
#[derive(Debug)]
pub struct Evaluator<'r> {
    registry: &'r Registry,
    graph: ResourceGraph,
    template: String,
    base_tags: BTreeMap<String, String>,
    scopes: Vec<Scope>,
    origin: Option<Origin>,
}

impl<'r> Evaluator<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            graph: ResourceGraph::new(),
            template: "default".to_string(),
            base_tags: BTreeMap::new(),
            scopes: Vec::new(),
            origin: None,
        }
    }

    /// Namespace-level tags (lowest precedence).
    pub fn with_base_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.base_tags = tags;
        self
    }

    /// Force every definition's origin (used for module instances).
    pub(crate) fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn set_template(&mut self, template: impl Into<String>) {
        self.template = template.into();
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    pub fn into_graph(self) -> ResourceGraph {
        self.graph
    }

    /// Tags in effect for the next declaration, before declaration-site tags.
    pub fn effective_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.base_tags.clone();
        for scope in &self.scopes {
            tags.extend(scope.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        tags
    }

    /// Constructor call: `rtype(name, attrs) -> ResourceReference`.
    pub fn declare(
        &mut self,
        rtype: &str,
        name: &str,
        attrs: Attributes,
    ) -> Result<ResourceReference, EvalError> {
        let kind = *self.registry.kind(rtype)?;
        let address = ResourceAddress::new(rtype, name);
        let label = address.to_string();
        if !is_symbolic_name(name) {
            return Err(ValidationError::new(
                &label,
                "name",
                "must start with a letter or '_' and contain only letters, digits, '_' or '-'",
            )
            .into());
        }

        let mut attrs = attrs;
        let decl_tags = take_tags(&label, &mut attrs)?;
        let depends_on = take_depends_on(&label, &mut attrs)?;
        if !kind.taggable && !decl_tags.is_empty() {
            return Err(ValidationError::new(&label, META_TAGS, "resource type is not taggable").into());
        }

        let mut reader = AttrReader::new(&label, &attrs);
        let spec = (kind.parse)(&mut reader)?;
        reader.finish()?;

        let tags = if kind.taggable {
            let mut merged = self.effective_tags();
            merged.extend(decl_tags);
            merged
        } else {
            BTreeMap::new()
        };

        let computed = spec.computed();
        let definition = ResourceDefinition {
            address: address.clone(),
            template: self.template.clone(),
            attributes: spec.emit(),
            spec,
            tags,
            depends_on,
            origin: self.current_origin(),
        };
        self.graph.insert(definition)?;
        tracing::trace!(resource = %label, template = %self.template, "registered");
        Ok(ResourceReference::new(address, kind.outputs, computed))
    }

    /// Reference to a resource that may not be declared yet.
    pub fn reference(&self, rtype: &str, name: &str) -> Result<ResourceReference, EvalError> {
        let kind = self.registry.kind(rtype)?;
        let address = ResourceAddress::new(rtype, name);
        let computed = self
            .graph
            .get(&address)
            .map(|d| d.spec.computed())
            .unwrap_or(Computed::Deferred);
        Ok(ResourceReference::new(address, kind.outputs, computed))
    }

    /// Run `body` inside a component scope whose tags apply to everything it
    /// declares. The scope is popped on every exit path.
    pub fn component<T>(
        &mut self,
        name: &str,
        tags: BTreeMap<String, String>,
        body: impl FnOnce(&mut Self) -> Result<T, EvalError>,
    ) -> Result<T, EvalError> {
        self.scopes.push(Scope {
            name: name.to_string(),
            tags,
        });
        let result = body(self);
        self.scopes.pop();
        result
    }

    /// Move an already-validated definition into this graph.
    pub(crate) fn commit(&mut self, definition: ResourceDefinition) -> Result<(), EvalError> {
        self.graph.insert(definition)?;
        Ok(())
    }

    fn current_origin(&self) -> Origin {
        if let Some(origin) = &self.origin {
            return origin.clone();
        }
        match self.scopes.last() {
            Some(scope) => Origin::Component(scope.name.clone()),
            None => Origin::Declaration,
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_-]*`
pub fn is_symbolic_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn take_tags(label: &str, attrs: &mut Attributes) -> Result<BTreeMap<String, String>, ValidationError> {
    match attrs.shift_remove(META_TAGS) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Block(map)) => map
            .into_iter()
            .map(|(k, v)| match v {
                Value::Str(s) => Ok((k, s)),
                other => Err(ValidationError::new(
                    label,
                    format!("{}.{}", META_TAGS, k),
                    format!("tag values must be strings, got {}", other.kind()),
                )),
            })
            .collect(),
        Some(other) => Err(ValidationError::new(
            label,
            META_TAGS,
            format!("must be a map of strings, got {}", other.kind()),
        )),
    }
}

fn take_depends_on(label: &str, attrs: &mut Attributes) -> Result<Vec<ResourceAddress>, ValidationError> {
    match attrs.shift_remove(META_DEPENDS_ON) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::List(items)) => items
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let field = format!("{}[{}]", META_DEPENDS_ON, i);
                let s = v
                    .as_str()
                    .ok_or_else(|| ValidationError::new(label, &field, "must be a string"))?;
                ResourceAddress::parse(s).map_err(|e| ValidationError::new(label, &field, e))
            })
            .collect(),
        Some(other) => Err(ValidationError::new(
            label,
            META_DEPENDS_ON,
            format!("must be a list of addresses, got {}", other.kind()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;

    fn vpc_attrs() -> Attributes {
        attrs! { "cidr_block" => "10.0.0.0/16" }
    }

    #[test]
    fn test_st005_declare_returns_reference_naming_call() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        let r = ev.declare("aws_vpc", "main", vpc_attrs()).unwrap();
        assert_eq!(r.id(), "${aws_vpc.main.id}");
        assert_eq!(r.attr("arn").unwrap(), "${aws_vpc.main.arn}");
        assert_eq!(r.computed().cidr_block(), Some("10.0.0.0/16"));
        assert_eq!(ev.graph().len(), 1);
    }

    #[test]
    fn test_st005_duplicate_declaration_fails() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        ev.declare("aws_vpc", "main", vpc_attrs()).unwrap();
        let err = ev.declare("aws_vpc", "main", vpc_attrs()).unwrap_err();
        assert!(matches!(err, EvalError::Duplicate(_)));
        // same name under another type is a distinct key
        ev.declare("aws_eip", "main", attrs! {}).unwrap();
        assert_eq!(ev.graph().len(), 2);
    }

    #[test]
    fn test_st005_forward_reference_matches_later_declaration() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        let fwd = ev.reference("aws_vpc", "later").unwrap();
        assert_eq!(fwd.computed(), &Computed::Deferred);
        ev.declare(
            "aws_subnet",
            "a",
            attrs! { "vpc_id" => fwd.id(), "cidr_block" => "10.0.0.0/24" },
        )
        .unwrap();
        let back = ev.declare("aws_vpc", "later", vpc_attrs()).unwrap();
        assert_eq!(fwd.outputs(), back.outputs());
        assert!(ev.reference("aws_nope", "x").is_err());
    }

    #[test]
    fn test_st005_validation_error_blocks_registration() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        let err = ev
            .declare("aws_vpc", "main", attrs! { "cidr_block" => "not-a-cidr" })
            .unwrap_err();
        match err {
            EvalError::Validation(v) => {
                assert_eq!(v.resource, "aws_vpc.main");
                assert_eq!(v.field, "cidr_block");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(ev.graph().is_empty());
    }

    #[test]
    fn test_st005_unknown_type_and_bad_name() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        assert!(matches!(
            ev.declare("aws_lambda_function", "f", attrs! {}),
            Err(EvalError::UnknownType(_))
        ));
        assert!(matches!(
            ev.declare("aws_eip", "1bad", attrs! {}),
            Err(EvalError::Validation(_))
        ));
    }

    #[test]
    fn test_st005_tag_precedence() {
        let reg = Registry::builtin();
        let base: BTreeMap<String, String> = [
            ("env".to_string(), "prod".to_string()),
            ("team".to_string(), "core".to_string()),
            ("tier".to_string(), "base".to_string()),
        ]
        .into_iter()
        .collect();
        let mut ev = Evaluator::new(&reg).with_base_tags(base);
        let scope: BTreeMap<String, String> = [
            ("team".to_string(), "net".to_string()),
            ("tier".to_string(), "component".to_string()),
        ]
        .into_iter()
        .collect();
        ev.component("edge", scope, |ev| {
            let mut a = vpc_attrs();
            a.insert(
                "tags".into(),
                Value::Block(attrs! { "tier" => "declared", "Name" => "main" }),
            );
            ev.declare("aws_vpc", "main", a)
        })
        .unwrap();
        let def = ev.graph().iter().next().unwrap();
        assert_eq!(def.tags["env"], "prod");
        assert_eq!(def.tags["team"], "net");
        assert_eq!(def.tags["tier"], "declared");
        assert_eq!(def.tags["Name"], "main");
        assert_eq!(def.origin, Origin::Component("edge".into()));
        assert!(!def.attributes.contains_key("tags"));
    }

    #[test]
    fn test_st005_component_scope_popped_on_error() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        let scope: BTreeMap<String, String> = [("k".to_string(), "v".to_string())].into();
        let result: Result<(), EvalError> =
            ev.component("broken", scope, |_| Err(EvalError::Template("boom".into())));
        assert!(result.is_err());
        assert!(ev.effective_tags().is_empty());
        ev.declare("aws_vpc", "after", vpc_attrs()).unwrap();
        assert_eq!(ev.graph().iter().next().unwrap().origin, Origin::Declaration);
    }

    #[test]
    fn test_st005_depends_on_meta_argument() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        let mut a = attrs! {};
        a.insert(
            "depends_on".into(),
            Value::List(vec![Value::from("aws_internet_gateway.gw")]),
        );
        ev.declare("aws_eip", "nat", a).unwrap();
        let def = ev.graph().iter().next().unwrap();
        assert_eq!(def.depends_on, vec![ResourceAddress::new("aws_internet_gateway", "gw")]);

        let mut bad = attrs! {};
        bad.insert("depends_on".into(), Value::List(vec![Value::from("nodot")]));
        let err = ev.declare("aws_eip", "other", bad).unwrap_err();
        assert!(matches!(err, EvalError::Validation(v) if v.field == "depends_on[0]"));
    }

    #[test]
    fn test_st005_templates_are_tracked() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        ev.set_template("network");
        ev.declare("aws_vpc", "main", vpc_attrs()).unwrap();
        ev.set_template("storage");
        ev.declare("aws_s3_bucket", "logs", attrs! { "bucket" => "acme-logs" }).unwrap();
        assert_eq!(ev.graph().templates(), vec!["network", "storage"]);
    }

    #[test]
    fn test_st005_symbolic_names() {
        assert!(is_symbolic_name("main"));
        assert!(is_symbolic_name("_x-1"));
        assert!(!is_symbolic_name(""));
        assert!(!is_symbolic_name("a.b"));
        assert!(!is_symbolic_name("9a"));
    }
}
