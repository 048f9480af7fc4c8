//! ST-006: Deterministic IR synthesis.
//!
//! Compiles one template's slice of a validated resource graph into the
//! engine's JSON configuration syntax. Resources are emitted as an array in
//! declaration order. References into other templates of the namespace are
//! rewritten to input variables; the owning template exports a matching
//! output, and the orchestrator wires values between them at apply time.

use super::graph::ResourceGraph;
use super::resolver::{self, RefTarget};
use crate::audit::hasher;
use crate::error::{Error, Result};
use serde_json::{json, Map, Value as Json};
use std::collections::BTreeMap;

/// Recorded in state; the IR itself carries no version so upgrades do not
/// change its bytes.
pub const GENERATOR: &str = concat!("strata ", env!("CARGO_PKG_VERSION"));

/// Name of the variable/output pair carrying one cross-template value.
pub fn xref_name(target: &RefTarget) -> String {
    let attr: String = target
        .attribute
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!(
        "xref__{}__{}__{}",
        target.address.rtype, target.address.name, attr
    )
}

/// A value this template needs from another template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub variable: String,
    pub upstream: String,
}

/// Namespace-level settings every IR carries.
#[derive(Debug, Clone, Default)]
pub struct SynthOptions {
    pub namespace: String,
    pub providers: BTreeMap<String, Json>,
}

/// Synthesized engine configuration for one template.
#[derive(Debug, Clone)]
pub struct Ir {
    template: String,
    document: Json,
    bytes: Vec<u8>,
    imports: Vec<Import>,
    exports: Vec<String>,
}

impl Ir {
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn document(&self) -> &Json {
        &self.document
    }

    /// Exact bytes written to `main.tf.json`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn fingerprint(&self) -> String {
        hasher::hash_bytes(&self.bytes)
    }

    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn resource_count(&self) -> usize {
        self.document
            .get("resource")
            .and_then(Json::as_array)
            .map_or(0, Vec::len)
    }
}

/// Synthesize `template` from `graph`. The whole graph is validated first,
/// so a dangling reference anywhere in the namespace fails every template.
pub fn synthesize(graph: &ResourceGraph, template: &str, options: &SynthOptions) -> Result<Ir> {
    resolver::validate_graph(graph)?;

    let owner_of = |t: &RefTarget| graph.get(&t.address).map(|d| d.template.as_str());

    // Values this template reads from elsewhere.
    let mut imports: BTreeMap<String, String> = BTreeMap::new();
    for def in graph.in_template(template) {
        for target in resolver::definition_references(def) {
            if let Some(upstream) = owner_of(&target).filter(|o| *o != template) {
                imports.insert(xref_name(&target), upstream.to_string());
            }
        }
    }

    // Values other templates read from here.
    let mut exports: BTreeMap<String, String> = BTreeMap::new();
    for def in graph.iter().filter(|d| d.template != template) {
        for target in resolver::definition_references(def) {
            if owner_of(&target) == Some(template) {
                let expr = format!(
                    "${{{}.{}}}",
                    target.address, target.attribute
                );
                exports.insert(xref_name(&target), expr);
            }
        }
    }

    let rewrite = |t: &RefTarget| -> Option<String> {
        match owner_of(t) {
            Some(owner) if owner != template => Some(format!("${{var.{}}}", xref_name(t))),
            _ => None,
        }
    };

    let mut resources = Vec::new();
    for def in graph.in_template(template) {
        let mut body = Map::new();
        for (key, value) in &def.attributes {
            body.insert(key.clone(), resolver::rewrite_value(value, &rewrite).to_json());
        }
        if !def.tags.is_empty() {
            let tags: Map<String, Json> = def
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), Json::String(resolver::rewrite_str(v, &rewrite))))
                .collect();
            body.insert("tags".to_string(), Json::Object(tags));
        }
        // Cross-template ordering is the orchestrator's job.
        let local_deps: Vec<Json> = def
            .depends_on
            .iter()
            .filter(|d| graph.get(d).is_some_and(|t| t.template == template))
            .map(|d| Json::String(d.to_string()))
            .collect();
        if !local_deps.is_empty() {
            body.insert("depends_on".to_string(), Json::Array(local_deps));
        }
        let mut named = Map::new();
        named.insert(def.address.name.clone(), Json::Object(body));
        let mut typed = Map::new();
        typed.insert(def.address.rtype.clone(), Json::Object(named));
        resources.push(Json::Object(typed));
    }

    let mut doc = Map::new();
    doc.insert(
        "//".to_string(),
        json!({ "strata": {
            "namespace": options.namespace,
            "template": template,
            "generator": "strata",
        }}),
    );
    if !options.providers.is_empty() {
        let providers: Map<String, Json> = options
            .providers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        doc.insert("provider".to_string(), Json::Object(providers));
    }
    if !imports.is_empty() {
        let vars: Map<String, Json> = imports
            .keys()
            .map(|name| (name.clone(), json!({ "type": "string" })))
            .collect();
        doc.insert("variable".to_string(), Json::Object(vars));
    }
    doc.insert("resource".to_string(), Json::Array(resources));
    if !exports.is_empty() {
        let outputs: Map<String, Json> = exports
            .iter()
            .map(|(name, expr)| (name.clone(), json!({ "value": expr })))
            .collect();
        doc.insert("output".to_string(), Json::Object(outputs));
    }

    let document = Json::Object(doc);
    let mut bytes = serde_json::to_vec_pretty(&document).map_err(Error::Serialize)?;
    bytes.push(b'\n');

    Ok(Ir {
        template: template.to_string(),
        document,
        bytes,
        imports: imports
            .into_iter()
            .map(|(variable, upstream)| Import { variable, upstream })
            .collect(),
        exports: exports.into_keys().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::components::vpc::{vpc, VpcArgs};
    use crate::core::evaluator::Evaluator;
    use crate::core::types::Value;
    use crate::providers::Registry;
    use proptest::prelude::*;

    fn opts() -> SynthOptions {
        SynthOptions {
            namespace: "prod".into(),
            providers: [("aws".to_string(), json!({ "region": "us-east-1" }))].into(),
        }
    }

    fn network_graph() -> ResourceGraph {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        ev.set_template("network");
        vpc(&mut ev, "core", &VpcArgs::new("10.0.0.0/16", &["us-east-1a", "us-east-1b"])).unwrap();
        ev.into_graph()
    }

    #[test]
    fn test_st006_same_graph_same_bytes() {
        let g = network_graph();
        let a = synthesize(&g, "network", &opts()).unwrap();
        let b = synthesize(&g, "network", &opts()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.fingerprint(), b.fingerprint());
        // re-evaluation of identical declarations is byte-identical as well
        let c = synthesize(&network_graph(), "network", &opts()).unwrap();
        assert_eq!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_st006_resources_in_declaration_order() {
        let ir = synthesize(&network_graph(), "network", &opts()).unwrap();
        let names: Vec<String> = ir.document()["resource"]
            .as_array()
            .unwrap()
            .iter()
            .map(|block| {
                let (rtype, inner) = block.as_object().unwrap().iter().next().unwrap();
                let name = inner.as_object().unwrap().keys().next().unwrap();
                format!("{}.{}", rtype, name)
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "aws_vpc.core",
                "aws_internet_gateway.core_igw",
                "aws_subnet.core_public_0",
                "aws_subnet.core_private_0",
                "aws_eip.core_nat_eip_0",
                "aws_nat_gateway.core_nat_0",
                "aws_subnet.core_public_1",
                "aws_subnet.core_private_1",
                "aws_eip.core_nat_eip_1",
                "aws_nat_gateway.core_nat_1",
            ]
        );
        assert_eq!(ir.resource_count(), 10);
        assert_eq!(ir.document()["provider"]["aws"]["region"], "us-east-1");
    }

    #[test]
    fn test_st006_nested_and_repeated_blocks() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        ev.set_template("app");
        let mut a = attrs! { "ami" => "ami-1", "instance_type" => "t3.micro" };
        a.insert("root_block_device".into(), Value::Block(attrs! { "volume_size" => 20_i64 }));
        a.insert(
            "ebs_block_device".into(),
            Value::List(vec![
                Value::Block(attrs! { "device_name" => "/dev/sdf" }),
                Value::Block(attrs! { "device_name" => "/dev/sdg" }),
            ]),
        );
        a.insert("tags".into(), Value::Block(attrs! { "Name" => "web" }));
        ev.declare("aws_instance", "web", a).unwrap();
        let ir = synthesize(&ev.into_graph(), "app", &SynthOptions::default()).unwrap();
        let web = &ir.document()["resource"][0]["aws_instance"]["web"];
        assert_eq!(web["root_block_device"]["volume_size"], 20);
        assert_eq!(web["ebs_block_device"][1]["device_name"], "/dev/sdg");
        assert_eq!(web["tags"]["Name"], "web");
        assert!(ir.document().get("provider").is_none());
    }

    #[test]
    fn test_st006_unresolved_reference_aborts() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        let ghost = ev.reference("aws_vpc", "ghost").unwrap();
        ev.declare("aws_internet_gateway", "gw", attrs! { "vpc_id" => ghost.id() }).unwrap();
        let err = synthesize(&ev.into_graph(), "default", &opts()).unwrap_err();
        assert!(matches!(err, Error::Unresolved(e) if e.target == "aws_vpc.ghost"));
    }

    #[test]
    fn test_st006_cross_template_variables_and_outputs() {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        ev.set_template("network");
        let net = ev.declare("aws_vpc", "main", attrs! { "cidr_block" => "10.0.0.0/16" }).unwrap();
        ev.set_template("app");
        ev.declare(
            "aws_security_group",
            "web",
            attrs! { "vpc_id" => net.id(), "description" => "in ${aws_vpc.main.cidr_block}" },
        )
        .unwrap();
        let graph = ev.into_graph();

        let app = synthesize(&graph, "app", &opts()).unwrap();
        let sg = &app.document()["resource"][0]["aws_security_group"]["web"];
        assert_eq!(sg["vpc_id"], "${var.xref__aws_vpc__main__id}");
        assert_eq!(sg["description"], "in ${var.xref__aws_vpc__main__cidr_block}");
        assert_eq!(
            app.imports(),
            &[
                Import { variable: "xref__aws_vpc__main__cidr_block".into(), upstream: "network".into() },
                Import { variable: "xref__aws_vpc__main__id".into(), upstream: "network".into() },
            ]
        );
        assert!(app.document()["variable"]["xref__aws_vpc__main__id"].is_object());

        let network = synthesize(&graph, "network", &opts()).unwrap();
        assert_eq!(
            network.document()["output"]["xref__aws_vpc__main__id"]["value"],
            "${aws_vpc.main.id}"
        );
        assert_eq!(network.exports().len(), 2);
        assert!(network.imports().is_empty());
    }

    #[test]
    fn test_st006_xref_name_sanitizes_paths() {
        let t = resolver::parse_target("${aws_instance.web.ebs_block_device.0.id}").unwrap();
        assert_eq!(xref_name(&t), "xref__aws_instance__web__ebs_block_device_0_id");
    }

    proptest! {
        #[test]
        fn prop_st006_synthesis_is_deterministic(
            octet in 0u8..=255,
            zones in proptest::collection::vec("[a-f]", 1..4),
        ) {
            let cidr = format!("10.{}.0.0/16", octet);
            let zone_names: Vec<String> = zones.iter().map(|z| format!("us-west-2{}", z)).collect();
            let zone_refs: Vec<&str> = zone_names.iter().map(String::as_str).collect();
            let build = || {
                let reg = Registry::builtin();
                let mut ev = Evaluator::new(&reg);
                ev.set_template("net");
                vpc(&mut ev, "core", &VpcArgs::new(&cidr, &zone_refs)).unwrap();
                synthesize(&ev.into_graph(), "net", &opts()).unwrap()
            };
            let (a, b) = (build(), build());
            prop_assert_eq!(a.as_bytes(), b.as_bytes());
        }
    }
}
