//! ST-007: Template declarations.
//!
//! Drives the [`Evaluator`] from the YAML declarations of every template in
//! a namespace. Placeholders are substituted before each declaration runs:
//!
//! - `{{params.key}}`: namespace parameter
//! - `{{module.instance.output}}`: output of an earlier module instance
//! - `{{component.name.field}}`: field of an earlier component
//!
//! Module failures are collected on the result rather than aborting, so one
//! broken module does not hide errors in the rest of the namespace.

use super::evaluator::Evaluator;
use super::graph::ResourceGraph;
use super::resolver;
use super::types::{Attributes, Declaration, ModuleDecl, NamespaceConfig, Value};
use crate::components::{self, ComponentFields};
use crate::error::{Error, EvalError, ModuleError, ModuleFetchError, Result};
use crate::providers::Registry;
use crate::sandbox::cache::{CachedModule, ModuleCache, ModuleDescriptor};
use crate::sandbox::{ModuleCall, Sandbox};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything a namespace evaluation produced.
#[derive(Debug)]
pub struct NamespaceEvaluation {
    pub graph: ResourceGraph,
    /// Templates in declaration order
    pub templates: Vec<String>,
    pub module_outputs: BTreeMap<String, BTreeMap<String, String>>,
    pub component_fields: BTreeMap<String, ComponentFields>,
    pub module_errors: Vec<ModuleError>,
}

impl NamespaceEvaluation {
    /// Refuse to go further while any module failed.
    pub fn ensure_clean(&self) -> Result<()> {
        if self.module_errors.is_empty() {
            Ok(())
        } else {
            Err(Error::ModulesFailed(
                self.module_errors.iter().map(ToString::to_string).collect(),
            ))
        }
    }
}

pub fn descriptor(decl: &ModuleDecl) -> ModuleDescriptor {
    ModuleDescriptor {
        source: decl.source.clone(),
        version: decl.version.clone(),
        checksum: decl.checksum.clone(),
    }
}

/// Every module declaration in the namespace, in order.
fn module_decls(config: &NamespaceConfig) -> impl Iterator<Item = &ModuleDecl> {
    config.templates.values().flat_map(|t| {
        t.declare.iter().filter_map(|d| match d {
            Declaration::Module(m) => Some(m),
            _ => None,
        })
    })
}

struct Substitutions<'c> {
    params: &'c IndexMap<String, Value>,
    modules: BTreeMap<String, BTreeMap<String, String>>,
    components: BTreeMap<String, ComponentFields>,
}

impl Substitutions<'_> {
    fn lookup(&self, key: &str) -> std::result::Result<Value, String> {
        let mut parts = key.splitn(3, '.');
        let (scope, first, rest) = (parts.next(), parts.next(), parts.next());
        match (scope, first, rest) {
            (Some("params"), Some(name), None) => self
                .params
                .get(name)
                .cloned()
                .ok_or_else(|| format!("unknown parameter '{}'", name)),
            (Some("module"), Some(instance), Some(output)) => self
                .modules
                .get(instance)
                .ok_or_else(|| format!("module '{}' is not declared before this point", instance))?
                .get(output)
                .map(|v| Value::from(v.as_str()))
                .ok_or_else(|| format!("module '{}' has no output '{}'", instance, output)),
            (Some("component"), Some(name), Some(field)) => self
                .components
                .get(name)
                .ok_or_else(|| format!("component '{}' is not declared before this point", name))?
                .get(field)
                .map(|v| Value::from(v.as_str()))
                .ok_or_else(|| format!("component '{}' has no field '{}'", name, field)),
            _ => Err(format!("unknown placeholder '{{{{{}}}}}'", key)),
        }
    }

    fn attributes(&self, label: &str, attrs: &Attributes) -> std::result::Result<Attributes, EvalError> {
        attrs
            .iter()
            .map(|(k, v)| {
                resolver::resolve_value(v, &|key| self.lookup(key))
                    .map(|v| (k.clone(), v))
                    .map_err(|e| EvalError::Template(format!("{}: {}", label, e)))
            })
            .collect()
    }
}

/// Evaluate every template of `config` into one graph.
pub fn evaluate_namespace(
    config: &NamespaceConfig,
    registry: &Registry,
    cache: &ModuleCache,
    sandbox: Sandbox,
) -> Result<NamespaceEvaluation> {
    let descriptors: Vec<ModuleDescriptor> = module_decls(config).map(descriptor).collect();
    let mut fetched: BTreeMap<String, std::result::Result<Arc<CachedModule>, ModuleFetchError>> =
        BTreeMap::new();
    if !descriptors.is_empty() {
        tracing::info!(count = descriptors.len(), "fetching modules");
        for (d, result) in descriptors.iter().zip(cache.prefetch(&descriptors)) {
            fetched.insert(d.fetch_key(), result);
        }
    }

    let mut ev = Evaluator::new(registry).with_base_tags(config.tags.clone());
    let mut subs = Substitutions {
        params: &config.params,
        modules: BTreeMap::new(),
        components: BTreeMap::new(),
    };
    let mut module_errors = Vec::new();

    for (template, body) in &config.templates {
        ev.set_template(template.as_str());
        for decl in &body.declare {
            let label = decl.label();
            match decl {
                Declaration::Resource(r) => {
                    let attrs = subs.attributes(&label, &r.attributes)?;
                    ev.declare(&r.rtype, &r.name, attrs)?;
                }
                Declaration::Component(c) => {
                    let inputs = subs.attributes(&label, &c.inputs)?;
                    let fields = components::invoke(&mut ev, &c.component, &c.name, &inputs, c.tags.clone())?;
                    subs.components.insert(c.name.clone(), fields);
                }
                Declaration::Module(m) => {
                    let desc = descriptor(m);
                    let cached = match fetched.get(&desc.fetch_key()) {
                        Some(result) => result.clone(),
                        None => cache.get(&desc),
                    };
                    let cached = match cached {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::warn!(module = %m.module, error = %e, "module fetch failed");
                            module_errors.push(ModuleError::Fetch(e));
                            continue;
                        }
                    };
                    let inputs: IndexMap<String, Value> = m
                        .inputs
                        .iter()
                        .map(|(k, v)| {
                            resolver::resolve_value(v, &|key| subs.lookup(key))
                                .map(|v| (k.clone(), v))
                                .map_err(|e| EvalError::Template(format!("{}: {}", label, e)))
                        })
                        .collect::<std::result::Result<_, _>>()?;
                    let identity = desc.identity();
                    let call = ModuleCall {
                        instance: &m.module,
                        identity: &identity,
                        module: &cached.file,
                        inputs: &inputs,
                        allow: &m.allow,
                    };
                    match sandbox.run(&mut ev, call) {
                        Ok(outcome) => {
                            tracing::debug!(module = %m.module, resources = outcome.committed.len(), "module evaluated");
                            subs.modules.insert(m.module.clone(), outcome.outputs);
                        }
                        Err(e) => {
                            tracing::warn!(module = %m.module, error = %e, "module evaluation failed");
                            module_errors.push(ModuleError::Evaluation(e));
                        }
                    }
                }
            }
        }
    }

    Ok(NamespaceEvaluation {
        graph: ev.into_graph(),
        templates: config.templates.keys().cloned().collect(),
        module_outputs: subs.modules,
        component_fields: subs.components,
        module_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::{Origin, ResourceAddress};
    use crate::core::types::ComponentDecl;
    use crate::sandbox::cache::tests::CountingFetcher;
    use crate::sandbox::module::tests::NFS;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(yaml: &str) -> NamespaceConfig {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn cache(dir: &std::path::Path, content: &str) -> (ModuleCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = CountingFetcher {
            content: content.to_string(),
            calls: Arc::clone(&calls),
            delay: Duration::from_millis(0),
        };
        (ModuleCache::new(dir, Box::new(fetcher)), calls)
    }

    const NAMESPACE: &str = r#"
version: "1.0"
namespace: prod
tags: { team: platform }
params:
  cidr: 10.0.0.0/16
  bucket: strata-prod-logs
templates:
  network:
    declare:
      - component: vpc
        name: core
        inputs:
          cidr_block: "{{params.cidr}}"
          availability_zones: [us-east-1a, us-east-1b]
      - resource: aws_vpc
        name: shared
        attributes:
          cidr_block: 10.1.0.0/16
  storage:
    declare:
      - module: nfs
        source: { path: modules/nfs.yaml }
        version: "1.0"
        allow: [aws_security_group, aws_instance]
        inputs:
          subnet_id: "{{component.core.private_subnet_id.0}}"
      - resource: aws_s3_bucket
        name: logs
        attributes:
          bucket: "{{params.bucket}}"
          tags:
            server: "{{module.nfs.server_id}}"
"#;

    #[test]
    fn test_st007_evaluates_all_declaration_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, calls) = cache(dir.path(), NFS);
        let reg = Registry::builtin();
        let result = evaluate_namespace(&config(NAMESPACE), &reg, &cache, Sandbox::default()).unwrap();
        result.ensure_clean().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.templates, vec!["network", "storage"]);

        let g = &result.graph;
        assert_eq!(g.count_type("aws_subnet"), 4);
        let vpc = g.get(&ResourceAddress::new("aws_vpc", "core")).unwrap();
        assert_eq!(vpc.template, "network");
        assert_eq!(vpc.tags["team"], "platform");

        let server = g.get(&ResourceAddress::new("aws_instance", "nfs_server")).unwrap();
        assert_eq!(server.template, "storage");
        assert_eq!(server.origin, Origin::Module("nfs".into()));
        assert_eq!(
            server.attributes["subnet_id"],
            Value::from("${aws_subnet.core_private_0.id}")
        );

        let logs = g.get(&ResourceAddress::new("aws_s3_bucket", "logs")).unwrap();
        assert_eq!(logs.attributes["bucket"], Value::from("strata-prod-logs"));
        assert_eq!(logs.tags["server"], "${aws_instance.nfs_server.id}");
        assert_eq!(
            result.module_outputs["nfs"]["sg_id"],
            "${aws_security_group.nfs_sg.id}"
        );
    }

    #[test]
    fn test_st007_module_failure_is_collected() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache(dir.path(), NFS);
        let reg = Registry::builtin();
        let mut cfg = config(NAMESPACE);
        // drop the instance grant so the module fails at its second resource
        if let Declaration::Module(m) = &mut cfg.templates["storage"].declare[0] {
            m.allow = vec!["aws_security_group".into()];
        }
        // nothing downstream may read the failed module's outputs
        cfg.templates["storage"].declare.truncate(1);

        let result = evaluate_namespace(&cfg, &reg, &cache, Sandbox::default()).unwrap();
        assert_eq!(result.module_errors.len(), 1);
        match &result.module_errors[0] {
            ModuleError::Evaluation(e) => assert_eq!(e.resource, "aws_instance.nfs_server"),
            other => panic!("expected evaluation error, got {:?}", other),
        }
        // declarations outside the module are intact
        assert!(result.graph.contains(&ResourceAddress::new("aws_vpc", "core")));
        let err = result.ensure_clean().unwrap_err();
        assert!(matches!(err, Error::ModulesFailed(ref errs) if errs.len() == 1));
    }

    #[test]
    fn test_st007_fetch_failure_is_collected() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache(dir.path(), "not: [a module");
        let reg = Registry::builtin();
        let result = evaluate_namespace(&config(NAMESPACE), &reg, &cache, Sandbox::default());
        // the bucket reads an output of the unfetched module
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Eval(EvalError::Template(ref m)) if m.contains("nfs")));
    }

    #[test]
    fn test_st007_unknown_param() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache(dir.path(), NFS);
        let reg = Registry::builtin();
        let mut cfg = config(NAMESPACE);
        cfg.templates["network"].declare = vec![Declaration::Component(ComponentDecl {
            component: "vpc".into(),
            name: "core".into(),
            inputs: crate::attrs! { "cidr_block" => "{{params.missing}}" },
            tags: BTreeMap::new(),
        })];
        cfg.templates.shift_remove("storage");
        let err = evaluate_namespace(&cfg, &reg, &cache, Sandbox::default()).unwrap_err();
        match err {
            Error::Eval(EvalError::Template(msg)) => {
                assert!(msg.contains("component vpc.core"));
                assert!(msg.contains("unknown parameter 'missing'"));
            }
            other => panic!("expected template error, got {:?}", other),
        }
    }

    #[test]
    fn test_st007_validation_error_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache(dir.path(), NFS);
        let reg = Registry::builtin();
        let cfg = config(
            r#"
version: "1.0"
namespace: prod
templates:
  app:
    declare:
      - resource: aws_subnet
        name: a
        attributes: { cidr_block: 10.0.1.0/24 }
"#,
        );
        let err = evaluate_namespace(&cfg, &reg, &cache, Sandbox::default()).unwrap_err();
        assert!(matches!(err, Error::Eval(EvalError::Validation(ref v)) if v.to_string().contains("vpc_id")));
    }
}
