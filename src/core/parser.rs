//! ST-002: Namespace file parsing and validation.
//!
//! Parses strata.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Namespace and template names are path-safe
//! - Backend, lock and engine parameters are usable
//! - Module declarations carry a well-formed pinned source
//!
//! Per-resource attribute rules are the provider schemas' job and run at
//! evaluation time.

use super::evaluator::is_symbolic_name;
use super::types::{BackendConfig, Declaration, ModuleDecl, NamespaceConfig};
use crate::components::COMPONENTS;
use crate::error::ConfigError;
use crate::sandbox::cache::ModuleSource;
use std::collections::BTreeSet;
use std::path::Path;

/// Parse a strata.yaml file from disk.
pub fn parse_namespace_file(path: &Path) -> Result<NamespaceConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_namespace(&content)
}

/// Parse a strata.yaml from a string.
pub fn parse_namespace(yaml: &str) -> Result<NamespaceConfig, ConfigError> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Parse and validate in one step.
pub fn load_namespace(path: &Path) -> Result<NamespaceConfig, ConfigError> {
    let config = parse_namespace_file(path)?;
    let errors = validate_namespace(&config);
    if !errors.is_empty() {
        return Err(ConfigError::Invalid(errors));
    }
    tracing::debug!(namespace = %config.namespace, templates = config.templates.len(), "namespace loaded");
    Ok(config)
}

/// `[A-Za-z0-9_-]+`, usable as a single path component.
fn is_path_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_blake3_pin(checksum: &str) -> bool {
    checksum
        .strip_prefix("blake3:")
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Validate a parsed namespace. Returns a list of errors (empty = valid).
pub fn validate_namespace(config: &NamespaceConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!("version must be \"1.0\", got \"{}\"", config.version));
    }

    if config.namespace.is_empty() {
        errors.push("namespace must not be empty".to_string());
    } else if !is_path_safe(&config.namespace) {
        errors.push(format!(
            "namespace '{}' may only contain letters, digits, '_' or '-'",
            config.namespace
        ));
    }

    if config.templates.is_empty() {
        errors.push("no templates declared".to_string());
    }

    match &config.backend {
        BackendConfig::Local { root } => {
            if root.trim().is_empty() {
                errors.push("backend.root must not be empty".to_string());
            }
        }
        BackendConfig::Remote { bucket, lock_table } => {
            if bucket.trim().is_empty() {
                errors.push("backend.bucket must not be empty".to_string());
            }
            if lock_table.trim().is_empty() {
                errors.push("backend.lock_table must not be empty".to_string());
            }
        }
    }

    if config.lock.ttl_secs == 0 {
        errors.push("lock.ttl_secs must be greater than 0".to_string());
    }
    if config.lock.poll_millis == 0 {
        errors.push("lock.poll_millis must be greater than 0".to_string());
    }
    if config.engine.program.trim().is_empty() {
        errors.push("engine.program must not be empty".to_string());
    }

    let mut instances = BTreeSet::new();
    for (template, body) in &config.templates {
        if !is_path_safe(template) {
            errors.push(format!(
                "template name '{}' may only contain letters, digits, '_' or '-'",
                template
            ));
        }
        for decl in &body.declare {
            match decl {
                Declaration::Resource(r) => {
                    if !is_symbolic_name(&r.name) {
                        errors.push(format!("template '{}': invalid resource name '{}'", template, r.name));
                    }
                }
                Declaration::Component(c) => {
                    if !COMPONENTS.iter().any(|k| k.name == c.component) {
                        errors.push(format!(
                            "template '{}': unknown component '{}'",
                            template, c.component
                        ));
                    }
                    if !is_symbolic_name(&c.name) {
                        errors.push(format!("template '{}': invalid component name '{}'", template, c.name));
                    }
                }
                Declaration::Module(m) => {
                    if !instances.insert(m.module.as_str()) {
                        errors.push(format!("module instance '{}' declared more than once", m.module));
                    }
                    validate_module(template, m, &mut errors);
                }
            }
        }
    }

    errors
}

fn validate_module(template: &str, m: &ModuleDecl, errors: &mut Vec<String>) {
    let label = format!("template '{}': module '{}'", template, m.module);
    if !is_symbolic_name(&m.module) {
        errors.push(format!("{}: invalid instance name", label));
    }
    if m.version.trim().is_empty() {
        errors.push(format!("{}: version must be pinned", label));
    }
    match &m.source {
        ModuleSource::Local { path } => {
            if path.trim().is_empty() {
                errors.push(format!("{}: source.path must not be empty", label));
            }
        }
        ModuleSource::Git { git, reference, .. } => {
            if git.trim().is_empty() {
                errors.push(format!("{}: source.git must not be empty", label));
            }
            if reference.as_deref().is_some_and(|r| r.trim().is_empty()) {
                errors.push(format!("{}: source.ref must not be empty", label));
            }
        }
    }
    if let Some(checksum) = &m.checksum {
        if !is_blake3_pin(checksum) {
            errors.push(format!(
                "{}: checksum must be 'blake3:' followed by 64 hex digits",
                label
            ));
        }
    }
    if m.allow.iter().any(|t| t.trim().is_empty()) {
        errors.push(format!("{}: allow list contains an empty type", label));
    }
}
