//! ST-080: Project workspace.
//!
//! A project is a loaded `strata.yaml` plus the directory it lives in. All
//! relative paths in the namespace (state root, module cache, workdir,
//! local module sources) resolve against that directory.

use super::orchestrator::Orchestrator;
use super::parser;
use super::resolver;
use super::synth::{self, Ir, SynthOptions};
use super::template::{self, NamespaceEvaluation};
use super::types::NamespaceConfig;
use crate::engine::{CancelHandle, EngineRunner};
use crate::error::{Error, Result};
use crate::providers::Registry;
use crate::sandbox::cache::{ModuleCache, SourceFetcher};
use crate::sandbox::Sandbox;
use crate::state::{self, StateBackend, StateKey, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Project state directory, relative to the namespace file.
pub const STRATA_DIR: &str = ".strata";

/// Starter namespace written by `strata init`.
const STARTER: &str = r#"version: "1.0"
namespace: NAMESPACE
description: "Managed by strata"

tags:
  managed-by: strata

params:
  vpc_cidr: 10.0.0.0/16

providers:
  aws:
    region: us-east-1

backend:
  type: local
  root: .strata/state

lock:
  ttl_secs: 300
  wait_secs: 0

engine:
  program: terraform

templates:
  network:
    declare:
      - component: vpc
        name: main
        inputs:
          cidr_block: "{{params.vpc_cidr}}"
          availability_zones: [us-east-1a, us-east-1b]
"#;

/// Write a starter `strata.yaml` and state directory into `dir`.
pub fn init_project(dir: &Path, namespace: &str) -> Result<PathBuf> {
    let config_path = dir.join("strata.yaml");
    if config_path.exists() {
        return Err(Error::Aborted(format!("{} already exists", config_path.display())));
    }
    let state_dir = dir.join(STRATA_DIR).join("state");
    std::fs::create_dir_all(&state_dir).map_err(|source| Error::Io {
        path: state_dir.clone(),
        source,
    })?;
    std::fs::write(&config_path, STARTER.replace("NAMESPACE", namespace)).map_err(|source| {
        Error::Io {
            path: config_path.clone(),
            source,
        }
    })?;
    Ok(config_path)
}

/// A loaded namespace and its on-disk layout.
pub struct Project {
    root: PathBuf,
    config: NamespaceConfig,
    registry: Registry,
}

impl Project {
    /// Load and validate `strata.yaml`.
    pub fn load(path: &Path) -> Result<Self> {
        let config = parser::load_namespace(path)?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self::from_config(root, config))
    }

    pub fn from_config(root: impl Into<PathBuf>, config: NamespaceConfig) -> Self {
        Self {
            root: root.into(),
            config,
            registry: Registry::builtin(),
        }
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn key(&self, template: &str) -> StateKey {
        StateKey::new(&self.config.namespace, template)
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join(STRATA_DIR).join("audit")
    }

    pub fn workdir(&self) -> PathBuf {
        self.root.join(&self.config.workdir)
    }

    pub fn open_backend(&self) -> Result<Box<dyn StateBackend>> {
        let backend = state::open_backend(&self.config.backend, &self.root, Arc::new(SystemClock))?;
        backend.bootstrap(&self.config.namespace)?;
        Ok(backend)
    }

    pub fn module_cache(&self) -> ModuleCache {
        let dir = self.root.join(&self.config.modules.cache_dir);
        let fetcher = SourceFetcher::new(&self.root, dir.join(".scratch"));
        ModuleCache::new(dir, Box::new(fetcher))
    }

    /// Evaluate every template; module failures are collected, not raised.
    pub fn evaluate(&self) -> Result<NamespaceEvaluation> {
        self.evaluate_with(&self.module_cache())
    }

    pub fn evaluate_with(&self, cache: &ModuleCache) -> Result<NamespaceEvaluation> {
        let sandbox = Sandbox::new(self.config.modules.isolation);
        template::evaluate_namespace(&self.config, &self.registry, cache, sandbox)
    }

    pub fn synth_options(&self) -> SynthOptions {
        SynthOptions {
            namespace: self.config.namespace.clone(),
            providers: self.config.providers.clone(),
        }
    }

    /// Templates in apply order, optionally narrowed to one.
    pub fn template_order(&self, eval: &NamespaceEvaluation, only: Option<&str>) -> Result<Vec<String>> {
        if let Some(t) = only {
            if !self.config.templates.contains_key(t) {
                return Err(Error::UnknownTemplate(t.to_string()));
            }
            return Ok(vec![t.to_string()]);
        }
        resolver::template_order(&eval.graph, &eval.templates)
    }

    /// Synthesize IR for the selected templates, in apply order. Refuses
    /// while any module failed.
    pub fn synthesize(&self, eval: &NamespaceEvaluation, only: Option<&str>) -> Result<Vec<Ir>> {
        eval.ensure_clean()?;
        let opts = self.synth_options();
        self.template_order(eval, only)?
            .iter()
            .map(|t| synth::synthesize(&eval.graph, t, &opts))
            .collect()
    }

    /// Write each IR to `<out_dir>/<template>/main.tf.json`.
    pub fn write_ir(&self, out_dir: &Path, irs: &[Ir]) -> Result<Vec<PathBuf>> {
        irs.iter()
            .map(|ir| {
                let dir = out_dir.join(ir.template());
                std::fs::create_dir_all(&dir).map_err(|source| Error::Io {
                    path: dir.clone(),
                    source,
                })?;
                let path = dir.join("main.tf.json");
                std::fs::write(&path, ir.as_bytes()).map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(path)
            })
            .collect()
    }

    pub fn orchestrator<'b>(&self, backend: &'b dyn StateBackend, cancel: CancelHandle) -> Orchestrator<'b> {
        Orchestrator::new(
            backend,
            EngineRunner::new(self.config.engine.clone()),
            self.workdir(),
        )
        .with_audit_dir(self.audit_dir())
        .with_lock_config(self.config.lock.clone())
        .with_cancel(cancel)
    }
}
