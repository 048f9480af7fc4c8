//! ST-060: Plan/apply orchestration.
//!
//! Per invocation:
//! `Idle → LockAcquired → EngineRunning → {Succeeded | Failed} → LockReleased`.
//!
//! `plan` never takes the lock and runs in a scratch directory. `apply`,
//! `destroy` and `import` hold the write lock for the whole engine phase and
//! release it exactly once, whatever the exit path. State is written only
//! after the engine reports applied changes.

use super::cost::{estimate_or_warn, CostEstimate, CostEstimator, NoCostEstimate};
use super::synth::{Ir, GENERATOR};
use super::types::LockConfig;
use crate::audit::eventlog::{self, RunEvent};
use crate::engine::{self, CancelHandle, EngineRunner, ExecOutput, PlanOutcome};
use crate::error::{Error, Result, StateError};
use crate::state::{Lock, StateBackend, StateKey, StateRecord};
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const CONFIG_FILE: &str = "main.tf.json";
const ENGINE_STATE_FILE: &str = "terraform.tfstate";
const VARS_FILE: &str = "strata.auto.tfvars.json";
const PLAN_FILE: &str = "strata.tfplan";

/// What to do with a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Plan,
    Apply,
    Destroy,
    /// Adopt an existing object into state
    Import { address: String, id: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Import { .. } => "import",
        }
    }

    /// Needs the write lock.
    pub fn mutates(&self) -> bool {
        !matches!(self, Self::Plan)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    LockAcquired,
    EngineRunning,
    Succeeded,
    Failed,
    LockReleased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    NoChanges,
    ChangesPlanned,
    ChangesApplied,
    Imported,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoChanges => "no_changes",
            Self::ChangesPlanned => "changes_planned",
            Self::ChangesApplied => "changes_applied",
            Self::Imported => "imported",
        }
    }
}

/// Counts from the engine's `Plan: N to add, ...` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub add: u32,
    pub change: u32,
    pub destroy: u32,
}

/// Extract the plan summary from engine output.
pub fn parse_plan_summary(stdout: &str) -> Option<PlanSummary> {
    let re = regex::Regex::new(r"Plan: (\d+) to add, (\d+) to change, (\d+) to destroy").ok()?;
    let caps = re.captures(stdout)?;
    Some(PlanSummary {
        add: caps[1].parse().ok()?,
        change: caps[2].parse().ok()?,
        destroy: caps[3].parse().ok()?,
    })
}

/// Result of one orchestrated run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub namespace: String,
    pub template: String,
    pub action: String,
    pub outcome: Outcome,
    pub phases: Vec<Phase>,
    pub ir_fingerprint: String,
    pub summary: Option<PlanSummary>,
    pub cost: Option<CostEstimate>,
    /// Serial of the state written by this run
    pub serial: Option<u64>,
    pub lock_id: Option<String>,
    pub duration_seconds: f64,
    /// Engine plan output, for display
    #[serde(skip)]
    pub plan_output: String,
}

/// `user@host` of the current process.
pub fn default_owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::fs::read_to_string("/etc/hostname")
        .map(|h| h.trim().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", user, host)
}

/// Releases its lock on drop unless released explicitly.
struct LockGuard<'a> {
    backend: &'a dyn StateBackend,
    key: &'a StateKey,
    lock: Lock,
    released: bool,
}

impl LockGuard<'_> {
    fn release(mut self) -> std::result::Result<(), StateError> {
        self.released = true;
        self.backend.release(self.key, &self.lock)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.backend.release(self.key, &self.lock) {
                tracing::error!(key = %self.key, lock_id = %self.lock.id, error = %e, "failed to release lock");
            }
        }
    }
}

/// Drives the engine against one state backend.
pub struct Orchestrator<'a> {
    backend: &'a dyn StateBackend,
    runner: EngineRunner,
    workdir: PathBuf,
    audit_dir: Option<PathBuf>,
    lock: LockConfig,
    owner: String,
    estimator: Box<dyn CostEstimator>,
    cancel: CancelHandle,
}

impl<'a> Orchestrator<'a> {
    pub fn new(backend: &'a dyn StateBackend, runner: EngineRunner, workdir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            runner,
            workdir: workdir.into(),
            audit_dir: None,
            lock: LockConfig::default(),
            owner: default_owner(),
            estimator: Box::new(NoCostEstimate),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = Some(dir.into());
        self
    }

    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_estimator(mut self, estimator: Box<dyn CostEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn backend(&self) -> &dyn StateBackend {
        self.backend
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    pub async fn plan(&self, key: &StateKey, ir: &Ir) -> Result<RunReport> {
        self.execute(key, ir, Action::Plan).await
    }

    pub async fn apply(&self, key: &StateKey, ir: &Ir) -> Result<RunReport> {
        self.execute(key, ir, Action::Apply).await
    }

    pub async fn destroy(&self, key: &StateKey, ir: &Ir) -> Result<RunReport> {
        self.execute(key, ir, Action::Destroy).await
    }

    pub async fn import(&self, key: &StateKey, ir: &Ir, address: &str, id: &str) -> Result<RunReport> {
        let action = Action::Import {
            address: address.to_string(),
            id: id.to_string(),
        };
        self.execute(key, ir, action).await
    }

    /// Confirmation-gated override for a stale or abandoned lock.
    pub fn force_unlock(&self, key: &StateKey, lock_id: &str) -> Result<Lock> {
        let removed = self.backend.force_unlock(key, lock_id)?;
        self.record(
            key,
            &eventlog::generate_run_id(),
            RunEvent::ForceUnlocked {
                lock_id: removed.id.clone(),
                previous_owner: removed.owner.clone(),
            },
        );
        Ok(removed)
    }

    /// Run `action` for one template.
    pub async fn execute(&self, key: &StateKey, ir: &Ir, action: Action) -> Result<RunReport> {
        let run_id = eventlog::generate_run_id();
        let started = Instant::now();
        let mut report = RunReport {
            run_id: run_id.clone(),
            namespace: key.namespace.clone(),
            template: key.template.clone(),
            action: action.name().to_string(),
            outcome: Outcome::NoChanges,
            phases: vec![Phase::Idle],
            ir_fingerprint: ir.fingerprint(),
            summary: None,
            cost: None,
            serial: None,
            lock_id: None,
            duration_seconds: 0.0,
            plan_output: String::new(),
        };
        self.record(
            key,
            &run_id,
            RunEvent::RunStarted {
                action: action.name().to_string(),
                owner: self.owner.clone(),
                ir_fingerprint: report.ir_fingerprint.clone(),
                generator: GENERATOR.to_string(),
            },
        );

        let result = if action.mutates() {
            self.execute_locked(key, ir, &action, &mut report).await
        } else {
            self.execute_plan(key, ir, &mut report).await
        };

        report.duration_seconds = started.elapsed().as_secs_f64();
        match result {
            Ok(()) => {
                self.record(
                    key,
                    &run_id,
                    RunEvent::RunSucceeded {
                        outcome: report.outcome.as_str().to_string(),
                        total_seconds: report.duration_seconds,
                    },
                );
                tracing::info!(key = %key, action = action.name(), outcome = report.outcome.as_str(), "run finished");
                Ok(report)
            }
            Err(e) => {
                self.record(key, &run_id, RunEvent::RunFailed { error: e.to_string() });
                Err(e)
            }
        }
    }

    async fn execute_plan(&self, key: &StateKey, ir: &Ir, report: &mut RunReport) -> Result<()> {
        let vars = self.resolve_imports(key, ir)?;
        let prior = self.backend.read(key)?;
        let dir = self
            .template_dir(key)
            .join(format!(".plan-{}", report.run_id));
        stage(&dir, ir, prior.as_ref(), &vars)?;

        let result = self.plan_steps(key, &dir, false, report).await;
        let _ = std::fs::remove_dir_all(&dir);
        let outcome = result?;
        report.outcome = match outcome {
            PlanOutcome::NoChanges => Outcome::NoChanges,
            PlanOutcome::Changes => Outcome::ChangesPlanned,
        };
        report.cost = estimate_or_warn(self.estimator.as_ref(), ir);
        Ok(())
    }

    async fn execute_locked(
        &self,
        key: &StateKey,
        ir: &Ir,
        action: &Action,
        report: &mut RunReport,
    ) -> Result<()> {
        let vars = self.resolve_imports(key, ir)?;
        let lock = self.acquire_with_wait(key).await?;
        report.phases.push(Phase::LockAcquired);
        report.lock_id = Some(lock.id.clone());
        self.record(key, &report.run_id, RunEvent::LockAcquired { lock_id: lock.id.clone() });

        let guard = LockGuard {
            backend: self.backend,
            key,
            lock,
            released: false,
        };
        let result = self.run_locked(key, ir, action, &vars, &guard.lock, report).await;
        report.phases.push(if result.is_ok() { Phase::Succeeded } else { Phase::Failed });

        let lock_id = guard.lock.id.clone();
        let released = guard.release();
        report.phases.push(Phase::LockReleased);
        self.record(key, &report.run_id, RunEvent::LockReleased { lock_id });
        match (result, released) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e.into()),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn run_locked(
        &self,
        key: &StateKey,
        ir: &Ir,
        action: &Action,
        vars: &BTreeMap<String, Json>,
        lock: &Lock,
        report: &mut RunReport,
    ) -> Result<()> {
        let prior = self.backend.read(key)?;
        let dir = self.template_dir(key);
        stage(&dir, ir, prior.as_ref(), vars)?;

        if self.cancel.is_cancelled() {
            return Err(Error::Aborted("cancelled before engine start".to_string()));
        }
        report.phases.push(Phase::EngineRunning);

        let applied = match action {
            Action::Import { address, id } => {
                self.step(key, &dir, "init", init_args(), report).await?;
                let args = vec![
                    "import".to_string(),
                    "-input=false".to_string(),
                    "-no-color".to_string(),
                    address.clone(),
                    id.clone(),
                ];
                self.step(key, &dir, "import", args, report).await?;
                report.outcome = Outcome::Imported;
                true
            }
            Action::Apply | Action::Destroy => {
                let destroy = matches!(action, Action::Destroy);
                match self.plan_steps(key, &dir, destroy, report).await? {
                    PlanOutcome::NoChanges => {
                        report.outcome = Outcome::NoChanges;
                        false
                    }
                    PlanOutcome::Changes => {
                        let args = vec![
                            "apply".to_string(),
                            "-input=false".to_string(),
                            "-no-color".to_string(),
                            PLAN_FILE.to_string(),
                        ];
                        self.step(key, &dir, "apply", args, report).await?;
                        report.outcome = Outcome::ChangesApplied;
                        true
                    }
                }
            }
            Action::Plan => false,
        };

        if applied {
            let engine_state = read_engine_state(&dir)?;
            let serial = prior.as_ref().map_or(0, |p| p.serial) + 1;
            let record = StateRecord::new(key, serial, ir, engine_state);
            self.backend.write(key, &record, lock)?;
            report.serial = Some(serial);
            tracing::info!(key = %key, serial, "state written");
            self.record(
                key,
                &report.run_id,
                RunEvent::StateWritten {
                    serial,
                    ir_fingerprint: record.ir_fingerprint,
                },
            );
        }
        Ok(())
    }

    /// `init` then `plan -detailed-exitcode`.
    async fn plan_steps(
        &self,
        key: &StateKey,
        dir: &Path,
        destroy: bool,
        report: &mut RunReport,
    ) -> Result<PlanOutcome> {
        if self.cancel.is_cancelled() {
            return Err(Error::Aborted("cancelled before engine start".to_string()));
        }
        if !report.phases.contains(&Phase::EngineRunning) {
            report.phases.push(Phase::EngineRunning);
        }
        self.step(key, dir, "init", init_args(), report).await?;
        let mut args = vec![
            "plan".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-detailed-exitcode".to_string(),
            format!("-out={}", PLAN_FILE),
        ];
        if destroy {
            args.push("-destroy".to_string());
        }
        let out = self.run_engine(key, dir, "plan", args, report).await?;
        let outcome = engine::classify_plan(&key.to_string(), &out)?;
        report.summary = parse_plan_summary(&out.stdout);
        report.plan_output = out.stdout;
        Ok(outcome)
    }

    /// One engine step that must exit 0.
    async fn step(
        &self,
        key: &StateKey,
        dir: &Path,
        step: &str,
        args: Vec<String>,
        report: &RunReport,
    ) -> Result<ExecOutput> {
        let out = self.run_engine(key, dir, step, args, report).await?;
        engine::check_success(&key.to_string(), step, &out)?;
        Ok(out)
    }

    async fn run_engine(
        &self,
        key: &StateKey,
        dir: &Path,
        step: &str,
        args: Vec<String>,
        report: &RunReport,
    ) -> Result<ExecOutput> {
        self.record(key, &report.run_id, RunEvent::EngineStarted { step: step.to_string() });
        let out = self
            .runner
            .run(&key.to_string(), step, &args, dir, &self.cancel)
            .await?;
        self.record(
            key,
            &report.run_id,
            RunEvent::EngineFinished {
                step: step.to_string(),
                exit_code: out.exit_code,
                duration_seconds: out.duration_seconds,
            },
        );
        Ok(out)
    }

    /// Retry contention until the configured wait elapses.
    async fn acquire_with_wait(&self, key: &StateKey) -> Result<Lock> {
        let ttl = Duration::from_secs(self.lock.ttl_secs);
        let wait = Duration::from_secs(self.lock.wait_secs);
        let poll = Duration::from_millis(self.lock.poll_millis.max(10));
        let started = Instant::now();
        loop {
            match self.backend.acquire(key, &self.owner, ttl) {
                Ok(lock) => return Ok(lock),
                Err(e) if e.is_retryable() && started.elapsed() + poll <= wait => {
                    if self.cancel.is_cancelled() {
                        return Err(Error::Aborted("cancelled while waiting for lock".to_string()));
                    }
                    tracing::info!(key = %key, error = %e, "waiting for lock");
                    tokio::time::sleep(poll).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Values of this template's cross-template variables, from upstream state.
    fn resolve_imports(&self, key: &StateKey, ir: &Ir) -> Result<BTreeMap<String, Json>> {
        let mut vars = BTreeMap::new();
        let mut upstream_cache: BTreeMap<&str, Option<StateRecord>> = BTreeMap::new();
        for import in ir.imports() {
            if !upstream_cache.contains_key(import.upstream.as_str()) {
                let upstream_key = StateKey::new(&key.namespace, &import.upstream);
                upstream_cache.insert(import.upstream.as_str(), self.backend.read(&upstream_key)?);
            }
            let value = upstream_cache
                .get(import.upstream.as_str())
                .and_then(Option::as_ref)
                .and_then(|record| record.outputs.get(&import.variable))
                .ok_or_else(|| Error::MissingUpstream {
                    template: key.template.clone(),
                    upstream: import.upstream.clone(),
                    output: import.variable.clone(),
                })?;
            vars.insert(import.variable.clone(), value.clone());
        }
        Ok(vars)
    }

    fn template_dir(&self, key: &StateKey) -> PathBuf {
        self.workdir.join(&key.namespace).join(&key.template)
    }

    fn record(&self, key: &StateKey, run_id: &str, event: RunEvent) {
        if let Some(dir) = &self.audit_dir {
            if let Err(e) = eventlog::append_event(dir, key, run_id, event) {
                tracing::warn!(key = %key, error = %e, "failed to append audit event");
            }
        }
    }
}

fn init_args() -> Vec<String> {
    vec![
        "init".to_string(),
        "-input=false".to_string(),
        "-no-color".to_string(),
    ]
}

fn io_error(path: &Path, source: std::io::Error) -> Error {
    Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write the engine's inputs into `dir`.
fn stage(
    dir: &Path,
    ir: &Ir,
    prior: Option<&StateRecord>,
    vars: &BTreeMap<String, Json>,
) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
    let write = |name: &str, bytes: &[u8]| {
        let path = dir.join(name);
        std::fs::write(&path, bytes).map_err(|e| io_error(&path, e))
    };
    write(CONFIG_FILE, ir.as_bytes())?;
    write(VARS_FILE, &serde_json::to_vec_pretty(vars)?)?;

    let state_path = dir.join(ENGINE_STATE_FILE);
    match prior.map(|p| &p.engine_state).filter(|s| !s.is_null()) {
        Some(state) => write(ENGINE_STATE_FILE, &serde_json::to_vec_pretty(state)?)?,
        None => match std::fs::remove_file(&state_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&state_path, e)),
        },
    }
    let plan_path = dir.join(PLAN_FILE);
    if plan_path.exists() {
        std::fs::remove_file(&plan_path).map_err(|e| io_error(&plan_path, e))?;
    }
    Ok(())
}

fn read_engine_state(dir: &Path) -> Result<Json> {
    let path = dir.join(ENGINE_STATE_FILE);
    let bytes = std::fs::read(&path).map_err(|e| io_error(&path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}
