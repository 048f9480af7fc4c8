//! ST-050: External provisioning engine.
//!
//! The engine is an opaque subprocess (`terraform` by default). This module
//! owns its configuration, the captured output of one invocation, exit-code
//! classification, and the cancellation handle shared with the CLI.

pub mod process;

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

pub use process::EngineRunner;

/// How to invoke the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable name or path
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments placed before every subcommand
    #[serde(default)]
    pub args: Vec<String>,

    /// Per-step timeout (0 = unlimited)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Time between forwarding SIGINT and killing a timed-out engine
    #[serde(default = "default_grace_secs")]
    pub interrupt_grace_secs: u64,

    /// Extra environment for the engine
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            interrupt_grace_secs: default_grace_secs(),
            env: BTreeMap::new(),
        }
    }
}

fn default_program() -> String {
    "terraform".to_string()
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_grace_secs() -> u64 {
    30
}

/// Output from one engine step.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Result of `plan -detailed-exitcode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    NoChanges,
    Changes,
}

/// 0 = no changes, 2 = changes present, anything else fails.
pub fn classify_plan(context: &str, out: &ExecOutput) -> Result<PlanOutcome, EngineError> {
    match out.exit_code {
        0 => Ok(PlanOutcome::NoChanges),
        2 => Ok(PlanOutcome::Changes),
        code => Err(EngineError::Execution {
            context: context.to_string(),
            step: "plan".to_string(),
            exit_code: code,
            stderr: out.stderr.clone(),
        }),
    }
}

/// Any non-zero exit fails the step.
pub fn check_success(context: &str, step: &str, out: &ExecOutput) -> Result<(), EngineError> {
    if out.success() {
        Ok(())
    } else {
        Err(EngineError::Execution {
            context: context.to_string(),
            step: step.to_string(),
            exit_code: out.exit_code,
            stderr: out.stderr.clone(),
        })
    }
}

/// Cloneable cancellation flag; once set it stays set.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
