//! Error taxonomy.
//!
//! Each subsystem owns a typed error; [`Error`] folds them together for the
//! pipeline and the CLI.

use crate::core::graph::ResourceAddress;
use std::path::PathBuf;

/// An attribute failed its resource type's schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{resource}: attribute '{field}': {rule}")]
pub struct ValidationError {
    /// `type.name` of the resource (or `component kind.name`)
    pub resource: String,
    /// Offending field, dotted for nested blocks (`ingress[0].from_port`)
    pub field: String,
    /// The rule that was violated
    pub rule: String,
}

impl ValidationError {
    pub fn new(resource: impl Into<String>, field: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            field: field.into(),
            rule: rule.into(),
        }
    }
}

/// The same `(type, name)` was registered twice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate resource {address} (first declared in template '{existing_template}')")]
pub struct DuplicateResourceError {
    pub address: ResourceAddress,
    pub existing_template: String,
}

/// A symbolic reference names a resource missing from the graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{from}: unresolved reference to {target} in `{expression}`")]
pub struct UnresolvedReferenceError {
    /// The resource holding the reference
    pub from: ResourceAddress,
    /// The missing target (`type.name`), or the raw expression when malformed
    pub target: String,
    /// The interpolation expression as written
    pub expression: String,
}

/// Errors raised while evaluating declarations.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Duplicate(#[from] DuplicateResourceError),

    #[error("unknown resource type '{0}'")]
    UnknownType(String),

    #[error("resource type '{rtype}' is not granted to module '{module}'")]
    CapabilityDenied { module: String, rtype: String },

    #[error("{address} has no output attribute '{output}'")]
    UnknownOutput { address: String, output: String },

    #[error("unknown component '{0}'")]
    UnknownComponent(String),

    #[error("invalid input '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("output contract violated: {0}")]
    Contract(String),

    #[error("template error: {0}")]
    Template(String),
}

/// Fetching module source failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("module {module}: fetch failed: {reason}")]
pub struct ModuleFetchError {
    pub module: String,
    pub reason: String,
}

/// A module raised partway through evaluation.
#[derive(Debug, thiserror::Error)]
#[error("module '{module}' failed at {resource}: {cause}")]
pub struct ModuleEvaluationError {
    /// Module instance and identity (`nfs (./modules/nfs.yaml@1.0)`)
    pub module: String,
    /// Resource being declared when the failure occurred
    pub resource: String,
    #[source]
    pub cause: EvalError,
    /// Definitions from this module that were committed to the parent
    pub kept: Vec<ResourceAddress>,
    /// Definitions from this module that were dropped
    pub discarded: Vec<ResourceAddress>,
}

/// Module failures, isolated to the failing module.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error(transparent)]
    Fetch(#[from] ModuleFetchError),

    #[error(transparent)]
    Evaluation(#[from] ModuleEvaluationError),
}

/// State backend and lock errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state {namespace}/{template} is locked by {owner} (lock {lock_id}, held {age_secs}s); retry later")]
    LockContention {
        namespace: String,
        template: String,
        owner: String,
        lock_id: String,
        age_secs: u64,
    },

    #[error("lock {lock_id} on {namespace}/{template} held by {owner} is stale ({age_secs}s old, ttl {ttl_secs}s); override with `strata unlock --lock-id {lock_id}`")]
    LockStale {
        namespace: String,
        template: String,
        owner: String,
        lock_id: String,
        age_secs: u64,
        ttl_secs: u64,
    },

    #[error("lock {lock_id} on {namespace}/{template} is not held by {owner}")]
    LockNotHeld {
        namespace: String,
        template: String,
        owner: String,
        lock_id: String,
    },

    #[error("no lock is held on {namespace}/{template}")]
    NotLocked { namespace: String, template: String },

    #[error("refusing to unlock {namespace}/{template}: lock id {given} does not match current lock {current}")]
    LockIdMismatch {
        namespace: String,
        template: String,
        given: String,
        current: String,
    },

    #[error("corrupt state at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock table error: {0}")]
    LockTable(#[from] rusqlite::Error),

    #[error("state serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Contention is the only lock error worth waiting out.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

/// External engine failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine {step} failed for {context} (exit {exit_code}); remote infrastructure may have been partially modified by the engine:\n{stderr}")]
    Execution {
        context: String,
        step: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("failed to spawn engine `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine {step} for {context} timed out after {secs}s")]
    Timeout {
        context: String,
        step: String,
        secs: u64,
    },

    #[error("engine {step} for {context} interrupted (exit {exit_code}):\n{stderr}")]
    Interrupted {
        context: String,
        step: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("engine workspace error on {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Namespace configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("{} validation error(s):\n  {}", .0.len(), .0.join("\n  "))]
    Invalid(Vec<String>),
}

/// Crate-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Unresolved(#[from] UnresolvedReferenceError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("template dependency cycle involving: {}", .0.join(", "))]
    TemplateCycle(Vec<String>),

    #[error("template '{template}' needs output '{output}' from template '{upstream}', which has not been applied")]
    MissingUpstream {
        template: String,
        upstream: String,
        output: String,
    },

    #[error("{} module(s) failed; refusing to continue:\n  {}", .0.len(), .0.join("\n  "))]
    ModulesFailed(Vec<String>),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_names_field_and_rule() {
        let e = ValidationError::new("aws_vpc.main", "cidr_block", "required");
        assert_eq!(e.to_string(), "aws_vpc.main: attribute 'cidr_block': required");
    }

    #[test]
    fn test_unresolved_display_names_both_ends() {
        let e = UnresolvedReferenceError {
            from: ResourceAddress::new("aws_subnet", "b"),
            target: "aws_vpc.c".to_string(),
            expression: "${aws_vpc.c.id}".to_string(),
        };
        let msg = e.to_string();
        assert!(msg.contains("aws_subnet.b"));
        assert!(msg.contains("aws_vpc.c"));
    }

    #[test]
    fn test_lock_errors_retryability() {
        let contention = StateError::LockContention {
            namespace: "prod".into(),
            template: "net".into(),
            owner: "alice".into(),
            lock_id: "l-1".into(),
            age_secs: 3,
        };
        let stale = StateError::LockStale {
            namespace: "prod".into(),
            template: "net".into(),
            owner: "alice".into(),
            lock_id: "l-1".into(),
            age_secs: 301,
            ttl_secs: 300,
        };
        assert!(contention.is_retryable());
        assert!(!stale.is_retryable());
        assert!(stale.to_string().contains("strata unlock --lock-id l-1"));
    }

    #[test]
    fn test_engine_error_carries_stderr() {
        let e = EngineError::Execution {
            context: "prod/net".into(),
            step: "apply".into(),
            exit_code: 1,
            stderr: "Error: quota exceeded".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("quota exceeded"));
        assert!(msg.contains("partially modified"));
    }

    #[test]
    fn test_config_invalid_lists_every_issue() {
        let e = ConfigError::Invalid(vec!["a".into(), "b".into()]);
        let msg = e.to_string();
        assert!(msg.starts_with("2 validation error(s)"));
        assert!(msg.contains("\n  b"));
    }
}
