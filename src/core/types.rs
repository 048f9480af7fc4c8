//! ST-001: Namespace configuration schema and attribute values.
//!
//! Defines the `strata.yaml` types (namespace, backend, lock policy, module
//! settings, templates and their declarations) and the attribute [`Value`]
//! model shared by the evaluator, providers and synthesizer.

use crate::engine::EngineConfig;
use crate::sandbox::cache::ModuleSource;
use crate::sandbox::ModuleIsolation;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Attribute values
// ============================================================================

/// Ordered attribute map.
pub type Attributes = IndexMap<String, Value>;

/// An attribute value as written in a declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Block(Attributes),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// True for a string whose value is deferred to the engine.
    pub fn is_interpolation(&self) -> bool {
        self.as_str().is_some_and(|s| s.contains("${"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Block(_) => "block",
        }
    }

    /// Convert to the IR's JSON value. Non-finite floats become null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Block(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    /// Scalar rendering used for `{{...}}` substitution.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Str(s) => write!(f, "{}", s),
            Self::List(_) | Self::Block(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Self::Str(s.clone())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<Attributes> for Value {
    fn from(map: Attributes) -> Self {
        Self::Block(map)
    }
}

/// Build an [`Attributes`] map: `attrs! { "cidr_block" => "10.0.0.0/16" }`.
#[macro_export]
macro_rules! attrs {
    () => { $crate::core::types::Attributes::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::core::types::Attributes::new();
        $( map.insert(($key).to_string(), $crate::core::types::Value::from($value)); )+
        map
    }};
}

// ============================================================================
// Top-level strata.yaml
// ============================================================================

/// Root configuration: one namespace and its templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Namespace name; isolation boundary for state and locks
    pub namespace: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Namespace-wide tags, lowest precedence
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Parameters for `{{params.key}}` substitution
    #[serde(default)]
    pub params: IndexMap<String, Value>,

    /// Provider configuration blocks, emitted verbatim into every IR
    #[serde(default)]
    pub providers: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub modules: ModulesConfig,

    /// Engine working directories, relative to the namespace file
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Templates in declaration order
    #[serde(default)]
    pub templates: IndexMap<String, TemplateConfig>,
}

fn default_workdir() -> String {
    ".strata/work".to_string()
}

// ============================================================================
// Backend / lock policy
// ============================================================================

/// Where state and locks live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Files under `<root>/<namespace>/<template>/`
    Local {
        #[serde(default = "default_state_root")]
        root: String,
    },
    /// Object-store bucket plus a SQLite lock table
    Remote { bucket: String, lock_table: String },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local {
            root: default_state_root(),
        }
    }
}

fn default_state_root() -> String {
    ".strata/state".to_string()
}

/// Lock acquisition policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock time-to-live; older locks are stale
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// How long to wait out contention before failing (0 = fail fast)
    #[serde(default)]
    pub wait_secs: u64,

    /// Poll interval while waiting
    #[serde(default = "default_poll_millis")]
    pub poll_millis: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            wait_secs: 0,
            poll_millis: default_poll_millis(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_poll_millis() -> u64 {
    500
}

/// Module cache and isolation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulesConfig {
    #[serde(default = "default_module_cache")]
    pub cache_dir: String,

    #[serde(default)]
    pub isolation: ModuleIsolation,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_module_cache(),
            isolation: ModuleIsolation::default(),
        }
    }
}

fn default_module_cache() -> String {
    ".strata/modules".to_string()
}

// ============================================================================
// Templates and declarations
// ============================================================================

/// One template: an independently applied slice of the namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub description: Option<String>,

    /// Declarations evaluated in order
    #[serde(default)]
    pub declare: Vec<Declaration>,
}

/// A declaration inside a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Declaration {
    Resource(ResourceDecl),
    Component(ComponentDecl),
    Module(ModuleDecl),
}

/// `resource: aws_vpc` + `name` + attributes (with optional `tags`/`depends_on`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    #[serde(rename = "resource")]
    pub rtype: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
}

/// `component: vpc` + `name` + inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentDecl {
    pub component: String,
    pub name: String,
    #[serde(default)]
    pub inputs: Attributes,
    /// Scope tags applied to every resource the component declares
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// `module: <instance>` + pinned source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDecl {
    /// Instance name; prefixes every resource the module declares
    pub module: String,
    pub source: ModuleSource,
    pub version: String,
    /// Pinned content fingerprint (`blake3:<hex>`)
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
    /// Resource types the module may declare
    #[serde(default)]
    pub allow: Vec<String>,
}

impl Declaration {
    /// `resource aws_vpc.main`, `component vpc.core`, `module nfs`
    pub fn label(&self) -> String {
        match self {
            Self::Resource(r) => format!("resource {}.{}", r.rtype, r.name),
            Self::Component(c) => format!("component {}.{}", c.component, c.name),
            Self::Module(m) => format!("module {}", m.module),
        }
    }
}
