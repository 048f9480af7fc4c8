//! ST-010: Provider registry.
//!
//! A [`Registry`] is built once from a static list of provider modules. Each
//! [`ResourceKind`] maps a resource type name to its exported output
//! attributes and a parse function that validates an attribute map into a
//! typed [`ResourceSpec`].

pub mod aws;
mod schema;

pub use schema::{AttrReader, IrBuilder};

use crate::core::types::Attributes;
use crate::error::{EvalError, ValidationError};
use std::collections::BTreeMap;

/// Validate an attribute map into a typed spec.
pub type ParseFn = fn(&mut AttrReader<'_>) -> Result<ResourceSpec, ValidationError>;

/// One resource type exposed as a constructor.
#[derive(Debug, Clone, Copy)]
pub struct ResourceKind {
    pub type_name: &'static str,
    /// Output attributes a reference exposes
    pub outputs: &'static [&'static str],
    /// Whether the type accepts a `tags` map
    pub taggable: bool,
    pub parse: ParseFn,
}

/// A provider: its name and resource kinds.
#[derive(Debug)]
pub struct ProviderModule {
    pub name: &'static str,
    pub kinds: &'static [ResourceKind],
}

/// Providers compiled into the binary.
pub static BUILTIN_PROVIDERS: &[&ProviderModule] = &[&aws::PROVIDER];

/// Constructor surface available to one evaluation context.
#[derive(Debug, Clone)]
pub struct Registry {
    kinds: BTreeMap<&'static str, ResourceKind>,
    /// Module instance this registry was scoped for, if any
    scope: Option<String>,
}

impl Registry {
    pub fn new(modules: &[&ProviderModule]) -> Self {
        let kinds = modules
            .iter()
            .flat_map(|m| m.kinds.iter())
            .map(|k| (k.type_name, *k))
            .collect();
        Self { kinds, scope: None }
    }

    pub fn builtin() -> Self {
        Self::new(BUILTIN_PROVIDERS)
    }

    /// Look up a constructor. A scoped registry reports types it was not
    /// granted as a capability error.
    pub fn kind(&self, rtype: &str) -> Result<&ResourceKind, EvalError> {
        self.kinds.get(rtype).ok_or_else(|| match &self.scope {
            Some(module) => EvalError::CapabilityDenied {
                module: module.clone(),
                rtype: rtype.to_string(),
            },
            None => EvalError::UnknownType(rtype.to_string()),
        })
    }

    pub fn contains(&self, rtype: &str) -> bool {
        self.kinds.contains_key(rtype)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kinds.keys().copied()
    }

    /// Subset registry granting only `allowed` types to module `scope`.
    pub fn restrict(&self, scope: &str, allowed: &[String]) -> Result<Registry, EvalError> {
        let mut kinds = BTreeMap::new();
        for rtype in allowed {
            let kind = self
                .kinds
                .get(rtype.as_str())
                .ok_or_else(|| EvalError::UnknownType(rtype.clone()))?;
            kinds.insert(kind.type_name, *kind);
        }
        Ok(Registry {
            kinds,
            scope: Some(scope.to_string()),
        })
    }
}

/// Eagerly computed properties, fixed at construction from validated inputs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Computed {
    /// Forward reference: nothing is known yet
    #[default]
    Deferred,
    /// Type exposes no computed properties
    Opaque,
    Network {
        cidr_block: String,
    },
    Subnet {
        cidr_block: String,
        availability_zone: Option<String>,
        public: bool,
    },
    Bucket {
        bucket: Option<String>,
    },
}

impl Computed {
    pub fn cidr_block(&self) -> Option<&str> {
        match self {
            Self::Network { cidr_block } | Self::Subnet { cidr_block, .. } => Some(cidr_block),
            _ => None,
        }
    }
}

/// Validated per-type spec.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Vpc(aws::network::Vpc),
    Subnet(aws::network::Subnet),
    InternetGateway(aws::network::InternetGateway),
    Eip(aws::network::Eip),
    NatGateway(aws::network::NatGateway),
    SecurityGroup(aws::network::SecurityGroup),
    S3Bucket(aws::storage::S3Bucket),
    Instance(aws::compute::Instance),
}

impl ResourceSpec {
    /// Flatten into IR attributes.
    pub fn emit(&self) -> Attributes {
        let mut out = IrBuilder::new();
        match self {
            Self::Vpc(s) => s.emit(&mut out),
            Self::Subnet(s) => s.emit(&mut out),
            Self::InternetGateway(s) => s.emit(&mut out),
            Self::Eip(s) => s.emit(&mut out),
            Self::NatGateway(s) => s.emit(&mut out),
            Self::SecurityGroup(s) => s.emit(&mut out),
            Self::S3Bucket(s) => s.emit(&mut out),
            Self::Instance(s) => s.emit(&mut out),
        }
        out.finish()
    }

    pub fn computed(&self) -> Computed {
        match self {
            Self::Vpc(s) => Computed::Network {
                cidr_block: s.cidr_block.clone(),
            },
            Self::Subnet(s) => Computed::Subnet {
                cidr_block: s.cidr_block.clone(),
                availability_zone: s.availability_zone.clone(),
                public: s.map_public_ip_on_launch.unwrap_or(false),
            },
            Self::S3Bucket(s) => Computed::Bucket {
                bucket: s.bucket.clone(),
            },
            Self::InternetGateway(_)
            | Self::Eip(_)
            | Self::NatGateway(_)
            | Self::SecurityGroup(_)
            | Self::Instance(_) => Computed::Opaque,
        }
    }
}
