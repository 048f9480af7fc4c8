//! ST-022: VPC component.
//!
//! One call lays out a VPC across availability zones: the VPC, an internet
//! gateway, and per zone a public subnet (`/+8`, netnum `2i`), a private
//! subnet (netnum `2i+1`), an elastic IP and a NAT gateway in the public
//! subnet.

use super::cidr::Ipv4Cidr;
use super::ComponentFields;
use crate::attrs;
use crate::core::evaluator::Evaluator;
use crate::core::graph::ResourceReference;
use crate::core::types::{Attributes, Value};
use crate::error::{EvalError, ValidationError};
use crate::providers::AttrReader;
use std::collections::BTreeMap;

/// Bits added to the VPC prefix for every subnet.
const SUBNET_NEWBITS: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpcArgs {
    pub cidr_block: String,
    pub availability_zones: Vec<String>,
    pub enable_nat_gateway: bool,
    pub enable_dns_hostnames: bool,
}

impl VpcArgs {
    pub fn new(cidr_block: &str, zones: &[&str]) -> Self {
        Self {
            cidr_block: cidr_block.to_string(),
            availability_zones: zones.iter().map(|z| z.to_string()).collect(),
            enable_nat_gateway: true,
            enable_dns_hostnames: true,
        }
    }

    /// Read component inputs with the same schema reader resources use.
    pub fn from_inputs(name: &str, inputs: &Attributes) -> Result<Self, ValidationError> {
        let mut r = AttrReader::new(format!("component vpc.{}", name), inputs);
        let cidr_block = r.required_cidr("cidr_block")?;
        let availability_zones = r.string_list("availability_zones")?;
        let enable_nat_gateway = r.optional_bool("enable_nat_gateway")?.unwrap_or(true);
        let enable_dns_hostnames = r.optional_bool("enable_dns_hostnames")?.unwrap_or(true);
        r.finish()?;
        Ok(Self {
            cidr_block,
            availability_zones,
            enable_nat_gateway,
            enable_dns_hostnames,
        })
    }
}

/// Aggregate reference returned by [`vpc`].
#[derive(Debug, Clone)]
pub struct VpcRef {
    pub vpc: ResourceReference,
    pub internet_gateway: ResourceReference,
    pub public_subnets: Vec<ResourceReference>,
    pub private_subnets: Vec<ResourceReference>,
    pub nat_eips: Vec<ResourceReference>,
    pub nat_gateways: Vec<ResourceReference>,
    pub cidr_block: String,
    pub availability_zones: Vec<String>,
}

impl VpcRef {
    pub fn public_cidrs(&self) -> Vec<String> {
        cidrs_of(&self.public_subnets)
    }

    pub fn private_cidrs(&self) -> Vec<String> {
        cidrs_of(&self.private_subnets)
    }

    /// Flat field map for `{{component.<name>.<field>}}` substitution.
    pub fn fields(&self) -> ComponentFields {
        let mut fields = ComponentFields::new();
        fields.insert("vpc_id".into(), self.vpc.id());
        fields.insert("cidr_block".into(), self.cidr_block.clone());
        fields.insert("internet_gateway_id".into(), self.internet_gateway.id());
        let groups = [
            ("public_subnet", &self.public_subnets),
            ("private_subnet", &self.private_subnets),
            ("nat_gateway", &self.nat_gateways),
        ];
        for (label, refs) in groups {
            let ids: Vec<String> = refs.iter().map(ResourceReference::id).collect();
            for (i, id) in ids.iter().enumerate() {
                fields.insert(format!("{}_id.{}", label, i), id.clone());
            }
            fields.insert(format!("{}_ids", label), ids.join(","));
        }
        for (i, c) in self.public_cidrs().into_iter().enumerate() {
            fields.insert(format!("public_cidr.{}", i), c);
        }
        for (i, c) in self.private_cidrs().into_iter().enumerate() {
            fields.insert(format!("private_cidr.{}", i), c);
        }
        fields
    }
}

fn cidrs_of(refs: &[ResourceReference]) -> Vec<String> {
    refs.iter()
        .filter_map(|r| r.computed().cidr_block().map(str::to_string))
        .collect()
}

/// Zone suffix for tag names: `us-east-1a` -> `a`.
fn zone_suffix(zone: &str) -> &str {
    zone.rsplit('-')
        .next()
        .map(|s| s.trim_start_matches(|c: char| c.is_ascii_digit()))
        .filter(|s| !s.is_empty())
        .unwrap_or(zone)
}

fn name_tag(name: String) -> Value {
    Value::Block(attrs! { "Name" => name })
}

/// Declare the VPC layout through primitive constructor calls.
pub fn vpc(ev: &mut Evaluator<'_>, name: &str, args: &VpcArgs) -> Result<VpcRef, EvalError> {
    let label = format!("component vpc.{}", name);
    let parent: Ipv4Cidr = args
        .cidr_block
        .parse()
        .map_err(|e| ValidationError::new(&label, "cidr_block", format!("invalid CIDR block: {}", e)))?;
    if args.availability_zones.is_empty() {
        return Err(ValidationError::new(&label, "availability_zones", "at least one zone is required").into());
    }
    let needed = args.availability_zones.len() * 2;
    if u32::from(parent.prefix()) + u32::from(SUBNET_NEWBITS) > 32 || needed > 1 << SUBNET_NEWBITS {
        return Err(ValidationError::new(
            &label,
            "cidr_block",
            format!("{} cannot hold {} /+{} subnets", args.cidr_block, needed, SUBNET_NEWBITS),
        )
        .into());
    }

    let mut vpc_attrs = attrs! {
        "cidr_block" => args.cidr_block.as_str(),
        "enable_dns_support" => true,
        "enable_dns_hostnames" => args.enable_dns_hostnames,
    };
    vpc_attrs.insert("tags".into(), name_tag(name.to_string()));
    let vpc = ev.declare("aws_vpc", name, vpc_attrs)?;

    let mut igw_attrs = attrs! { "vpc_id" => vpc.id() };
    igw_attrs.insert("tags".into(), name_tag(format!("{}-igw", name)));
    let internet_gateway = ev.declare("aws_internet_gateway", &format!("{}_igw", name), igw_attrs)?;

    let mut public_subnets = Vec::new();
    let mut private_subnets = Vec::new();
    let mut nat_eips = Vec::new();
    let mut nat_gateways = Vec::new();

    for (i, zone) in args.availability_zones.iter().enumerate() {
        let suffix = zone_suffix(zone);
        let index = i as u32;
        let public_cidr = parent
            .subnet(SUBNET_NEWBITS, 2 * index)
            .map_err(|e| ValidationError::new(&label, "cidr_block", e))?;
        let private_cidr = parent
            .subnet(SUBNET_NEWBITS, 2 * index + 1)
            .map_err(|e| ValidationError::new(&label, "cidr_block", e))?;

        let mut public_attrs = attrs! {
            "vpc_id" => vpc.id(),
            "cidr_block" => public_cidr.to_string(),
            "availability_zone" => zone.as_str(),
            "map_public_ip_on_launch" => true,
        };
        public_attrs.insert("tags".into(), name_tag(format!("{}-public-{}", name, suffix)));
        let public = ev.declare("aws_subnet", &format!("{}_public_{}", name, i), public_attrs)?;

        let mut private_attrs = attrs! {
            "vpc_id" => vpc.id(),
            "cidr_block" => private_cidr.to_string(),
            "availability_zone" => zone.as_str(),
        };
        private_attrs.insert("tags".into(), name_tag(format!("{}-private-{}", name, suffix)));
        let private = ev.declare("aws_subnet", &format!("{}_private_{}", name, i), private_attrs)?;

        if args.enable_nat_gateway {
            let mut eip_attrs = attrs! {
                "domain" => "vpc",
                "depends_on" => vec![Value::from(internet_gateway.address().to_string())],
            };
            eip_attrs.insert("tags".into(), name_tag(format!("{}-nat-{}", name, suffix)));
            let eip = ev.declare("aws_eip", &format!("{}_nat_eip_{}", name, i), eip_attrs)?;

            let mut nat_attrs = attrs! {
                "subnet_id" => public.id(),
                "allocation_id" => eip.id(),
            };
            nat_attrs.insert("tags".into(), name_tag(format!("{}-nat-{}", name, suffix)));
            let nat = ev.declare("aws_nat_gateway", &format!("{}_nat_{}", name, i), nat_attrs)?;
            nat_eips.push(eip);
            nat_gateways.push(nat);
        }

        public_subnets.push(public);
        private_subnets.push(private);
    }

    Ok(VpcRef {
        vpc,
        internet_gateway,
        public_subnets,
        private_subnets,
        nat_eips,
        nat_gateways,
        cidr_block: parent.to_string(),
        availability_zones: args.availability_zones.clone(),
    })
}

/// Registry entry point: parse inputs, run inside a component scope.
pub(crate) fn invoke(
    ev: &mut Evaluator<'_>,
    name: &str,
    inputs: &Attributes,
    tags: BTreeMap<String, String>,
) -> Result<ComponentFields, EvalError> {
    let args = VpcArgs::from_inputs(name, inputs)?;
    let vpc_ref = ev.component(name, tags, |ev| vpc(ev, name, &args))?;
    Ok(vpc_ref.fields())
}
