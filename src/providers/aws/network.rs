//! ST-011: AWS networking types (VPC, subnet, gateways, EIP, security group).

use crate::error::ValidationError;
use crate::providers::{AttrReader, IrBuilder, ResourceKind, ResourceSpec};

pub const VPC: ResourceKind = ResourceKind {
    type_name: "aws_vpc",
    outputs: &[
        "id",
        "arn",
        "cidr_block",
        "default_security_group_id",
        "main_route_table_id",
    ],
    taggable: true,
    parse: parse_vpc,
};

pub const SUBNET: ResourceKind = ResourceKind {
    type_name: "aws_subnet",
    outputs: &["id", "arn", "cidr_block", "availability_zone"],
    taggable: true,
    parse: parse_subnet,
};

pub const INTERNET_GATEWAY: ResourceKind = ResourceKind {
    type_name: "aws_internet_gateway",
    outputs: &["id", "arn"],
    taggable: true,
    parse: parse_internet_gateway,
};

pub const EIP: ResourceKind = ResourceKind {
    type_name: "aws_eip",
    outputs: &["id", "allocation_id", "public_ip"],
    taggable: true,
    parse: parse_eip,
};

pub const NAT_GATEWAY: ResourceKind = ResourceKind {
    type_name: "aws_nat_gateway",
    outputs: &["id", "public_ip", "private_ip"],
    taggable: true,
    parse: parse_nat_gateway,
};

pub const SECURITY_GROUP: ResourceKind = ResourceKind {
    type_name: "aws_security_group",
    outputs: &["id", "arn", "name"],
    taggable: true,
    parse: parse_security_group,
};

// ============================================================================
// aws_vpc
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vpc {
    pub cidr_block: String,
    pub instance_tenancy: Option<String>,
    pub enable_dns_support: Option<bool>,
    pub enable_dns_hostnames: Option<bool>,
}

fn parse_vpc(r: &mut AttrReader<'_>) -> Result<ResourceSpec, ValidationError> {
    Ok(ResourceSpec::Vpc(Vpc {
        cidr_block: r.required_cidr("cidr_block")?,
        instance_tenancy: r.optional_enum("instance_tenancy", &["default", "dedicated"])?,
        enable_dns_support: r.optional_bool("enable_dns_support")?,
        enable_dns_hostnames: r.optional_bool("enable_dns_hostnames")?,
    }))
}

impl Vpc {
    pub(crate) fn emit(&self, out: &mut IrBuilder) {
        out.str("cidr_block", &self.cidr_block)
            .opt_str("instance_tenancy", self.instance_tenancy.as_deref())
            .opt_bool("enable_dns_support", self.enable_dns_support)
            .opt_bool("enable_dns_hostnames", self.enable_dns_hostnames);
    }
}

// ============================================================================
// aws_subnet
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub vpc_id: String,
    pub cidr_block: String,
    pub availability_zone: Option<String>,
    pub availability_zone_id: Option<String>,
    pub map_public_ip_on_launch: Option<bool>,
}

fn parse_subnet(r: &mut AttrReader<'_>) -> Result<ResourceSpec, ValidationError> {
    r.exclusive("availability_zone", "availability_zone_id")?;
    Ok(ResourceSpec::Subnet(Subnet {
        vpc_id: r.required_str("vpc_id")?,
        cidr_block: r.required_cidr("cidr_block")?,
        availability_zone: r.optional_str("availability_zone")?,
        availability_zone_id: r.optional_str("availability_zone_id")?,
        map_public_ip_on_launch: r.optional_bool("map_public_ip_on_launch")?,
    }))
}

impl Subnet {
    pub(crate) fn emit(&self, out: &mut IrBuilder) {
        out.str("vpc_id", &self.vpc_id)
            .str("cidr_block", &self.cidr_block)
            .opt_str("availability_zone", self.availability_zone.as_deref())
            .opt_str("availability_zone_id", self.availability_zone_id.as_deref())
            .opt_bool("map_public_ip_on_launch", self.map_public_ip_on_launch);
    }
}

// ============================================================================
// aws_internet_gateway / aws_eip
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternetGateway {
    pub vpc_id: Option<String>,
}

fn parse_internet_gateway(r: &mut AttrReader<'_>) -> Result<ResourceSpec, ValidationError> {
    Ok(ResourceSpec::InternetGateway(InternetGateway {
        vpc_id: r.optional_str("vpc_id")?,
    }))
}

impl InternetGateway {
    pub(crate) fn emit(&self, out: &mut IrBuilder) {
        out.opt_str("vpc_id", self.vpc_id.as_deref());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip {
    pub domain: String,
}

fn parse_eip(r: &mut AttrReader<'_>) -> Result<ResourceSpec, ValidationError> {
    Ok(ResourceSpec::Eip(Eip {
        domain: r
            .optional_enum("domain", &["vpc", "standard"])?
            .unwrap_or_else(|| "vpc".to_string()),
    }))
}

impl Eip {
    pub(crate) fn emit(&self, out: &mut IrBuilder) {
        out.str("domain", &self.domain);
    }
}

// ============================================================================
// aws_nat_gateway
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatGateway {
    pub subnet_id: String,
    pub connectivity_type: String,
    pub allocation_id: Option<String>,
}

fn parse_nat_gateway(r: &mut AttrReader<'_>) -> Result<ResourceSpec, ValidationError> {
    let subnet_id = r.required_str("subnet_id")?;
    let connectivity_type = r
        .optional_enum("connectivity_type", &["public", "private"])?
        .unwrap_or_else(|| "public".to_string());
    let allocation_id = r.optional_str("allocation_id")?;
    match (connectivity_type.as_str(), &allocation_id) {
        ("public", None) => {
            return Err(r.err("allocation_id", "required when connectivity_type is public"))
        }
        ("private", Some(_)) => {
            return Err(r.err("allocation_id", "not allowed when connectivity_type is private"))
        }
        _ => {}
    }
    Ok(ResourceSpec::NatGateway(NatGateway {
        subnet_id,
        connectivity_type,
        allocation_id,
    }))
}

impl NatGateway {
    pub(crate) fn emit(&self, out: &mut IrBuilder) {
        out.str("subnet_id", &self.subnet_id)
            .str("connectivity_type", &self.connectivity_type)
            .opt_str("allocation_id", self.allocation_id.as_deref());
    }
}

// ============================================================================
// aws_security_group
// ============================================================================

/// One ingress or egress rule block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupRule {
    pub from_port: i64,
    pub to_port: i64,
    pub protocol: String,
    pub cidr_blocks: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub name: Option<String>,
    pub name_prefix: Option<String>,
    pub description: Option<String>,
    pub vpc_id: Option<String>,
    pub ingress: Vec<SecurityGroupRule>,
    pub egress: Vec<SecurityGroupRule>,
}

fn parse_rule(mut r: AttrReader<'_>) -> Result<SecurityGroupRule, ValidationError> {
    let from_port = r.required_int("from_port", 0, 65535)?;
    let to_port = r.required_int("to_port", 0, 65535)?;
    let protocol = r.required_enum("protocol", &["tcp", "udp", "icmp", "-1"])?;
    if from_port > to_port {
        return Err(r.err("from_port", format!("must not exceed to_port ({})", to_port)));
    }
    if protocol == "-1" && (from_port != 0 || to_port != 0) {
        return Err(r.err("protocol", "'-1' (all traffic) requires from_port and to_port of 0"));
    }
    let cidr_blocks = r.string_list("cidr_blocks")?;
    for (i, block) in cidr_blocks.iter().enumerate() {
        if !block.contains("${") && block.parse::<crate::components::cidr::Ipv4Cidr>().is_err() {
            return Err(r.err(&format!("cidr_blocks[{}]", i), "invalid CIDR block"));
        }
    }
    let rule = SecurityGroupRule {
        from_port,
        to_port,
        protocol,
        cidr_blocks,
        description: r.optional_str("description")?,
    };
    r.finish()?;
    Ok(rule)
}

fn parse_security_group(r: &mut AttrReader<'_>) -> Result<ResourceSpec, ValidationError> {
    r.exclusive("name", "name_prefix")?;
    let name = r.optional_str("name")?;
    let name_prefix = r.optional_str("name_prefix")?;
    let description = r.optional_str("description")?;
    let vpc_id = r.optional_str("vpc_id")?;
    let ingress = r
        .blocks("ingress")?
        .into_iter()
        .map(parse_rule)
        .collect::<Result<Vec<_>, _>>()?;
    let egress = r
        .blocks("egress")?
        .into_iter()
        .map(parse_rule)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ResourceSpec::SecurityGroup(SecurityGroup {
        name,
        name_prefix,
        description,
        vpc_id,
        ingress,
        egress,
    }))
}

fn emit_rule(rule: &SecurityGroupRule, out: &mut IrBuilder) {
    out.int("from_port", rule.from_port)
        .int("to_port", rule.to_port)
        .str("protocol", &rule.protocol)
        .list("cidr_blocks", &rule.cidr_blocks)
        .opt_str("description", rule.description.as_deref());
}

impl SecurityGroup {
    pub(crate) fn emit(&self, out: &mut IrBuilder) {
        out.opt_str("name", self.name.as_deref())
            .opt_str("name_prefix", self.name_prefix.as_deref())
            .opt_str("description", self.description.as_deref())
            .opt_str("vpc_id", self.vpc_id.as_deref())
            .blocks("ingress", &self.ingress, emit_rule)
            .blocks("egress", &self.egress, emit_rule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::core::types::{Attributes, Value};

    fn parse(kind: &ResourceKind, attrs: &Attributes) -> Result<ResourceSpec, ValidationError> {
        let mut r = AttrReader::new(format!("{}.t", kind.type_name), attrs);
        let spec = (kind.parse)(&mut r)?;
        r.finish()?;
        Ok(spec)
    }

    #[test]
    fn test_st011_vpc_requires_cidr() {
        let err = parse(&VPC, &attrs! {}).unwrap_err();
        assert_eq!(err.field, "cidr_block");
        assert_eq!(err.rule, "required");
        let err = parse(&VPC, &attrs! { "cidr_block" => "10.0.0.0/16", "instance_tenancy" => "host" })
            .unwrap_err();
        assert_eq!(err.field, "instance_tenancy");
    }

    #[test]
    fn test_st011_subnet_zone_fields_are_exclusive() {
        let err = parse(
            &SUBNET,
            &attrs! {
                "vpc_id" => "${aws_vpc.main.id}",
                "cidr_block" => "10.0.0.0/24",
                "availability_zone" => "us-east-1a",
                "availability_zone_id" => "use1-az1",
            },
        )
        .unwrap_err();
        assert!(err.rule.contains("conflicts with 'availability_zone_id'"));
    }

    #[test]
    fn test_st011_nat_gateway_cross_field() {
        let err = parse(&NAT_GATEWAY, &attrs! { "subnet_id" => "${aws_subnet.a.id}" }).unwrap_err();
        assert_eq!(err.field, "allocation_id");
        assert!(err.rule.contains("required when connectivity_type is public"));

        let err = parse(
            &NAT_GATEWAY,
            &attrs! {
                "subnet_id" => "${aws_subnet.a.id}",
                "connectivity_type" => "private",
                "allocation_id" => "${aws_eip.a.id}",
            },
        )
        .unwrap_err();
        assert!(err.rule.contains("not allowed"));

        assert!(parse(
            &NAT_GATEWAY,
            &attrs! { "subnet_id" => "s", "connectivity_type" => "private" }
        )
        .is_ok());
    }

    #[test]
    fn test_st011_security_group_rules_emit_in_order() {
        let rule = |port: i64| {
            Value::Block(attrs! {
                "from_port" => port,
                "to_port" => port,
                "protocol" => "tcp",
                "cidr_blocks" => vec![Value::from("0.0.0.0/0")],
            })
        };
        let spec = parse(
            &SECURITY_GROUP,
            &attrs! {
                "name" => "web",
                "ingress" => vec![rule(443), rule(80)],
            },
        )
        .unwrap();
        let attrs = spec.emit();
        let Value::List(ingress) = &attrs["ingress"] else {
            panic!("ingress must be a list");
        };
        let ports: Vec<_> = ingress
            .iter()
            .map(|b| match b {
                Value::Block(m) => m["from_port"].as_i64().unwrap(),
                _ => -1,
            })
            .collect();
        assert_eq!(ports, vec![443, 80]);
        assert!(!attrs.contains_key("egress"));
    }

    #[test]
    fn test_st011_security_group_rule_errors() {
        let err = parse(
            &SECURITY_GROUP,
            &attrs! {
                "ingress" => vec![Value::Block(attrs! {
                    "from_port" => 90_i64, "to_port" => 80_i64, "protocol" => "tcp",
                })],
            },
        )
        .unwrap_err();
        assert_eq!(err.field, "ingress[0].from_port");

        let err = parse(
            &SECURITY_GROUP,
            &attrs! {
                "egress" => vec![Value::Block(attrs! {
                    "from_port" => 0_i64, "to_port" => 0_i64, "protocol" => "-1", "bogus" => 1_i64,
                })],
            },
        )
        .unwrap_err();
        assert_eq!(err.field, "egress[0].bogus");
        assert_eq!(err.rule, "unknown attribute");
    }

    #[test]
    fn test_st011_eip_defaults_domain() {
        let spec = parse(&EIP, &attrs! {}).unwrap();
        assert_eq!(spec.emit()["domain"], Value::from("vpc"));
    }
}
