//! ST-012: aws_instance with nested and repeated block devices.

use crate::error::ValidationError;
use crate::providers::{AttrReader, IrBuilder, ResourceKind, ResourceSpec};

pub const INSTANCE: ResourceKind = ResourceKind {
    type_name: "aws_instance",
    outputs: &["id", "arn", "private_ip", "public_ip", "primary_network_interface_id"],
    taggable: true,
    parse: parse_instance,
};

const VOLUME_TYPES: &[&str] = &["gp2", "gp3", "io1", "io2", "st1", "sc1", "standard"];

/// Shared shape of root and EBS block devices.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockDevice {
    pub volume_size: Option<i64>,
    pub volume_type: Option<String>,
    pub iops: Option<i64>,
    pub encrypted: Option<bool>,
    pub delete_on_termination: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EbsBlockDevice {
    pub device_name: String,
    pub device: BlockDevice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub ami: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub key_name: Option<String>,
    pub vpc_security_group_ids: Vec<String>,
    pub associate_public_ip_address: Option<bool>,
    pub user_data: Option<String>,
    pub root_block_device: Option<BlockDevice>,
    pub ebs_block_device: Vec<EbsBlockDevice>,
}

fn parse_device(r: &mut AttrReader<'_>) -> Result<BlockDevice, ValidationError> {
    let device = BlockDevice {
        volume_size: r.optional_int("volume_size", 1, 16384)?,
        volume_type: r.optional_enum("volume_type", VOLUME_TYPES)?,
        iops: r.optional_int("iops", 100, 256_000)?,
        encrypted: r.optional_bool("encrypted")?,
        delete_on_termination: r.optional_bool("delete_on_termination")?,
    };
    let provisioned = matches!(device.volume_type.as_deref(), Some("io1" | "io2"));
    if provisioned && device.iops.is_none() {
        return Err(r.err("iops", "required when volume_type is io1 or io2"));
    }
    Ok(device)
}

fn parse_instance(r: &mut AttrReader<'_>) -> Result<ResourceSpec, ValidationError> {
    let ami = r.required_str("ami")?;
    let instance_type = r.required_str("instance_type")?;
    let subnet_id = r.optional_str("subnet_id")?;
    let key_name = r.optional_str("key_name")?;
    let vpc_security_group_ids = r.string_list("vpc_security_group_ids")?;
    let associate_public_ip_address = r.optional_bool("associate_public_ip_address")?;
    if associate_public_ip_address == Some(true) && subnet_id.is_none() {
        return Err(r.err(
            "associate_public_ip_address",
            "requires subnet_id to be set",
        ));
    }
    let user_data = r.optional_str("user_data")?;

    let root_block_device = match r.block("root_block_device")? {
        Some(mut block) => {
            let device = parse_device(&mut block)?;
            block.finish()?;
            Some(device)
        }
        None => None,
    };

    let mut ebs_block_device = Vec::new();
    for mut block in r.blocks("ebs_block_device")? {
        let device_name = block.required_str("device_name")?;
        let device = parse_device(&mut block)?;
        block.finish()?;
        ebs_block_device.push(EbsBlockDevice {
            device_name,
            device,
        });
    }
    for (i, a) in ebs_block_device.iter().enumerate() {
        if ebs_block_device[..i].iter().any(|b| b.device_name == a.device_name) {
            return Err(r.err(
                &format!("ebs_block_device[{}].device_name", i),
                format!("duplicate device '{}'", a.device_name),
            ));
        }
    }

    Ok(ResourceSpec::Instance(Instance {
        ami,
        instance_type,
        subnet_id,
        key_name,
        vpc_security_group_ids,
        associate_public_ip_address,
        user_data,
        root_block_device,
        ebs_block_device,
    }))
}

fn emit_device(device: &BlockDevice, out: &mut IrBuilder) {
    out.opt_int("volume_size", device.volume_size)
        .opt_str("volume_type", device.volume_type.as_deref())
        .opt_int("iops", device.iops)
        .opt_bool("encrypted", device.encrypted)
        .opt_bool("delete_on_termination", device.delete_on_termination);
}

impl Instance {
    pub(crate) fn emit(&self, out: &mut IrBuilder) {
        out.str("ami", &self.ami)
            .str("instance_type", &self.instance_type)
            .opt_str("subnet_id", self.subnet_id.as_deref())
            .opt_str("key_name", self.key_name.as_deref())
            .list("vpc_security_group_ids", &self.vpc_security_group_ids)
            .opt_bool("associate_public_ip_address", self.associate_public_ip_address)
            .opt_str("user_data", self.user_data.as_deref());
        if let Some(root) = &self.root_block_device {
            out.block("root_block_device", |b| emit_device(root, b));
        }
        out.blocks("ebs_block_device", &self.ebs_block_device, |ebs, b| {
            b.str("device_name", &ebs.device_name);
            emit_device(&ebs.device, b);
        });
    }
}
