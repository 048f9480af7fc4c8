//! ST-011: AWS provider resource kinds.

pub mod compute;
pub mod network;
pub mod storage;

use super::ProviderModule;

pub static PROVIDER: ProviderModule = ProviderModule {
    name: "aws",
    kinds: &[
        network::VPC,
        network::SUBNET,
        network::INTERNET_GATEWAY,
        network::EIP,
        network::NAT_GATEWAY,
        network::SECURITY_GROUP,
        storage::S3_BUCKET,
        compute::INSTANCE,
    ],
};
