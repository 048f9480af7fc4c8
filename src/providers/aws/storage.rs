//! ST-013: aws_s3_bucket.

use crate::error::ValidationError;
use crate::providers::{AttrReader, IrBuilder, ResourceKind, ResourceSpec};
use regex::Regex;

pub const S3_BUCKET: ResourceKind = ResourceKind {
    type_name: "aws_s3_bucket",
    outputs: &["id", "arn", "bucket", "bucket_domain_name", "bucket_regional_domain_name"],
    taggable: true,
    parse: parse_bucket,
};

const BUCKET_NAME: &str = r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Bucket {
    pub bucket: Option<String>,
    pub bucket_prefix: Option<String>,
    pub force_destroy: Option<bool>,
    pub object_lock_enabled: Option<bool>,
}

/// Literal bucket names follow the S3 naming rules.
fn check_bucket_name(r: &AttrReader<'_>, name: &str) -> Result<(), ValidationError> {
    if name.contains("${") {
        return Ok(());
    }
    let re = Regex::new(BUCKET_NAME).map_err(|e| r.err("bucket", e.to_string()))?;
    if !re.is_match(name) || name.contains("..") {
        return Err(r.err(
            "bucket",
            "must be 3-63 characters of lowercase letters, digits, '.' and '-'",
        ));
    }
    Ok(())
}

fn parse_bucket(r: &mut AttrReader<'_>) -> Result<ResourceSpec, ValidationError> {
    r.exclusive("bucket", "bucket_prefix")?;
    let bucket = r.optional_str("bucket")?;
    if let Some(name) = &bucket {
        check_bucket_name(r, name)?;
    }
    let bucket_prefix = r.optional_str("bucket_prefix")?;
    if bucket_prefix.as_ref().is_some_and(|p| p.len() > 37) {
        return Err(r.err("bucket_prefix", "must be at most 37 characters"));
    }
    Ok(ResourceSpec::S3Bucket(S3Bucket {
        bucket,
        bucket_prefix,
        force_destroy: r.optional_bool("force_destroy")?,
        object_lock_enabled: r.optional_bool("object_lock_enabled")?,
    }))
}

impl S3Bucket {
    pub(crate) fn emit(&self, out: &mut IrBuilder) {
        out.opt_str("bucket", self.bucket.as_deref())
            .opt_str("bucket_prefix", self.bucket_prefix.as_deref())
            .opt_bool("force_destroy", self.force_destroy)
            .opt_bool("object_lock_enabled", self.object_lock_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::core::types::Attributes;

    fn parse(attrs: &Attributes) -> Result<ResourceSpec, ValidationError> {
        let mut r = AttrReader::new("aws_s3_bucket.logs", attrs);
        let spec = (S3_BUCKET.parse)(&mut r)?;
        r.finish()?;
        Ok(spec)
    }

    #[test]
    fn test_st013_bucket_name_rules() {
        assert!(parse(&attrs! { "bucket" => "acme-logs.prod" }).is_ok());
        assert!(parse(&attrs! { "bucket" => "Acme" }).is_err());
        assert!(parse(&attrs! { "bucket" => "ab" }).is_err());
        assert!(parse(&attrs! { "bucket" => "a..b" }).is_err());
        assert!(parse(&attrs! { "bucket" => "${aws_s3_bucket.x.id}-copy" }).is_ok());
    }

    #[test]
    fn test_st013_bucket_and_prefix_conflict() {
        let err = parse(&attrs! { "bucket" => "acme", "bucket_prefix" => "acme-" }).unwrap_err();
        assert_eq!(err.field, "bucket");
    }

    #[test]
    fn test_st013_bucket_without_name_is_allowed() {
        let spec = parse(&attrs! { "force_destroy" => true }).unwrap();
        assert_eq!(
            spec.computed(),
            crate::providers::Computed::Bucket { bucket: None }
        );
    }
}
