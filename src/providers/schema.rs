//! ST-014: Attribute schema reader and IR builder.
//!
//! [`AttrReader`] walks a declaration's attribute map field by field, so a
//! parse function reads like a schema. Every read marks the key as consumed;
//! [`AttrReader::finish`] rejects whatever was left over. [`IrBuilder`] is the
//! emit side: explicit, ordered attribute output per resource type.

use crate::components::cidr::Ipv4Cidr;
use crate::core::types::{Attributes, Value};
use crate::error::ValidationError;
use std::collections::BTreeSet;

/// Schema-driven reader over one attribute map.
#[derive(Debug)]
pub struct AttrReader<'a> {
    resource: String,
    prefix: String,
    attrs: &'a Attributes,
    consumed: BTreeSet<String>,
}

impl<'a> AttrReader<'a> {
    pub fn new(resource: impl Into<String>, attrs: &'a Attributes) -> Self {
        Self {
            resource: resource.into(),
            prefix: String::new(),
            attrs,
            consumed: BTreeSet::new(),
        }
    }

    fn nested(&self, prefix: String, attrs: &'a Attributes) -> Self {
        Self {
            resource: self.resource.clone(),
            prefix,
            attrs,
            consumed: BTreeSet::new(),
        }
    }

    /// Error naming `field` (with nesting prefix) and the violated rule.
    pub fn err(&self, field: &str, rule: impl Into<String>) -> ValidationError {
        ValidationError::new(&self.resource, format!("{}{}", self.prefix, field), rule)
    }

    fn take(&mut self, field: &str) -> Option<&'a Value> {
        self.consumed.insert(field.to_string());
        self.attrs.get(field).filter(|v| !v.is_null())
    }

    pub fn has(&self, field: &str) -> bool {
        self.attrs.get(field).is_some_and(|v| !v.is_null())
    }

    pub fn optional_str(&mut self, field: &str) -> Result<Option<String>, ValidationError> {
        match self.take(field) {
            None => Ok(None),
            Some(Value::Str(s)) if s.is_empty() => Err(self.err(field, "must not be empty")),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.err(field, format!("must be a string, got {}", other.kind()))),
        }
    }

    pub fn required_str(&mut self, field: &str) -> Result<String, ValidationError> {
        self.optional_str(field)?
            .ok_or_else(|| self.err(field, "required"))
    }

    pub fn optional_bool(&mut self, field: &str) -> Result<Option<bool>, ValidationError> {
        match self.take(field) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.err(field, format!("must be a bool, got {}", other.kind()))),
        }
    }

    /// Integer within `[min, max]`.
    pub fn optional_int(
        &mut self,
        field: &str,
        min: i64,
        max: i64,
    ) -> Result<Option<i64>, ValidationError> {
        match self.take(field) {
            None => Ok(None),
            Some(Value::Int(i)) if (min..=max).contains(i) => Ok(Some(*i)),
            Some(Value::Int(i)) => Err(self.err(
                field,
                format!("must be between {} and {}, got {}", min, max, i),
            )),
            Some(other) => Err(self.err(field, format!("must be an int, got {}", other.kind()))),
        }
    }

    pub fn required_int(&mut self, field: &str, min: i64, max: i64) -> Result<i64, ValidationError> {
        self.optional_int(field, min, max)?
            .ok_or_else(|| self.err(field, "required"))
    }

    /// String restricted to `choices`; interpolations pass through unchecked.
    pub fn optional_enum(
        &mut self,
        field: &str,
        choices: &[&str],
    ) -> Result<Option<String>, ValidationError> {
        let Some(value) = self.optional_str(field)? else {
            return Ok(None);
        };
        if value.contains("${") || choices.contains(&value.as_str()) {
            Ok(Some(value))
        } else {
            Err(self.err(
                field,
                format!("must be one of [{}], got '{}'", choices.join(", "), value),
            ))
        }
    }

    pub fn required_enum(&mut self, field: &str, choices: &[&str]) -> Result<String, ValidationError> {
        self.optional_enum(field, choices)?
            .ok_or_else(|| self.err(field, "required"))
    }

    /// IPv4 CIDR block; interpolations pass through unchecked.
    pub fn optional_cidr(&mut self, field: &str) -> Result<Option<String>, ValidationError> {
        let Some(value) = self.optional_str(field)? else {
            return Ok(None);
        };
        if value.contains("${") {
            return Ok(Some(value));
        }
        value
            .parse::<Ipv4Cidr>()
            .map(|_| Some(value))
            .map_err(|e| self.err(field, format!("invalid CIDR block: {}", e)))
    }

    pub fn required_cidr(&mut self, field: &str) -> Result<String, ValidationError> {
        self.optional_cidr(field)?
            .ok_or_else(|| self.err(field, "required"))
    }

    /// List of strings (absent = empty).
    pub fn string_list(&mut self, field: &str) -> Result<Vec<String>, ValidationError> {
        match self.take(field) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => items
                .iter()
                .enumerate()
                .map(|(i, v)| match v {
                    Value::Str(s) => Ok(s.clone()),
                    other => Err(self.err(
                        &format!("{}[{}]", field, i),
                        format!("must be a string, got {}", other.kind()),
                    )),
                })
                .collect(),
            Some(other) => Err(self.err(field, format!("must be a list, got {}", other.kind()))),
        }
    }

    /// A single nested block.
    pub fn block(&mut self, field: &str) -> Result<Option<AttrReader<'a>>, ValidationError> {
        match self.take(field) {
            None => Ok(None),
            Some(Value::Block(map)) => {
                Ok(Some(self.nested(format!("{}{}.", self.prefix, field), map)))
            }
            Some(other) => Err(self.err(field, format!("must be a block, got {}", other.kind()))),
        }
    }

    /// Repeated nested blocks, in order.
    pub fn blocks(&mut self, field: &str) -> Result<Vec<AttrReader<'a>>, ValidationError> {
        match self.take(field) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => items
                .iter()
                .enumerate()
                .map(|(i, v)| match v {
                    Value::Block(map) => {
                        Ok(self.nested(format!("{}{}[{}].", self.prefix, field, i), map))
                    }
                    other => Err(self.err(
                        &format!("{}[{}]", field, i),
                        format!("must be a block, got {}", other.kind()),
                    )),
                })
                .collect(),
            Some(Value::Block(map)) => Ok(vec![self.nested(format!("{}{}[0].", self.prefix, field), map)]),
            Some(other) => Err(self.err(field, format!("must be a list of blocks, got {}", other.kind()))),
        }
    }

    /// At most one of `a`, `b`.
    pub fn exclusive(&self, a: &str, b: &str) -> Result<(), ValidationError> {
        if self.has(a) && self.has(b) {
            return Err(self.err(a, format!("conflicts with '{}'", b)));
        }
        Ok(())
    }

    /// Exactly one of `a`, `b`.
    pub fn exactly_one(&self, a: &str, b: &str) -> Result<(), ValidationError> {
        self.exclusive(a, b)?;
        if !self.has(a) && !self.has(b) {
            return Err(self.err(a, format!("exactly one of '{}' or '{}' is required", a, b)));
        }
        Ok(())
    }

    /// Reject attributes no read consumed.
    pub fn finish(self) -> Result<(), ValidationError> {
        for key in self.attrs.keys() {
            if !self.consumed.contains(key) {
                return Err(self.err(key, "unknown attribute"));
            }
        }
        Ok(())
    }
}

/// Ordered IR attribute output.
#[derive(Debug, Default)]
pub struct IrBuilder {
    attrs: Attributes,
}

impl IrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn str(&mut self, key: &str, value: &str) -> &mut Self {
        self.attrs.insert(key.to_string(), Value::from(value));
        self
    }

    pub fn opt_str(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            self.str(key, v);
        }
        self
    }

    pub fn bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.attrs.insert(key.to_string(), Value::Bool(value));
        self
    }

    pub fn opt_bool(&mut self, key: &str, value: Option<bool>) -> &mut Self {
        if let Some(v) = value {
            self.bool(key, v);
        }
        self
    }

    pub fn int(&mut self, key: &str, value: i64) -> &mut Self {
        self.attrs.insert(key.to_string(), Value::Int(value));
        self
    }

    pub fn opt_int(&mut self, key: &str, value: Option<i64>) -> &mut Self {
        if let Some(v) = value {
            self.int(key, v);
        }
        self
    }

    /// String list; omitted when empty.
    pub fn list(&mut self, key: &str, values: &[String]) -> &mut Self {
        if !values.is_empty() {
            self.attrs.insert(
                key.to_string(),
                Value::List(values.iter().map(Value::from).collect()),
            );
        }
        self
    }

    /// Nested block.
    pub fn block(&mut self, key: &str, build: impl FnOnce(&mut IrBuilder)) -> &mut Self {
        let mut inner = IrBuilder::new();
        build(&mut inner);
        self.attrs.insert(key.to_string(), Value::Block(inner.finish()));
        self
    }

    /// Repeated blocks in item order; omitted when empty.
    pub fn blocks<T>(&mut self, key: &str, items: &[T], build: impl Fn(&T, &mut IrBuilder)) -> &mut Self {
        if items.is_empty() {
            return self;
        }
        let rendered = items
            .iter()
            .map(|item| {
                let mut inner = IrBuilder::new();
                build(item, &mut inner);
                Value::Block(inner.finish())
            })
            .collect();
        self.attrs.insert(key.to_string(), Value::List(rendered));
        self
    }

    pub fn finish(self) -> Attributes {
        self.attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;

    #[test]
    fn test_st014_required_and_unknown() {
        let a = attrs! { "x" => "1", "extra" => true };
        let mut r = AttrReader::new("t.n", &a);
        assert_eq!(r.required_str("x").unwrap(), "1");
        let err = r.required_str("missing").unwrap_err();
        assert_eq!(err.field, "missing");
        assert_eq!(err.rule, "required");
        let err = r.finish().unwrap_err();
        assert_eq!(err.field, "extra");
        assert_eq!(err.rule, "unknown attribute");
    }

    #[test]
    fn test_st014_null_counts_as_absent() {
        let a = attrs! { "x" => Value::Null };
        let mut r = AttrReader::new("t.n", &a);
        assert_eq!(r.optional_str("x").unwrap(), None);
        r.finish().unwrap();
    }

    #[test]
    fn test_st014_enum_and_interpolation() {
        let a = attrs! { "mode" => "bogus", "other" => "${aws_x.y.z}" };
        let mut r = AttrReader::new("t.n", &a);
        let err = r.optional_enum("mode", &["a", "b"]).unwrap_err();
        assert!(err.rule.contains("must be one of [a, b]"));
        assert_eq!(
            r.optional_enum("other", &["a"]).unwrap().as_deref(),
            Some("${aws_x.y.z}")
        );
    }

    #[test]
    fn test_st014_cidr_checks_skip_interpolations() {
        let a = attrs! { "good" => "10.0.0.0/16", "bad" => "10.0.0.0/33", "deferred" => "${aws_vpc.x.cidr_block}" };
        let mut r = AttrReader::new("t.n", &a);
        assert!(r.required_cidr("good").is_ok());
        assert!(r.required_cidr("bad").unwrap_err().rule.contains("invalid CIDR"));
        assert!(r.required_cidr("deferred").is_ok());
    }

    #[test]
    fn test_st014_int_range() {
        let a = attrs! { "port" => 70000_i64 };
        let mut r = AttrReader::new("t.n", &a);
        let err = r.optional_int("port", 0, 65535).unwrap_err();
        assert!(err.rule.contains("between 0 and 65535"));
    }

    #[test]
    fn test_st014_nested_field_paths() {
        let a = attrs! {
            "ingress" => vec![Value::Block(attrs! { "from_port" => "x" })],
        };
        let mut r = AttrReader::new("aws_security_group.web", &a);
        let mut blocks = r.blocks("ingress").unwrap();
        let err = blocks[0].optional_int("from_port", 0, 10).unwrap_err();
        assert_eq!(err.field, "ingress[0].from_port");
        assert_eq!(err.resource, "aws_security_group.web");
    }

    #[test]
    fn test_st014_exclusive_rules() {
        let a = attrs! { "a" => "1", "b" => "2" };
        let r = AttrReader::new("t.n", &a);
        assert!(r.exclusive("a", "b").unwrap_err().rule.contains("conflicts with 'b'"));
        let empty = Attributes::new();
        let r = AttrReader::new("t.n", &empty);
        assert!(r.exactly_one("a", "b").is_err());
        assert!(r.exclusive("a", "b").is_ok());
    }

    #[test]
    fn test_st014_builder_order_and_omissions() {
        let mut b = IrBuilder::new();
        b.str("z", "1")
            .opt_str("skip", None)
            .int("a", 2)
            .list("empty", &[])
            .block("nested", |n| {
                n.bool("x", true);
            })
            .blocks("rules", &[1_i64, 2], |i, n| {
                n.int("port", *i);
            });
        let attrs = b.finish();
        let keys: Vec<_> = attrs.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a", "nested", "rules"]);
        assert!(matches!(&attrs["rules"], Value::List(v) if v.len() == 2));
    }
}
