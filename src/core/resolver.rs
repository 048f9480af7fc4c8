//! ST-003: Reference resolution and template ordering.
//!
//! Two expression forms live in declarations:
//! - `{{params.key}}`, `{{module.inst.out}}`, `{{component.name.field}}`:
//!   substituted at evaluation time.
//! - `${type.name.attr}`: symbolic references left for the engine. They are
//!   never evaluated here, only checked for a target in the graph.
//!
//! Template apply order comes from cross-template references using Kahn's
//! algorithm with deterministic (alphabetical) tie-breaking.

use super::graph::{ResourceAddress, ResourceDefinition, ResourceGraph};
use super::types::Value;
use crate::error::{Error, UnresolvedReferenceError};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

// ============================================================================
// {{...}} placeholders
// ============================================================================

/// Substitute every `{{key}}` in a string.
pub fn resolve_placeholders(
    template: &str,
    lookup: &dyn Fn(&str) -> Result<Value, String>,
) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed placeholder at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim().to_string();
        let value = lookup(&key)?.to_string();
        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Substitute placeholders throughout a value. A string that is exactly one
/// placeholder takes the looked-up value with its type intact.
pub fn resolve_value(
    value: &Value,
    lookup: &dyn Fn(&str) -> Result<Value, String>,
) -> Result<Value, String> {
    match value {
        Value::Str(s) => {
            let trimmed = s.trim();
            if let Some(key) = trimmed
                .strip_prefix("{{")
                .and_then(|r| r.strip_suffix("}}"))
                .filter(|k| !k.contains("{{") && !k.contains("}}"))
            {
                return lookup(key.trim());
            }
            resolve_placeholders(s, lookup).map(Value::Str)
        }
        Value::List(items) => items
            .iter()
            .map(|v| resolve_value(v, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Value::Block(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_value(v, lookup)?)))
            .collect::<Result<_, String>>()
            .map(Value::Block),
        other => Ok(other.clone()),
    }
}

// ============================================================================
// ${...} references
// ============================================================================

/// Target of a `${type.name.attr}` expression.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefTarget {
    pub address: ResourceAddress,
    /// Attribute path; may be dotted (`ebs_block_device.0.id`)
    pub attribute: String,
}

enum Piece<'a> {
    Text(&'a str),
    Expr(&'a str),
}

/// Split into literal text and `${...}` expressions. An unclosed `${` is
/// returned as the error, verbatim from the opening marker.
fn split_expressions(s: &str) -> Result<Vec<Piece<'_>>, String> {
    let mut pieces = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find("${") {
        if open > 0 {
            pieces.push(Piece::Text(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let close = after.find('}').ok_or_else(|| rest[open..].to_string())?;
        pieces.push(Piece::Expr(&rest[open..open + 2 + close + 1]));
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

fn is_ident(s: &str) -> bool {
    super::evaluator::is_symbolic_name(s)
}

/// Parse `${type.name.attr[.more]}`.
pub fn parse_target(expr: &str) -> Option<RefTarget> {
    let inner = expr.strip_prefix("${")?.strip_suffix('}')?.trim();
    let mut parts = inner.splitn(3, '.');
    let rtype = parts.next()?;
    let name = parts.next()?;
    let attribute = parts.next()?;
    let attr_ok = !attribute.is_empty()
        && attribute
            .split('.')
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    if !is_ident(rtype) || !is_ident(name) || !attr_ok {
        return None;
    }
    Some(RefTarget {
        address: ResourceAddress::new(rtype, name),
        attribute: attribute.to_string(),
    })
}

/// Every reference in a string; malformed expressions are returned as `Err`.
pub fn references_in(s: &str) -> Result<Vec<RefTarget>, String> {
    let mut found = Vec::new();
    for piece in split_expressions(s)? {
        if let Piece::Expr(expr) = piece {
            found.push(parse_target(expr).ok_or_else(|| expr.to_string())?);
        }
    }
    Ok(found)
}

fn visit_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::Str(s) => out.push(s),
        Value::List(items) => items.iter().for_each(|v| visit_strings(v, out)),
        Value::Block(map) => map.values().for_each(|v| visit_strings(v, out)),
        _ => {}
    }
}

fn definition_strings(def: &ResourceDefinition) -> Vec<&str> {
    let mut out = Vec::new();
    for v in def.attributes.values() {
        visit_strings(v, &mut out);
    }
    out.extend(def.tags.values().map(String::as_str));
    out
}

/// Well-formed references held by a definition, in attribute order.
pub fn definition_references(def: &ResourceDefinition) -> Vec<RefTarget> {
    definition_strings(def)
        .into_iter()
        .filter_map(|s| references_in(s).ok())
        .flatten()
        .collect()
}

/// Check one definition against the graph; stops at the first dangling
/// reference.
pub fn check_definition(
    graph: &ResourceGraph,
    def: &ResourceDefinition,
) -> Result<(), UnresolvedReferenceError> {
    for s in definition_strings(def) {
        let pieces = split_expressions(s).map_err(|raw| UnresolvedReferenceError {
            from: def.address.clone(),
            target: raw.clone(),
            expression: raw,
        })?;
        for piece in pieces {
            let Piece::Expr(expr) = piece else { continue };
            match parse_target(expr) {
                None => {
                    return Err(UnresolvedReferenceError {
                        from: def.address.clone(),
                        target: expr.to_string(),
                        expression: expr.to_string(),
                    })
                }
                Some(t) if !graph.contains(&t.address) => {
                    return Err(UnresolvedReferenceError {
                        from: def.address.clone(),
                        target: t.address.to_string(),
                        expression: expr.to_string(),
                    })
                }
                Some(_) => {}
            }
        }
    }
    for dep in &def.depends_on {
        if !graph.contains(dep) {
            return Err(UnresolvedReferenceError {
                from: def.address.clone(),
                target: dep.to_string(),
                expression: format!("depends_on = [{}]", dep),
            });
        }
    }
    Ok(())
}

/// Closed-world check: every reference in the graph names a graph key.
pub fn validate_graph(graph: &ResourceGraph) -> Result<(), UnresolvedReferenceError> {
    for def in graph.iter() {
        check_definition(graph, def)?;
    }
    Ok(())
}

/// Rewrite references in a string; `f` returns the replacement expression
/// or `None` to keep it. Malformed text is left untouched.
pub fn rewrite_str(s: &str, f: &dyn Fn(&RefTarget) -> Option<String>) -> String {
    let Ok(pieces) = split_expressions(s) else {
        return s.to_string();
    };
    let mut out = String::with_capacity(s.len());
    for piece in pieces {
        match piece {
            Piece::Text(t) => out.push_str(t),
            Piece::Expr(expr) => match parse_target(expr).and_then(|t| f(&t)) {
                Some(replacement) => out.push_str(&replacement),
                None => out.push_str(expr),
            },
        }
    }
    out
}

/// [`rewrite_str`] over every string in a value.
pub fn rewrite_value(value: &Value, f: &dyn Fn(&RefTarget) -> Option<String>) -> Value {
    match value {
        Value::Str(s) if s.contains("${") => Value::Str(rewrite_str(s, f)),
        Value::List(items) => Value::List(items.iter().map(|v| rewrite_value(v, f)).collect()),
        Value::Block(map) => Value::Block(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite_value(v, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ============================================================================
// Template ordering
// ============================================================================

/// Deterministic template apply order: a template comes after every template
/// owning a resource it references. Kahn's algorithm, alphabetical ties.
pub fn template_order(graph: &ResourceGraph, templates: &[String]) -> Result<Vec<String>, Error> {
    let mut in_degree: BTreeMap<&str, usize> = templates.iter().map(|t| (t.as_str(), 0)).collect();
    let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for def in graph.iter() {
        let targets = definition_references(def)
            .into_iter()
            .map(|t| t.address)
            .chain(def.depends_on.iter().cloned());
        for target in targets {
            let Some(owner) = graph.get(&target).map(|d| d.template.as_str()) else {
                continue;
            };
            if owner != def.template
                && in_degree.contains_key(owner)
                && in_degree.contains_key(def.template.as_str())
                && edges.entry(owner).or_default().insert(def.template.as_str())
            {
                if let Some(d) = in_degree.get_mut(def.template.as_str()) {
                    *d += 1;
                }
            }
        }
    }

    // BTreeMap iteration is already sorted
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(t, _)| *t)
        .collect();

    let mut order = Vec::new();
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
        let mut next_ready = Vec::new();
        for &next in edges.get(current).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    next_ready.push(next);
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != in_degree.len() {
        let cycle: Vec<String> = in_degree
            .keys()
            .filter(|t| !order.iter().any(|o| o == *t))
            .map(|t| t.to_string())
            .collect();
        return Err(Error::TemplateCycle(cycle));
    }
    Ok(order)
}
