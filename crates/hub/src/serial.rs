// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Object-graph serialization codec.
//!
//! Converts an in-memory value graph (plain objects, arrays, key-ordered
//! maps, unique-value sets, timestamps) into a JSON-safe tree and back.
//! Non-plain containers are tagged with `__object_type__` envelopes so the
//! round trip preserves their type. Serialization memoizes by node identity:
//! each distinct node is converted at most once, so shared sub-graphs cost a
//! single conversion and collapse to structurally-equal copies on the way
//! back.
//!
//! Nodes are immutable reference-counted trees, so genuinely self-referential
//! cycles cannot be constructed; cyclic input is out of contract.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Number, Value};

use crate::error::Cancelled;
use crate::idler::Idler;

/// Envelope key marking a non-plain container.
pub const OBJECT_TYPE_KEY: &str = "__object_type__";
/// Envelope key carrying the container payload.
pub const DATA_KEY: &str = "data";

/// A node in a serializable value graph.
///
/// Children are `Arc`-shared; sharing the same `Arc` in several places is
/// what the memoization keys on.
#[derive(Debug, Clone)]
pub enum Node {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Timestamp, encoded as an RFC 3339 string on the wire.
    Date(DateTime<Utc>),
    /// Ordered collection.
    Array(Vec<Arc<Node>>),
    /// Plain key-value object with string keys, in insertion order.
    Object(Vec<(String, Arc<Node>)>),
    /// Key-ordered map with arbitrary keys.
    Map(Vec<(Arc<Node>, Arc<Node>)>),
    /// Unique-value set in insertion order.
    Set(Vec<Arc<Node>>),
}

impl Node {
    pub fn null() -> Arc<Node> {
        Arc::new(Node::Null)
    }

    pub fn bool(b: bool) -> Arc<Node> {
        Arc::new(Node::Bool(b))
    }

    pub fn int(i: i64) -> Arc<Node> {
        Arc::new(Node::Number(Number::from(i)))
    }

    /// Non-finite floats have no JSON form and degrade to null.
    pub fn float(f: f64) -> Arc<Node> {
        Arc::new(Number::from_f64(f).map_or(Node::Null, Node::Number))
    }

    pub fn string(s: impl Into<String>) -> Arc<Node> {
        Arc::new(Node::String(s.into()))
    }

    pub fn date(ts: DateTime<Utc>) -> Arc<Node> {
        Arc::new(Node::Date(ts))
    }

    pub fn array(items: Vec<Arc<Node>>) -> Arc<Node> {
        Arc::new(Node::Array(items))
    }

    pub fn object(fields: Vec<(impl Into<String>, Arc<Node>)>) -> Arc<Node> {
        Arc::new(Node::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect()))
    }

    pub fn map(entries: Vec<(Arc<Node>, Arc<Node>)>) -> Arc<Node> {
        Arc::new(Node::Map(entries))
    }

    /// Builds a set, dropping structurally-equal duplicates while keeping
    /// first-insertion order.
    pub fn set(values: Vec<Arc<Node>>) -> Arc<Node> {
        let mut unique: Vec<Arc<Node>> = Vec::with_capacity(values.len());
        for value in values {
            if !unique.contains(&value) {
                unique.push(value);
            }
        }
        Arc::new(Node::Set(unique))
    }
}

// Plain-object equality ignores property order: JSON objects come back from
// the wire in map order, not insertion order.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Node::Null, Node::Null) => true,
            (Node::Bool(a), Node::Bool(b)) => a == b,
            (Node::Number(a), Node::Number(b)) => a == b,
            (Node::String(a), Node::String(b)) => a == b,
            (Node::Date(a), Node::Date(b)) => a == b,
            (Node::Array(a), Node::Array(b)) | (Node::Set(a), Node::Set(b)) => a == b,
            (Node::Map(a), Node::Map(b)) => a == b,
            (Node::Object(a), Node::Object(b)) => {
                if a.len() != b.len() {
                    return false;
                }
                let mut left: Vec<_> = a.iter().collect();
                let mut right: Vec<_> = b.iter().collect();
                left.sort_by(|x, y| x.0.cmp(&y.0));
                right.sort_by(|x, y| x.0.cmp(&y.0));
                left.iter().zip(right).all(|(x, y)| x.0 == y.0 && x.1 == y.1)
            }
            _ => false,
        }
    }
}

/// Optional knobs for [`serialize`] / [`make_serializable`].
#[derive(Default)]
pub struct SerializeOptions<'a> {
    /// Cooperative yield point checked between work-stack pops.
    pub idler: Option<&'a dyn Idler>,
    /// Progress sink; receives monotonically advancing status lines.
    pub on_status: Option<&'a mut (dyn FnMut(String) + Send)>,
    /// Label prefixing status lines. Defaults to "Serializing".
    pub label: Option<&'a str>,
}

/// Convert a graph to its JSON string form.
pub async fn serialize(root: &Arc<Node>, opts: SerializeOptions<'_>) -> anyhow::Result<String> {
    let value = make_serializable(root, opts).await?;
    Ok(serde_json::to_string(&value)?)
}

/// Parse a JSON string back into a graph.
pub fn deserialize(raw: &str) -> anyhow::Result<Arc<Node>> {
    let value: Value = serde_json::from_str(raw)?;
    Ok(deserialize_object(&value))
}

fn node_key(node: &Arc<Node>) -> usize {
    Arc::as_ptr(node) as usize
}

/// JSON form of a leaf node, or `None` for containers.
fn leaf_value(node: &Node) -> Option<Value> {
    match node {
        Node::Null => Some(Value::Null),
        Node::Bool(b) => Some(Value::Bool(*b)),
        Node::Number(n) => Some(Value::Number(n.clone())),
        Node::String(s) => Some(Value::String(s.clone())),
        Node::Date(ts) => Some(json!({
            OBJECT_TYPE_KEY: "Date",
            DATA_KEY: ts.to_rfc3339(),
        })),
        _ => None,
    }
}

/// Resolve one child: reuse the memoized form, memoize leaves inline, or
/// push an unresolved container onto the work stack.
fn resolve_child(
    child: &Arc<Node>,
    dict: &mut HashMap<usize, Value>,
    stack: &mut Vec<Arc<Node>>,
) -> Option<Value> {
    let key = node_key(child);
    if let Some(value) = dict.get(&key) {
        return Some(value.clone());
    }
    if let Some(value) = leaf_value(child) {
        dict.insert(key, value.clone());
        return Some(value);
    }
    stack.push(Arc::clone(child));
    None
}

fn resolve_items(
    items: &[Arc<Node>],
    dict: &mut HashMap<usize, Value>,
    stack: &mut Vec<Arc<Node>>,
) -> Option<Vec<Value>> {
    let mut out = Vec::with_capacity(items.len());
    let mut pending = false;
    for item in items {
        match resolve_child(item, dict, stack) {
            Some(value) if !pending => out.push(value),
            Some(_) => {}
            None => pending = true,
        }
    }
    (!pending).then_some(out)
}

fn resolve_entries(
    entries: &[(Arc<Node>, Arc<Node>)],
    dict: &mut HashMap<usize, Value>,
    stack: &mut Vec<Arc<Node>>,
) -> Option<Vec<Value>> {
    let mut out = Vec::with_capacity(entries.len());
    let mut pending = false;
    for (key, value) in entries {
        let k = resolve_child(key, dict, stack);
        let v = resolve_child(value, dict, stack);
        match (k, v) {
            (Some(k), Some(v)) if !pending => out.push(Value::Array(vec![k, v])),
            (Some(_), Some(_)) => {}
            _ => pending = true,
        }
    }
    (!pending).then_some(out)
}

fn resolve_fields(
    fields: &[(String, Arc<Node>)],
    dict: &mut HashMap<usize, Value>,
    stack: &mut Vec<Arc<Node>>,
) -> Option<Map<String, Value>> {
    let mut out = Map::new();
    let mut pending = false;
    for (key, value) in fields {
        match resolve_child(value, dict, stack) {
            Some(v) if !pending => {
                out.insert(key.clone(), v);
            }
            Some(_) => {}
            None => pending = true,
        }
    }
    (!pending).then_some(out)
}

/// Convert a graph into a JSON-safe [`Value`] tree.
///
/// Runs an explicit work stack rather than recursing, yielding through the
/// idler between pops so arbitrarily large graphs never block the runtime.
pub async fn make_serializable(
    root: &Arc<Node>,
    mut opts: SerializeOptions<'_>,
) -> Result<Value, Cancelled> {
    if let Some(value) = leaf_value(root) {
        return Ok(value);
    }

    let mut dict: HashMap<usize, Value> = HashMap::new();
    let mut stack: Vec<Arc<Node>> = vec![Arc::clone(root)];
    let mut iterations: usize = 0;
    let mut prev_len = stack.len();
    let mut accumulator = prev_len;

    while let Some(top) = stack.last().map(Arc::clone) {
        if let Some(idler) = opts.idler {
            if idler.should_idle() {
                idler.idle().await?;
            }
        }

        // A node can sit on the stack more than once when several parents
        // pushed it before it resolved; later visits are no-ops.
        if dict.contains_key(&node_key(&top)) {
            stack.pop();
            continue;
        }

        let resolved = match &*top {
            Node::Array(items) => resolve_items(items, &mut dict, &mut stack).map(Value::Array),
            Node::Set(items) => resolve_items(items, &mut dict, &mut stack).map(|values| {
                json!({ OBJECT_TYPE_KEY: "Set", DATA_KEY: values })
            }),
            Node::Map(entries) => resolve_entries(entries, &mut dict, &mut stack).map(|pairs| {
                json!({ OBJECT_TYPE_KEY: "Map", DATA_KEY: pairs })
            }),
            Node::Object(fields) => {
                resolve_fields(fields, &mut dict, &mut stack).map(Value::Object)
            }
            _ => leaf_value(&top),
        };

        let Some(value) = resolved else {
            // Unresolved children were pushed; work on those first.
            continue;
        };

        dict.insert(node_key(&top), value);
        stack.pop();

        iterations += 1;
        if stack.len() >= prev_len {
            accumulator += stack.len() - prev_len + 1;
        }
        if let Some(on_status) = opts.on_status.as_mut() {
            let total = accumulator.max(iterations);
            let pct = (iterations as f64 / total as f64) * 100.0;
            let label = opts.label.unwrap_or("Serializing");
            on_status(format!("{label}: {iterations} / {total} ({pct:.2}%)"));
        }
        prev_len = stack.len();
    }

    Ok(dict.remove(&node_key(root)).unwrap_or(Value::Null))
}

/// Inverse of [`make_serializable`].
pub fn deserialize_object(value: &Value) -> Arc<Node> {
    match value {
        Value::Null => Node::null(),
        Value::Bool(b) => Node::bool(*b),
        Value::Number(n) => Arc::new(Node::Number(n.clone())),
        Value::String(s) => Node::string(s.clone()),
        Value::Array(items) => Node::array(items.iter().map(deserialize_object).collect()),
        Value::Object(map) => deserialize_map_object(map),
    }
}

fn deserialize_map_object(map: &Map<String, Value>) -> Arc<Node> {
    if let Some(Value::String(tag)) = map.get(OBJECT_TYPE_KEY) {
        let data = map.get(DATA_KEY);
        match (tag.as_str(), data) {
            ("Map", Some(Value::Array(pairs))) => {
                let entries = pairs
                    .iter()
                    .filter_map(|pair| match pair {
                        Value::Array(kv) if kv.len() == 2 => {
                            Some((deserialize_object(&kv[0]), deserialize_object(&kv[1])))
                        }
                        _ => None,
                    })
                    .collect();
                return Node::map(entries);
            }
            ("Set", Some(Value::Array(items))) => {
                return Node::set(items.iter().map(deserialize_object).collect());
            }
            ("Date", Some(Value::String(raw))) => {
                return match DateTime::parse_from_rfc3339(raw) {
                    Ok(ts) => Node::date(ts.with_timezone(&Utc)),
                    // Unparseable timestamps survive as their string form.
                    Err(_) => Node::string(raw.clone()),
                };
            }
            _ => {}
        }
    }

    Arc::new(Node::Object(
        map.iter().map(|(k, v)| (k.clone(), deserialize_object(v))).collect(),
    ))
}

#[cfg(test)]
#[path = "serial_tests.rs"]
mod tests;
