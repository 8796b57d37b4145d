//! Keyspace Codec
//!
//! Maps a JSON document onto flat key-value entries and back.
//!
//! ```text
//! base = instances/7f3c…/services/web
//!
//! {"listen": {"port": 80}, "hosts": ["a", "b"], "tls": {}}
//!
//!   instances/7f3c…/services/web/hosts/[0]      "a"
//!   instances/7f3c…/services/web/hosts/[1]      "b"
//!   instances/7f3c…/services/web/listen/port    80
//!   instances/7f3c…/services/web/tls            {}
//! ```
//!
//! Object keys are percent-encoded so a `/` inside a key never splits the
//! path, array positions are written as `[i]`, and every leaf holds the JSON
//! text of its value so types survive the round trip. Empty containers are
//! stored as leaves (`{}` / `[]`), which keeps an empty document visible.

use crate::domain::ports::KvPair;
use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

// =============================================================================
// Path Segments
// =============================================================================

/// One step in a document path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    /// Encode as a key segment
    pub fn encode(&self) -> String {
        match self {
            Segment::Key(key) => urlencoding::encode(key).into_owned(),
            Segment::Index(index) => format!("[{}]", index),
        }
    }

    /// Decode a key segment produced by [`Segment::encode`]
    pub fn decode(raw: &str) -> std::result::Result<Self, String> {
        if let Some(inner) = raw.strip_prefix('[') {
            let digits = inner
                .strip_suffix(']')
                .ok_or_else(|| format!("unterminated index segment {:?}", raw))?;
            return digits
                .parse()
                .map(Segment::Index)
                .map_err(|_| format!("bad index segment {:?}", raw));
        }
        urlencoding::decode(raw)
            .map(|key| Segment::Key(key.into_owned()))
            .map_err(|_| format!("segment {:?} is not valid UTF-8", raw))
    }
}

fn decode_path(path: &str) -> std::result::Result<Vec<Segment>, String> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    path.split('/').map(Segment::decode).collect()
}

// =============================================================================
// Encoding
// =============================================================================

/// Flatten `doc` into one entry per leaf under `base`.
///
/// A scalar or empty document produces a single entry at `base` itself.
pub fn encode_document(base: &str, doc: &Value) -> Result<Vec<KvPair>> {
    let mut leaves = Vec::new();
    let mut path = Vec::new();
    flatten_into(doc, &mut path, &mut leaves)?;

    Ok(leaves
        .into_iter()
        .map(|(relative, text)| {
            let key = if relative.is_empty() {
                base.to_string()
            } else {
                format!("{}/{}", base, relative)
            };
            KvPair::new(key, text.into_bytes())
        })
        .collect())
}

fn flatten_into(value: &Value, path: &mut Vec<String>, out: &mut Vec<(String, String)>) -> Result<()> {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                if key.is_empty() {
                    return Err(Error::InvalidArgument(
                        "config objects cannot contain empty keys".into(),
                    ));
                }
                path.push(Segment::Key(key.clone()).encode());
                flatten_into(child, path, out)?;
                path.pop();
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, child) in items.iter().enumerate() {
                path.push(Segment::Index(index).encode());
                flatten_into(child, path, out)?;
                path.pop();
            }
        }
        leaf => out.push((path.join("/"), leaf.to_string())),
    }
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

enum Node {
    Leaf(Value),
    Object(BTreeMap<String, Node>),
    Array(BTreeMap<usize, Node>),
}

impl Node {
    fn build(path: &[Segment], leaf: Value) -> Node {
        match path.split_first() {
            None => Node::Leaf(leaf),
            Some((Segment::Key(key), rest)) => {
                Node::Object(BTreeMap::from([(key.clone(), Node::build(rest, leaf))]))
            }
            Some((Segment::Index(index), rest)) => {
                Node::Array(BTreeMap::from([(*index, Node::build(rest, leaf))]))
            }
        }
    }

    fn insert(&mut self, path: &[Segment], leaf: Value) -> std::result::Result<(), String> {
        let Some((head, rest)) = path.split_first() else {
            return Err("value and container share a path".into());
        };
        match (self, head) {
            (Node::Object(children), Segment::Key(key)) => match children.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(Node::build(rest, leaf));
                    Ok(())
                }
                Entry::Occupied(mut slot) => slot.get_mut().insert(rest, leaf),
            },
            (Node::Array(items), Segment::Index(index)) => match items.entry(*index) {
                Entry::Vacant(slot) => {
                    slot.insert(Node::build(rest, leaf));
                    Ok(())
                }
                Entry::Occupied(mut slot) => slot.get_mut().insert(rest, leaf),
            },
            (Node::Leaf(_), _) => Err("value and container share a path".into()),
            _ => Err("object keys and array indices mixed at one level".into()),
        }
    }

    fn into_value(self) -> std::result::Result<Value, String> {
        match self {
            Node::Leaf(value) => Ok(value),
            Node::Object(children) => {
                let mut map = Map::new();
                for (key, child) in children {
                    map.insert(key, child.into_value()?);
                }
                Ok(Value::Object(map))
            }
            Node::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for (expected, (index, child)) in items.into_iter().enumerate() {
                    if index != expected {
                        return Err(format!("array is missing index {}", expected));
                    }
                    values.push(child.into_value()?);
                }
                Ok(Value::Array(values))
            }
        }
    }
}

fn parse_leaf(key: &str, raw: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| Error::decode(key, format!("leaf is not JSON: {}", e)))?;
    let nested = match &value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => false,
    };
    if nested {
        return Err(Error::decode(key, "leaf holds a non-empty container"));
    }
    Ok(value)
}

/// Rebuild the document stored under `base` from its entries.
///
/// Every entry must be `base` itself or live below `base/`.
pub fn decode_document(base: &str, entries: &[KvPair]) -> Result<Value> {
    let mut root: Option<Node> = None;

    for entry in entries {
        let relative = if entry.key == base {
            ""
        } else {
            entry
                .key
                .strip_prefix(base)
                .and_then(|rest| rest.strip_prefix('/'))
                .ok_or_else(|| Error::decode(&entry.key, format!("key is outside {}", base)))?
        };

        let path = decode_path(relative).map_err(|reason| Error::decode(&entry.key, reason))?;
        let leaf = parse_leaf(&entry.key, &entry.value)?;

        match root.as_mut() {
            None => root = Some(Node::build(&path, leaf)),
            Some(node) => node
                .insert(&path, leaf)
                .map_err(|reason| Error::decode(&entry.key, reason))?,
        }
    }

    root.ok_or_else(|| Error::decode(base, "no entries"))?
        .into_value()
        .map_err(|reason| Error::decode(base, reason))
}
