// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! A duck-typed document tree standing in for the index/require YAML inputs.
//!
//! Modelled as an explicit discriminated tree rather than a typed struct
//! because real inputs may contain duplicate keys in a map (e.g. two `Mac`
//! blocks merged at read time); callers must iterate raw pairs rather than
//! go through a deduplicating map.

use serde::de::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Scalar(String, Option<String>),
    Seq(Vec<Node>),
    Map(Vec<(String, Node)>),
}

impl Node {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Scalar(s, _) => Some(s),
            _ => None,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Node::Scalar(_, tag) => tag.as_deref(),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Node]> {
        match self {
            Node::Seq(items) => Some(items),
            _ => None,
        }
    }

    /// Every value associated with `key` in a map node, in document order,
    /// duplicates included.
    pub fn get_all<'a>(&'a self, key: &str) -> Vec<&'a Node> {
        match self {
            Node::Map(pairs) => pairs.iter().filter(|(k, _)| k == key).map(|(_, v)| v).collect(),
            _ => Vec::new(),
        }
    }

    /// The first value associated with `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.get_all(key).into_iter().next()
    }

    pub fn keys(&self) -> Vec<&str> {
        match self {
            Node::Map(pairs) => pairs.iter().map(|(k, _)| k.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// Normalise a node that may be a bare scalar or a sequence of scalars
    /// into a flat list of `(value, tag)` pairs.
    pub fn scalars(&self) -> Vec<(String, Option<String>)> {
        match self {
            Node::Scalar(s, tag) => vec![(s.clone(), tag.clone())],
            Node::Seq(items) => items.iter().flat_map(Node::scalars).collect(),
            Node::Map(_) => Vec::new(),
        }
    }
}

/// Parse a YAML document into a [`Node`] tree.
///
/// Drives `serde_yaml`'s deserializer directly rather than going through
/// `serde_yaml::Value`, whose `Mapping` type de-duplicates keys during
/// construction (last write wins). [`NodeVisitor::visit_map`] collects every
/// `(key, value)` pair `serde_yaml` hands it in document order, duplicates
/// included, so a real duplicate-key map round-trips intact.
pub fn parse(text: &str) -> Result<Node, serde_yaml::Error> {
    Node::deserialize(serde_yaml::Deserializer::from_str(text))
}

impl<'de> serde::de::Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        deserializer.deserialize_any(NodeVisitor)
    }
}

struct NodeVisitor;

impl<'de> serde::de::Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a YAML scalar, sequence, or mapping")
    }

    fn visit_bool<E>(self, v: bool) -> Result<Node, E> {
        Ok(Node::Scalar(v.to_string(), None))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Node, E> {
        Ok(Node::Scalar(v.to_string(), None))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Node, E> {
        Ok(Node::Scalar(v.to_string(), None))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Node, E> {
        Ok(Node::Scalar(v.to_string(), None))
    }

    fn visit_str<E>(self, v: &str) -> Result<Node, E> {
        Ok(Node::Scalar(v.to_string(), None))
    }

    fn visit_string<E>(self, v: String) -> Result<Node, E> {
        Ok(Node::Scalar(v, None))
    }

    fn visit_unit<E>(self) -> Result<Node, E> {
        Ok(Node::Scalar(String::new(), None))
    }

    fn visit_none<E>(self) -> Result<Node, E> {
        Ok(Node::Scalar(String::new(), None))
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Node, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        Node::deserialize(deserializer)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Node, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element::<Node>()? {
            items.push(item);
        }
        Ok(Node::Seq(items))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Node, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let mut pairs = Vec::new();
        while let Some(pair) = map.next_entry::<String, Node>()? {
            pairs.push(pair);
        }
        Ok(Node::Map(pairs))
    }

    /// Native `!tag value` form. No index/require document in this
    /// codebase actually uses YAML tag syntax (tags travel as plain
    /// `tag: "!file"` string values instead, read via [`Node::get`]), but a
    /// document that did would otherwise fail outright here rather than
    /// just losing the tag.
    fn visit_enum<A>(self, data: A) -> Result<Node, A::Error>
    where
        A: serde::de::EnumAccess<'de>,
    {
        use serde::de::VariantAccess;

        let (tag, variant) = data.variant::<String>()?;
        match variant.newtype_variant::<Node>()? {
            Node::Scalar(s, _) => Ok(Node::Scalar(s, Some(tag))),
            other => Ok(other),
        }
    }
}

/// The seven OS identifiers a detail row may be scoped to.
pub const OS_IDS: &[&str] = &["common", "Mac", "Mac32", "Mac64", "Win", "Win32", "Win64"];

/// OS groups used when expanding a relative `install_sources` path: each
/// member of a group materialises a physical row prefixed by the group name.
pub const MAC_GROUP: &[&str] = &["common", "Mac", "Mac32", "Mac64"];
pub const WIN_GROUP: &[&str] = &["common", "Win", "Win32", "Win64"];

/// Map a specific OS id to the path prefix used for group-relative sources.
pub fn path_prefix_os(os_id: &str) -> Option<&'static str> {
    match os_id {
        "Mac" | "Mac32" | "Mac64" => Some("Mac"),
        "Win" | "Win32" | "Win64" => Some("Win"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_preserves_duplicate_keys() {
        let doc = parse("Mac:\n  a: 1\nMac:\n  b: 2\n").unwrap();
        let values = doc.get_all("Mac");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].get("a").and_then(Node::as_str), Some("1"));
        assert_eq!(values[1].get("b").and_then(Node::as_str), Some("2"));
    }

    #[test]
    fn scalar_and_sequence_round_trip() {
        let doc = parse("name: leaf\ndepends: [B, C]\n").unwrap();
        assert_eq!(doc.get("name").and_then(Node::as_str), Some("leaf"));
        let depends = doc.get("depends").and_then(Node::as_seq).unwrap();
        assert_eq!(depends.len(), 2);
        assert_eq!(depends[0].as_str(), Some("B"));
        assert_eq!(depends[1].as_str(), Some("C"));
    }
}
