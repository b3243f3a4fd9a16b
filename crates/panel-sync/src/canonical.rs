//! Canonical document form and content hashing.
//!
//! A document arrives either as a structured node tree (what the editor
//! produces) or as a markup string (what older saves contain). Both are
//! normalized into one `CanonicalDoc` whose serialized form is stable, so the
//! hash of that form can answer "has this content actually changed".

use crate::markup::Schema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// A node in the editor document tree.
///
/// Attribute maps are `BTreeMap`s so serialization order never depends on
/// insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attrs: BTreeMap<String, Value>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub content: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub marks: Vec<Mark>,
}

/// An inline mark (bold, link, annotation, ...) on a text node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attrs: BTreeMap<String, Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Node {
    pub fn element(kind: &str, attrs: BTreeMap<String, Value>, content: Vec<Node>) -> Self {
        Self {
            kind: kind.to_string(),
            attrs,
            content,
            text: None,
            marks: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>, marks: Vec<Mark>) -> Self {
        Self {
            kind: "text".to_string(),
            attrs: BTreeMap::new(),
            content: Vec::new(),
            text: Some(text.into()),
            marks,
        }
    }

    fn is_text(&self) -> bool {
        self.kind == "text"
    }

    fn append_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in &self.content {
            child.append_text(out);
        }
    }
}

impl Mark {
    pub fn new(kind: &str, attrs: BTreeMap<String, Value>) -> Self {
        Self {
            kind: kind.to_string(),
            attrs,
        }
    }
}

/// Persisted document content as stored by the remote store.
///
/// Strings are markup; anything else is a structured tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawContent {
    Markup(String),
    Structured(Value),
}

impl From<&CanonicalDoc> for RawContent {
    fn from(doc: &CanonicalDoc) -> Self {
        RawContent::Structured(doc.to_value())
    }
}

/// A normalized `doc` tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalDoc(Node);

impl CanonicalDoc {
    /// An empty document: a single empty paragraph.
    pub fn empty() -> Self {
        Self(Node::element(
            "doc",
            BTreeMap::new(),
            vec![Node::element("paragraph", BTreeMap::new(), Vec::new())],
        ))
    }

    /// A document of plain paragraphs, mostly for tests and fixtures.
    pub fn from_paragraphs<S: AsRef<str>>(paragraphs: &[S]) -> Self {
        let blocks = paragraphs
            .iter()
            .map(|p| {
                let content = if p.as_ref().is_empty() {
                    Vec::new()
                } else {
                    vec![Node::text(p.as_ref(), Vec::new())]
                };
                Node::element("paragraph", BTreeMap::new(), content)
            })
            .collect();
        normalize_doc(Node::element("doc", BTreeMap::new(), blocks), &Schema::default())
    }

    /// Normalize a tree the editor handed us. Returns `None` if the root is
    /// not a `doc` node.
    pub fn from_node(node: Node, schema: &Schema) -> Option<Self> {
        if node.kind != "doc" {
            return None;
        }
        Some(normalize_doc(node, schema))
    }

    pub fn root(&self) -> &Node {
        &self.0
    }

    pub fn into_node(self) -> Node {
        self.0
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.0).unwrap_or(Value::Null)
    }

    /// Text content with blocks separated by newlines.
    pub fn plain_text(&self) -> String {
        self.0
            .content
            .iter()
            .map(|block| {
                let mut text = String::new();
                block.append_text(&mut text);
                text
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn hash(&self) -> ContentHash {
        ContentHash::of(self)
    }
}

/// Digest of a canonical document, used only for equality checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(doc: &CanonicalDoc) -> Self {
        // Serializing a Node cannot fail: keys are strings, values are JSON.
        let serialized = serde_json::to_string(doc.root()).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell hashes apart in logs
        f.write_str(self.0.get(..12).unwrap_or(&self.0))
    }
}

/// Normalize persisted content into canonical form.
///
/// Returns `None` for absent or empty input and for input that cannot be
/// parsed. Callers treat `None` as "cannot compare" and must not overwrite
/// anything on that basis.
pub fn canonicalize(raw: &RawContent, schema: &Schema) -> Option<CanonicalDoc> {
    match raw {
        RawContent::Markup(markup) => canonicalize_markup(markup, schema),
        RawContent::Structured(Value::Null) => None,
        RawContent::Structured(Value::String(markup)) => canonicalize_markup(markup, schema),
        RawContent::Structured(value) => match Node::deserialize(value) {
            Ok(node) if node.kind == "doc" => Some(normalize_doc(node, schema)),
            Ok(node) => {
                warn!(root = %node.kind, "Structured content is not a doc node");
                None
            }
            Err(e) => {
                warn!("Failed to read structured content: {}", e);
                None
            }
        },
    }
}

fn canonicalize_markup(markup: &str, schema: &Schema) -> Option<CanonicalDoc> {
    if markup.trim().is_empty() {
        return None;
    }
    match schema.parse_markup(markup) {
        Ok(node) => Some(normalize_doc(node, schema)),
        Err(e) => {
            warn!("Failed to parse markup content: {}", e);
            None
        }
    }
}

fn normalize_doc(node: Node, schema: &Schema) -> CanonicalDoc {
    let mut doc = normalize_node(node, schema).unwrap_or_else(|| CanonicalDoc::empty().0);
    if doc.content.is_empty() {
        doc.content
            .push(Node::element("paragraph", BTreeMap::new(), Vec::new()));
    }
    CanonicalDoc(doc)
}

fn normalize_node(mut node: Node, schema: &Schema) -> Option<Node> {
    node.attrs.retain(|_, v| !v.is_null());
    if let Some(defaults) = schema.default_attrs(&node.kind) {
        node.attrs
            .retain(|k, v| defaults.get(k).is_none_or(|default| *default != *v));
    }

    if node.is_text() {
        if node.text.as_deref().is_none_or(str::is_empty) {
            return None;
        }
        node.content.clear();
        node.marks = normalize_marks(std::mem::take(&mut node.marks), schema);
        return Some(node);
    }

    // Marks only belong on text nodes
    node.marks.clear();

    let mut content: Vec<Node> = Vec::with_capacity(node.content.len());
    for child in std::mem::take(&mut node.content) {
        let Some(child) = normalize_node(child, schema) else {
            continue;
        };
        let merge = content
            .last()
            .is_some_and(|prev| prev.is_text() && child.is_text() && prev.marks == child.marks);
        if merge {
            let prev_text = content.last_mut().and_then(|prev| prev.text.as_mut());
            if let (Some(prev_text), Some(text)) = (prev_text, child.text.as_deref()) {
                prev_text.push_str(text);
            }
        } else {
            content.push(child);
        }
    }
    node.content = content;

    Some(node)
}

fn normalize_marks(marks: Vec<Mark>, schema: &Schema) -> Vec<Mark> {
    let mut marks: Vec<Mark> = marks
        .into_iter()
        .map(|mut mark| {
            mark.attrs.retain(|_, v| !v.is_null());
            mark
        })
        .collect();
    marks.sort_by(|a, b| {
        schema
            .mark_rank(&a.kind)
            .cmp(&schema.mark_rank(&b.kind))
            .then_with(|| a.kind.cmp(&b.kind))
    });
    marks.dedup();
    marks
}
