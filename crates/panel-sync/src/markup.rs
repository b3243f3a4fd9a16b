//! Markup parsing against the editor schema.
//!
//! Older documents were persisted as HTML strings rather than structured
//! trees. This module turns such markup into the same node tree the editor
//! produces, so both forms canonicalize (and hash) identically.
//!
//! The parser is deliberately tolerant: unclosed elements are closed at the
//! end of their parent, stray closing tags are ignored and unknown elements are
//! transparent. Only a tag or comment that never terminates is an error.

use crate::canonical::{Mark, Node};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkupError {
    #[error("Unterminated tag at byte {0}")]
    UnterminatedTag(usize),

    #[error("Unterminated comment at byte {0}")]
    UnterminatedComment(usize),
}

pub type Result<T> = std::result::Result<T, MarkupError>;

/// Elements that never have children.
const VOID_TAGS: &[&str] = &["br", "hr", "img", "input", "meta", "link", "wbr", "col", "source"];

/// Elements whose content is dropped entirely.
const SKIPPED_TAGS: &[&str] = &["head", "script", "style", "title", "template"];

/// Elements handled as blocks when they appear at block level.
const BLOCK_TAGS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "ul", "ol", "li", "pre", "hr", "img",
    "div", "section", "article", "main", "header", "footer", "body", "html", "figure",
];

/// Node and mark vocabulary of the editor.
///
/// Marks are listed in rank order; canonical documents keep the marks of a
/// text node sorted by this rank so nesting order in markup does not matter.
#[derive(Debug, Clone)]
pub struct Schema {
    mark_ranks: Vec<String>,
    node_defaults: HashMap<String, BTreeMap<String, Value>>,
}

impl Default for Schema {
    fn default() -> Self {
        let mut node_defaults = HashMap::new();
        node_defaults.insert(
            "ordered_list".to_string(),
            BTreeMap::from([("start".to_string(), Value::from(1))]),
        );

        Self {
            mark_ranks: [
                "link",
                "bold",
                "italic",
                "underline",
                "strike",
                "code",
                "highlight",
                "annotation",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
            node_defaults,
        }
    }
}

impl Schema {
    /// Rank of a mark type. Unknown marks sort after all known ones.
    pub fn mark_rank(&self, kind: &str) -> usize {
        self.mark_ranks
            .iter()
            .position(|m| m == kind)
            .unwrap_or(self.mark_ranks.len())
    }

    /// Attribute values a node type has when none are given.
    pub fn default_attrs(&self, kind: &str) -> Option<&BTreeMap<String, Value>> {
        self.node_defaults.get(kind)
    }

    /// Register (or replace) default attributes for a node type.
    pub fn with_default_attrs(mut self, kind: &str, attrs: BTreeMap<String, Value>) -> Self {
        self.node_defaults.insert(kind.to_string(), attrs);
        self
    }

    /// Parse markup into a `doc` node.
    ///
    /// The result is not yet normalized; see `canonical::canonicalize`.
    pub fn parse_markup(&self, markup: &str) -> Result<Node> {
        let tokens = tokenize(markup)?;
        let dom = build_tree(tokens);
        let content = Converter.blocks(&dom);
        Ok(Node::element("doc", BTreeMap::new(), content))
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, PartialEq)]
enum Token {
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close(String),
    Text(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }

        let next = bytes.get(i + 1).copied();
        let is_markup = matches!(next, Some(b'/') | Some(b'!'))
            || next.is_some_and(|c| c.is_ascii_alphabetic());
        if !is_markup {
            // A bare '<' in running text
            i += 1;
            continue;
        }

        if text_start < i {
            tokens.push(Token::Text(decode_entities(&input[text_start..i])));
        }

        if input[i..].starts_with("<!--") {
            let end = input[i + 4..]
                .find("-->")
                .ok_or(MarkupError::UnterminatedComment(i))?;
            i = i + 4 + end + 3;
        } else if next == Some(b'!') {
            // Doctype or similar declaration
            let end = input[i..].find('>').ok_or(MarkupError::UnterminatedTag(i))?;
            i += end + 1;
        } else if next == Some(b'/') {
            let end = input[i..].find('>').ok_or(MarkupError::UnterminatedTag(i))?;
            let name = input[i + 2..i + end].trim().to_ascii_lowercase();
            if !name.is_empty() {
                tokens.push(Token::Close(name));
            }
            i += end + 1;
        } else {
            let (token, consumed) = parse_open_tag(input, i)?;
            tokens.push(token);
            i += consumed;
        }
        text_start = i;
    }

    if text_start < bytes.len() {
        tokens.push(Token::Text(decode_entities(&input[text_start..])));
    }

    Ok(tokens)
}

/// Parse `<name attr="value" ...>` starting at `start`. Returns the token and
/// the number of bytes consumed.
fn parse_open_tag(input: &str, start: usize) -> Result<(Token, usize)> {
    let bytes = input.as_bytes();
    let mut i = start + 1;

    let name_start = i;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-') {
        i += 1;
    }
    let name = input[name_start..i].to_ascii_lowercase();

    let mut attrs = Vec::new();
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        match bytes.get(i) {
            None => return Err(MarkupError::UnterminatedTag(start)),
            Some(b'>') => {
                let token = Token::Open {
                    name,
                    attrs,
                    self_closing: false,
                };
                return Ok((token, i + 1 - start));
            }
            Some(b'/') if bytes.get(i + 1) == Some(&b'>') => {
                let token = Token::Open {
                    name,
                    attrs,
                    self_closing: true,
                };
                return Ok((token, i + 2 - start));
            }
            Some(b'/') => {
                i += 1;
                continue;
            }
            Some(_) => {}
        }

        let attr_start = i;
        while i < bytes.len()
            && !bytes[i].is_ascii_whitespace()
            && !matches!(bytes[i], b'=' | b'>' | b'/')
        {
            i += 1;
        }
        let attr_name = input[attr_start..i].to_ascii_lowercase();

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let mut value = String::new();
        if bytes.get(i) == Some(&b'=') {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            match bytes.get(i) {
                Some(&quote) if quote == b'"' || quote == b'\'' => {
                    let close = input[i + 1..]
                        .find(quote as char)
                        .ok_or(MarkupError::UnterminatedTag(start))?;
                    value = decode_entities(&input[i + 1..i + 1 + close]);
                    i = i + 1 + close + 1;
                }
                Some(_) => {
                    let value_start = i;
                    while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                        i += 1;
                    }
                    value = decode_entities(&input[value_start..i]);
                }
                None => return Err(MarkupError::UnterminatedTag(start)),
            }
        }

        if !attr_name.is_empty() {
            attrs.push((attr_name, value));
        }
    }
}

/// Decode the named entities the editor emits plus numeric references.
/// Unknown entities are kept verbatim.
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let decoded = rest.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &rest[1..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi))
        });

        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

// ============================================================================
// Tree building
// ============================================================================

#[derive(Debug, Clone)]
enum Dom {
    Element {
        name: String,
        attrs: Vec<(String, String)>,
        children: Vec<Dom>,
    },
    Text(String),
}

impl Dom {
    fn attr(&self, key: &str) -> Option<&str> {
        match self {
            Dom::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            Dom::Text(_) => None,
        }
    }
}

struct Frame {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Dom>,
}

fn build_tree(tokens: Vec<Token>) -> Vec<Dom> {
    let mut root: Vec<Dom> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();

    fn close_top(stack: &mut Vec<Frame>, root: &mut Vec<Dom>) {
        if let Some(frame) = stack.pop() {
            let element = Dom::Element {
                name: frame.name,
                attrs: frame.attrs,
                children: frame.children,
            };
            match stack.last_mut() {
                Some(parent) => parent.children.push(element),
                None => root.push(element),
            }
        }
    }

    for token in tokens {
        match token {
            Token::Text(text) => match stack.last_mut() {
                Some(frame) => frame.children.push(Dom::Text(text)),
                None => root.push(Dom::Text(text)),
            },
            Token::Open {
                name,
                attrs,
                self_closing,
            } => {
                // Implicit end of an open paragraph or list item
                let top = stack.last().map(|f| f.name.as_str());
                let closes_paragraph = top == Some("p") && BLOCK_TAGS.contains(&name.as_str());
                let closes_item = top == Some("li") && name == "li";
                if closes_paragraph || closes_item {
                    close_top(&mut stack, &mut root);
                }

                if self_closing || VOID_TAGS.contains(&name.as_str()) {
                    let element = Dom::Element {
                        name,
                        attrs,
                        children: Vec::new(),
                    };
                    match stack.last_mut() {
                        Some(frame) => frame.children.push(element),
                        None => root.push(element),
                    }
                } else {
                    stack.push(Frame {
                        name,
                        attrs,
                        children: Vec::new(),
                    });
                }
            }
            Token::Close(name) => {
                if stack.iter().any(|f| f.name == name) {
                    while let Some(top) = stack.last() {
                        let done = top.name == name;
                        close_top(&mut stack, &mut root);
                        if done {
                            break;
                        }
                    }
                }
            }
        }
    }

    while !stack.is_empty() {
        close_top(&mut stack, &mut root);
    }

    root
}

// ============================================================================
// Conversion to editor nodes
// ============================================================================

struct Converter;

impl Converter {
    /// Convert children in block context. Loose inline content is wrapped in
    /// paragraphs.
    fn blocks(&self, children: &[Dom]) -> Vec<Node> {
        let mut out = Vec::new();
        let mut run: Vec<Node> = Vec::new();

        for child in children {
            let is_block = matches!(child, Dom::Element { name, .. } if BLOCK_TAGS.contains(&name.as_str()));
            if is_block {
                self.flush_run(&mut run, &mut out);
                out.extend(self.block(child));
            } else {
                self.inline(child, &[], &mut run);
            }
        }
        self.flush_run(&mut run, &mut out);

        out
    }

    fn flush_run(&self, run: &mut Vec<Node>, out: &mut Vec<Node>) {
        let content = finish_inline(std::mem::take(run));
        if !content.is_empty() {
            out.push(Node::element("paragraph", BTreeMap::new(), content));
        }
    }

    fn block(&self, dom: &Dom) -> Vec<Node> {
        let Dom::Element { name, children, .. } = dom else {
            return Vec::new();
        };

        match name.as_str() {
            "p" => vec![self.textblock("paragraph", BTreeMap::new(), children)],
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level: u64 = name[1..].parse().unwrap_or(1);
                let attrs = BTreeMap::from([("level".to_string(), Value::from(level))]);
                vec![self.textblock("heading", attrs, children)]
            }
            "blockquote" => vec![Node::element(
                "blockquote",
                BTreeMap::new(),
                self.blocks(children),
            )],
            "ul" => vec![Node::element("bullet_list", BTreeMap::new(), self.items(children))],
            "ol" => {
                let mut attrs = BTreeMap::new();
                if let Some(start) = dom.attr("start").and_then(|s| s.trim().parse::<u64>().ok()) {
                    attrs.insert("start".to_string(), Value::from(start));
                }
                vec![Node::element("ordered_list", attrs, self.items(children))]
            }
            "li" => vec![Node::element("list_item", BTreeMap::new(), self.blocks(children))],
            "pre" => {
                let mut text = String::new();
                collect_text(children, &mut text);
                let content = if text.is_empty() {
                    Vec::new()
                } else {
                    vec![Node::text(text, Vec::new())]
                };
                vec![Node::element("code_block", BTreeMap::new(), content)]
            }
            "hr" => vec![Node::element("horizontal_rule", BTreeMap::new(), Vec::new())],
            "img" => vec![image(dom)],
            _ => self.blocks(children),
        }
    }

    /// List children: `li` elements become items, anything else is wrapped.
    fn items(&self, children: &[Dom]) -> Vec<Node> {
        let mut items = Vec::new();
        let mut loose = Vec::new();

        for child in children {
            match child {
                Dom::Element { name, children, .. } if name == "li" => {
                    if !loose.is_empty() {
                        let blocks = self.blocks(&std::mem::take(&mut loose));
                        if !blocks.is_empty() {
                            items.push(Node::element("list_item", BTreeMap::new(), blocks));
                        }
                    }
                    items.push(Node::element("list_item", BTreeMap::new(), self.blocks(children)));
                }
                other => loose.push(other.clone()),
            }
        }

        let blocks = self.blocks(&loose);
        if !blocks.is_empty() {
            items.push(Node::element("list_item", BTreeMap::new(), blocks));
        }

        items
    }

    fn textblock(&self, kind: &str, attrs: BTreeMap<String, Value>, children: &[Dom]) -> Node {
        let mut run = Vec::new();
        for child in children {
            self.inline(child, &[], &mut run);
        }
        Node::element(kind, attrs, finish_inline(run))
    }

    fn inline(&self, dom: &Dom, marks: &[Mark], out: &mut Vec<Node>) {
        match dom {
            Dom::Text(text) => {
                let collapsed = collapse_whitespace(text);
                if !collapsed.is_empty() {
                    out.push(Node::text(collapsed, marks.to_vec()));
                }
            }
            Dom::Element { name, children, .. } => {
                if SKIPPED_TAGS.contains(&name.as_str()) {
                    return;
                }
                match name.as_str() {
                    "br" => out.push(Node::element("hard_break", BTreeMap::new(), Vec::new())),
                    "img" => out.push(image(dom)),
                    _ => match mark_for(dom) {
                        Some(mark) => {
                            let mut inner = marks.to_vec();
                            inner.push(mark);
                            for child in children {
                                self.inline(child, &inner, out);
                            }
                        }
                        None => {
                            for child in children {
                                self.inline(child, marks, out);
                            }
                        }
                    },
                }
            }
        }
    }
}

fn image(dom: &Dom) -> Node {
    let mut attrs = BTreeMap::new();
    for key in ["src", "alt", "title"] {
        if let Some(value) = dom.attr(key) {
            attrs.insert(key.to_string(), Value::from(value));
        }
    }
    Node::element("image", attrs, Vec::new())
}

fn mark_for(dom: &Dom) -> Option<Mark> {
    let Dom::Element { name, .. } = dom else {
        return None;
    };

    let simple = |kind: &str| Some(Mark::new(kind, BTreeMap::new()));
    match name.as_str() {
        "strong" | "b" => simple("bold"),
        "em" | "i" => simple("italic"),
        "u" => simple("underline"),
        "s" | "strike" | "del" => simple("strike"),
        "code" => simple("code"),
        "mark" => simple("highlight"),
        "a" => dom.attr("href").map(|href| {
            Mark::new(
                "link",
                BTreeMap::from([("href".to_string(), Value::from(href))]),
            )
        }),
        "span" => dom.attr("data-annotation-type").map(|kind| {
            let mut attrs = BTreeMap::from([("annotationType".to_string(), Value::from(kind))]);
            if let Some(id) = dom.attr("data-annotation-id") {
                attrs.insert("annotationId".to_string(), Value::from(id));
            }
            Mark::new("annotation", attrs)
        }),
        _ => None,
    }
}

fn collect_text(children: &[Dom], out: &mut String) {
    for child in children {
        match child {
            Dom::Text(text) => out.push_str(text),
            Dom::Element { name, children, .. } if name == "br" && children.is_empty() => {
                out.push('\n')
            }
            Dom::Element { children, .. } => collect_text(children, out),
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_ascii_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Trim whitespace at textblock edges and where two text nodes meet with a
/// space on both sides. Returns nothing for whitespace-only content.
fn finish_inline(mut nodes: Vec<Node>) -> Vec<Node> {
    for idx in 1..nodes.len() {
        let prev_ends_space = nodes[idx - 1]
            .text
            .as_deref()
            .is_some_and(|t| t.ends_with(' '));
        if prev_ends_space {
            if let Some(text) = nodes[idx].text.as_mut() {
                if text.starts_with(' ') {
                    text.remove(0);
                }
            }
        }
    }

    if let Some(text) = nodes.first_mut().and_then(|n| n.text.as_mut()) {
        *text = text.trim_start_matches(' ').to_string();
    }
    if let Some(text) = nodes.last_mut().and_then(|n| n.text.as_mut()) {
        *text = text.trim_end_matches(' ').to_string();
    }

    nodes.retain(|n| n.text.as_deref() != Some(""));
    nodes
}
