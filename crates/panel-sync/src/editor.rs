//! The rich-text editing surface, seen from the sync side.
//!
//! The host forwards the editor's change notifications to
//! `DocumentSession::on_content_changed`; the session reads and replaces
//! content through this trait.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::canonical::{CanonicalDoc, Node};
use crate::markup::Schema;

pub trait EditorSurface {
    /// Current document tree as the editor holds it.
    fn get_content(&self) -> Node;

    /// Replace the whole document. `add_to_history: false` keeps the
    /// replacement out of the undo stack.
    fn set_content(&mut self, doc: &CanonicalDoc, add_to_history: bool);

    /// Schema used to parse markup for this editor.
    fn schema(&self) -> &Schema;
}

/// In-memory editor for testing.
///
/// `with_trailing_paragraph` imitates a common plugin that appends an empty
/// paragraph whenever the document does not end with one, which changes the
/// rendered content right after every `set_content`.
pub struct MemoryEditor {
    content: Node,
    schema: Schema,
    trailing_paragraph: bool,
    set_calls: usize,
    history: Vec<Node>,
}

impl Default for MemoryEditor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEditor {
    pub fn new() -> Self {
        Self {
            content: CanonicalDoc::empty().into_node(),
            schema: Schema::default(),
            trailing_paragraph: false,
            set_calls: 0,
            history: Vec::new(),
        }
    }

    pub fn with_trailing_paragraph(mut self) -> Self {
        self.trailing_paragraph = true;
        self
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Append `text` to the last paragraph, as typing at the end would.
    pub fn type_text(&mut self, text: &str) {
        self.push_history();
        let needs_block = self
            .content
            .content
            .last()
            .is_none_or(|block| block.kind != "paragraph");
        if needs_block {
            self.content
                .content
                .push(Node::element("paragraph", BTreeMap::new(), Vec::new()));
        }
        if let Some(block) = self.content.content.last_mut() {
            match block.content.last_mut() {
                Some(last) if last.marks.is_empty() && last.text.is_some() => {
                    if let Some(existing) = last.text.as_mut() {
                        existing.push_str(text);
                    }
                }
                _ => block.content.push(Node::text(text, Vec::new())),
            }
        }
    }

    /// Structural change a plugin might make: tag the first block with an id.
    pub fn plugin_touch(&mut self, id: &str) {
        if let Some(block) = self.content.content.first_mut() {
            block
                .attrs
                .insert("id".to_string(), Value::String(id.to_string()));
        }
    }

    /// Plain text of the current content, blocks separated by newlines.
    pub fn text(&self) -> String {
        CanonicalDoc::from_node(self.content.clone(), &self.schema)
            .map(|doc| doc.plain_text())
            .unwrap_or_default()
    }

    /// Number of `set_content` calls so far.
    pub fn set_calls(&self) -> usize {
        self.set_calls
    }

    /// Number of undo steps recorded.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn push_history(&mut self) {
        self.history.push(self.content.clone());
    }
}

impl EditorSurface for MemoryEditor {
    fn get_content(&self) -> Node {
        self.content.clone()
    }

    fn set_content(&mut self, doc: &CanonicalDoc, add_to_history: bool) {
        if add_to_history {
            self.push_history();
        }
        self.set_calls += 1;
        self.content = doc.root().clone();

        if self.trailing_paragraph {
            let ends_with_empty_paragraph = self
                .content
                .content
                .last()
                .is_some_and(|block| block.kind == "paragraph" && block.content.is_empty());
            if !ends_with_empty_paragraph {
                self.content
                    .content
                    .push(Node::element("paragraph", BTreeMap::new(), Vec::new()));
            }
        }
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_text_appends_to_last_paragraph() {
        let mut editor = MemoryEditor::new();
        editor.type_text("Hel");
        editor.type_text("lo");
        assert_eq!(editor.text(), "Hello");
        assert_eq!(editor.history_len(), 2);
    }

    #[test]
    fn test_set_content_without_history() {
        let mut editor = MemoryEditor::new();
        editor.set_content(&CanonicalDoc::from_paragraphs(&["remote"]), false);
        assert_eq!(editor.text(), "remote");
        assert_eq!(editor.set_calls(), 1);
        assert_eq!(editor.history_len(), 0);
    }

    #[test]
    fn test_trailing_paragraph_rule_changes_rendered_content() {
        let mut editor = MemoryEditor::new().with_trailing_paragraph();
        let doc = CanonicalDoc::from_paragraphs(&["a"]);
        editor.set_content(&doc, false);

        let rendered = CanonicalDoc::from_node(editor.get_content(), editor.schema()).unwrap();
        assert_ne!(rendered.hash(), doc.hash());
        assert_eq!(rendered.root().content.len(), 2);

        // Applying the rendered form again is stable
        editor.set_content(&rendered, false);
        let again = CanonicalDoc::from_node(editor.get_content(), editor.schema()).unwrap();
        assert_eq!(again.hash(), rendered.hash());
    }

    #[test]
    fn test_plugin_touch_changes_hash_not_text() {
        let mut editor = MemoryEditor::new();
        editor.type_text("same");
        let before = CanonicalDoc::from_node(editor.get_content(), editor.schema()).unwrap();

        editor.plugin_touch("block-1");
        let after = CanonicalDoc::from_node(editor.get_content(), editor.schema()).unwrap();

        assert_eq!(before.plain_text(), after.plain_text());
        assert_ne!(before.hash(), after.hash());
    }
}
