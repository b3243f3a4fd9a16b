//! JavaScript editor bridge for WASM.
//!
//! Implements `EditorSurface` over two synchronous callbacks: one returning
//! the editor's document as JSON, one replacing it.

use panel_sync::{CanonicalDoc, EditorSurface, Node, Schema};
use tracing::warn;
use wasm_bindgen::prelude::*;

use crate::interop::{call_js_sync, js_error_message, to_js};

/// JavaScript editor bridge.
///
/// # Example (TypeScript side)
///
/// ```typescript
/// const editorBridge = new JsEditorBridge(
///   () => editor.getJSON(),
///   (doc, addToHistory) =>
///     editor.commands.setContent(doc, { emitUpdate: true, addToHistory }),
/// );
/// ```
#[wasm_bindgen]
#[derive(Clone)]
pub struct JsEditorBridge {
    get_content_fn: js_sys::Function,
    set_content_fn: js_sys::Function,
    schema: Schema,
}

#[wasm_bindgen]
impl JsEditorBridge {
    #[wasm_bindgen(constructor)]
    pub fn new(get_content_fn: js_sys::Function, set_content_fn: js_sys::Function) -> Self {
        Self {
            get_content_fn,
            set_content_fn,
            schema: Schema::default(),
        }
    }
}

impl EditorSurface for JsEditorBridge {
    fn get_content(&self) -> Node {
        let value = match call_js_sync(&self.get_content_fn, &[]) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %js_error_message(&e), "getContent threw, treating document as empty");
                return CanonicalDoc::empty().into_node();
            }
        };
        serde_wasm_bindgen::from_value::<Node>(value).unwrap_or_else(|e| {
            warn!(error = %e, "Editor returned an unreadable document, treating it as empty");
            CanonicalDoc::empty().into_node()
        })
    }

    fn set_content(&mut self, doc: &CanonicalDoc, add_to_history: bool) {
        let js_doc = match to_js(doc) {
            Ok(js_doc) => js_doc,
            Err(e) => {
                warn!(error = %e, "Failed to convert document for the editor");
                return;
            }
        };
        if let Err(e) = call_js_sync(&self.set_content_fn, &[js_doc, add_to_history.into()]) {
            warn!(error = %js_error_message(&e), "setContent threw");
        }
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}
