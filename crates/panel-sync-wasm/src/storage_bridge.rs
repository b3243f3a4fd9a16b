//! `localStorage` bridge for WASM.
//!
//! The host passes three synchronous callbacks, usually thin wrappers around
//! `window.localStorage`. Storage must stay synchronous so the page-hide
//! backstop can write before the page goes away.

use panel_sync::storage::Result;
use panel_sync::{LocalStore, StorageError};
use wasm_bindgen::prelude::*;

use crate::interop::{call_js_sync, js_error_message};

/// # Example (TypeScript side)
///
/// ```typescript
/// const storage = new JsLocalStorage(
///   (key) => localStorage.getItem(key),
///   (key, value) => localStorage.setItem(key, value),
///   (key) => localStorage.removeItem(key),
/// );
/// ```
#[wasm_bindgen]
#[derive(Clone)]
pub struct JsLocalStorage {
    get_fn: js_sys::Function,
    set_fn: js_sys::Function,
    remove_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsLocalStorage {
    #[wasm_bindgen(constructor)]
    pub fn new(
        get_fn: js_sys::Function,
        set_fn: js_sys::Function,
        remove_fn: js_sys::Function,
    ) -> Self {
        Self {
            get_fn,
            set_fn,
            remove_fn,
        }
    }
}

/// Convert a thrown JS value to a `StorageError`.
fn js_err_to_storage_err(err: JsValue) -> StorageError {
    let name = js_sys::Reflect::get(&err, &"name".into())
        .ok()
        .and_then(|v| v.as_string())
        .unwrap_or_default();
    let msg = js_error_message(&err);

    if name == "QuotaExceededError" || msg.to_lowercase().contains("quota") {
        StorageError::QuotaExceeded(msg)
    } else {
        StorageError::Unavailable(msg)
    }
}

impl LocalStore for JsLocalStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let value = call_js_sync(&self.get_fn, &[key.into()]).map_err(js_err_to_storage_err)?;
        Ok(value.as_string())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        call_js_sync(&self.set_fn, &[key.into(), value.into()]).map_err(js_err_to_storage_err)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        call_js_sync(&self.remove_fn, &[key.into()]).map_err(js_err_to_storage_err)?;
        Ok(())
    }
}
