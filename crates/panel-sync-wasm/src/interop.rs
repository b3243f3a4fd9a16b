//! Small helpers shared by the JS bridges.

use serde::Serialize;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

/// Call a JS function and await the Promise it returns.
///
/// A callback that returns a plain value instead of a Promise is fine too;
/// `Promise.resolve` semantics apply.
pub(crate) async fn call_js_async(
    func: &js_sys::Function,
    args: &[JsValue],
) -> Result<JsValue, JsValue> {
    let js_args = js_sys::Array::new();
    for arg in args {
        js_args.push(arg);
    }

    let returned = func.apply(&JsValue::NULL, &js_args)?;
    JsFuture::from(js_sys::Promise::resolve(&returned)).await
}

/// Call a synchronous JS function.
pub(crate) fn call_js_sync(func: &js_sys::Function, args: &[JsValue]) -> Result<JsValue, JsValue> {
    let js_args = js_sys::Array::new();
    for arg in args {
        js_args.push(arg);
    }
    func.apply(&JsValue::NULL, &js_args)
}

/// Best-effort message from a thrown JS value.
pub(crate) fn js_error_message(err: &JsValue) -> String {
    err.as_string()
        .or_else(|| {
            js_sys::Reflect::get(err, &"message".into())
                .ok()
                .and_then(|v| v.as_string())
        })
        .unwrap_or_else(|| format!("{:?}", err))
}

/// Serialize with plain objects instead of `Map`s, which is what editor
/// and store callbacks expect.
pub(crate) fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, serde_wasm_bindgen::Error> {
    value.serialize(&serde_wasm_bindgen::Serializer::json_compatible())
}
