//! Handlers manifests can bind with `{"builtin": "<name>"}`.

use parley_core::Priority;
use parley_plugins::{HandlerCatalog, HandlerError, handler_fn};
use serde_json::{Value, json};

/// `noop`, `echo` and `notify`.
pub fn catalog() -> HandlerCatalog {
    HandlerCatalog::new()
        .with("noop", handler_fn(|_, _| async { Ok(Value::Null) }))
        .with("echo", handler_fn(|input, _| async move { Ok(input) }))
        .with(
            "notify",
            handler_fn(|input, ctx| async move {
                let Some(message) = input["message"].as_str().map(str::to_string) else {
                    return Err(HandlerError::Failed("notify needs a 'message' string".into()));
                };
                let priority: Priority =
                    serde_json::from_value(input["priority"].clone()).unwrap_or_default();
                ctx.notify(message, priority).await;
                Ok(json!({"delivered": true}))
            }),
        )
}
