//! JSON-RPC Wire Protocol
//!
//! One JSON object per line on stdin, one JSON response per line on stdout.
//!
//! Requests:
//!   {"id": 1, "method": "embed_images", "params": {"paths": ["/pages/p0.png"]}}
//!   {"id": 2, "method": "embed_query", "params": {"text": "search query"}}
//!   {"id": 3, "method": "embed_queries", "params": {"texts": ["q1", "q2"]}}
//!   {"id": 4, "method": "extract_pages", "params": {"pdf_path": "a.pdf", "output_dir": "/tmp/pages"}}
//!   {"id": 5, "method": "extract_text", "params": {"pdf_path": "a.pdf"}}
//!   {"id": 6, "method": "health"}
//!   {"id": 7, "method": "shutdown"}
//!
//! Responses carry exactly one of `result` or `error`, with the request `id`
//! echoed verbatim (including null/absent). One readiness line is emitted at
//! startup before any response: {"ready": true, "model": ..., "device": ...}.

pub mod dispatch;
pub mod stdio;

pub use dispatch::Dispatcher;
pub use stdio::ProtocolLoop;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decoded request line
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    /// Caller-assigned opaque identifier, echoed back verbatim
    #[serde(default)]
    pub id: Value,
    /// Handler selector
    pub method: String,
    /// Method parameters; absent is treated as empty
    #[serde(default)]
    pub params: Value,
}

/// One response line: `result` on success, `error` on failure, never both
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Create a success response
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(sanitize_json(result)),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Value, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Readiness line, emitted once after model load, before any response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyLine {
    pub ready: bool,
    pub model: String,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

/// Replace non-finite float values with null.
///
/// NaN/Infinity are not valid JSON tokens. `serde_json::Number` cannot hold
/// them in the first place (`from_f64` returns `None`), so values built
/// through `serde_json` are already safe; this pass covers `Value` trees
/// assembled by handlers from raw floats, where a failed conversion leaves
/// `Value::Null` in place.
pub fn sanitize_json(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Value::Null,
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_json).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, sanitize_json(v))).collect())
        }
        other => other,
    }
}
