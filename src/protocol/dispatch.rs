//! Request dispatch
//!
//! Stateless mapping from method name to handler, independent of transport.
//! Every handler failure — missing parameter, unreadable file, inference
//! error — is caught here and converted into an error response; nothing
//! below this boundary terminates the process.

use serde_json::{json, Value};
use tracing::error;

use crate::backend::{DeviceContext, EmbeddingBackend};
use crate::error::{ServerError, ServerResult};
use crate::extract::DocumentExtractor;
use crate::metrics;

use super::{Request, Response};

pub struct Dispatcher {
    backend: Box<dyn EmbeddingBackend>,
    extractor: DocumentExtractor,
}

impl Dispatcher {
    pub fn new(backend: Box<dyn EmbeddingBackend>, extractor: DocumentExtractor) -> Self {
        Self { backend, extractor }
    }

    /// Device/dtype/model state for the readiness line.
    pub fn context(&self) -> &DeviceContext {
        self.backend.context()
    }

    /// Route one decoded request. Always produces a response; the request id
    /// is echoed verbatim on both success and failure.
    pub fn dispatch(&mut self, request: Request) -> Response {
        match self.handle(&request.method, &request.params) {
            Ok(result) => Response::result(request.id, result),
            Err(e) => {
                error!("Error handling {}: {}", request.method, e);
                Response::error(request.id, e.to_string())
            }
        }
    }

    fn handle(&mut self, method: &str, params: &Value) -> ServerResult<Value> {
        // Only recognized methods become metric label values; anything else
        // would let callers mint unbounded `method` labels.
        if !is_known_method(method) {
            return Err(ServerError::UnknownMethod {
                method: method.to_string(),
            });
        }
        metrics::record_request(method);
        let _timer = metrics::RequestTimer::start(method);

        match method {
            "health" => {
                let ctx = self.backend.context();
                Ok(json!({
                    "status": "ok",
                    "model": ctx.model_id,
                    "device": ctx.device,
                    "dtype": ctx.dtype,
                    "backend": ctx.backend,
                }))
            }
            "embed_images" => {
                let paths = string_list_param(params, "paths")?;
                if paths.is_empty() {
                    return Err(ServerError::Protocol {
                        message: "parameter 'paths' must be a non-empty list".to_string(),
                    });
                }
                metrics::record_pages(paths.len());
                let batch = self.backend.embed_images(&paths)?;
                Ok(json!({
                    "embeddings": batch.embeddings,
                    "num_vectors": batch.num_vectors,
                }))
            }
            "embed_query" => {
                let text = string_param(params, "text")?;
                let batch = self.backend.embed_queries(std::slice::from_ref(&text))?;
                let embedding = batch.embeddings.into_iter().next().ok_or_else(|| {
                    crate::backend::BackendError::Inference {
                        error: "backend returned no embedding".to_string(),
                    }
                })?;
                Ok(json!({ "embedding": embedding }))
            }
            "embed_queries" => {
                let texts = string_list_param(params, "texts")?;
                let batch = self.backend.embed_queries(&texts)?;
                Ok(json!({ "embeddings": batch.embeddings }))
            }
            "extract_pages" => {
                let pdf_path = string_param(params, "pdf_path")?;
                let output_dir = string_param(params, "output_dir")?;
                let pages = self.extractor.extract_pages(&pdf_path, &output_dir)?;
                Ok(serde_json::to_value(pages).unwrap_or(Value::Null))
            }
            "extract_text" => {
                let pdf_path = string_param(params, "pdf_path")?;
                let pages = self.extractor.extract_text(&pdf_path)?;
                Ok(json!({
                    "pages": pages,
                    "has_tesseract": self.extractor.has_tesseract(),
                }))
            }
            "shutdown" => Ok(json!({ "status": "shutting_down" })),
            other => Err(ServerError::UnknownMethod {
                method: other.to_string(),
            }),
        }
    }
}

const KNOWN_METHODS: [&str; 7] = [
    "health",
    "embed_images",
    "embed_query",
    "embed_queries",
    "extract_pages",
    "extract_text",
    "shutdown",
];

fn is_known_method(method: &str) -> bool {
    KNOWN_METHODS.contains(&method)
}

fn string_param(params: &Value, name: &str) -> ServerResult<String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ServerError::missing_param(name))
}

fn string_list_param(params: &Value, name: &str) -> ServerResult<Vec<String>> {
    let items = params
        .get(name)
        .and_then(Value::as_array)
        .ok_or_else(|| ServerError::missing_param(name))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| ServerError::Protocol {
                    message: format!("parameter '{}' must be a list of strings", name),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendResult, EmbeddingBatch};

    /// Deterministic backend: embeds each input as `count` vectors derived
    /// from the input's length, optionally corrupted with NaN.
    struct MockBackend {
        context: DeviceContext,
        inject_nan: bool,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                context: DeviceContext {
                    model_id: "mock-model".to_string(),
                    device: "cpu".to_string(),
                    dtype: "float32".to_string(),
                    backend: "mock".to_string(),
                },
                inject_nan: false,
            }
        }

        fn vectors_for(&self, seed: usize) -> Vec<Vec<f32>> {
            let count = 2 + seed % 3;
            (0..count)
                .map(|i| {
                    let v = if self.inject_nan && i == 0 {
                        f32::NAN
                    } else {
                        (seed as f32 + i as f32).cos()
                    };
                    vec![v, 1.0 - v]
                })
                .collect()
        }
    }

    impl EmbeddingBackend for MockBackend {
        fn context(&self) -> &DeviceContext {
            &self.context
        }

        fn embed_images(&mut self, paths: &[String]) -> BackendResult<EmbeddingBatch> {
            if paths.iter().any(|p| p == "unreadable.png") {
                return Err(BackendError::Preprocess {
                    path: "unreadable.png".to_string(),
                    error: "no such file".to_string(),
                });
            }
            Ok(EmbeddingBatch::new(
                paths.iter().map(|p| self.vectors_for(p.len())).collect(),
            ))
        }

        fn embed_queries(&mut self, texts: &[String]) -> BackendResult<EmbeddingBatch> {
            let batches: Vec<_> = texts.iter().map(|t| self.vectors_for(t.len())).collect();
            crate::backend::nan_guard::NanGuard::run("query", texts.len(), || {
                Ok(EmbeddingBatch::new(batches.clone()))
            })
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Box::new(MockBackend::new()), DocumentExtractor::new())
    }

    fn request(id: Value, method: &str, params: Value) -> Request {
        Request {
            id,
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn test_health_reports_immutable_context() {
        let mut d = dispatcher();
        let first = d.dispatch(request(json!(1), "health", Value::Null));
        let second = d.dispatch(request(json!(2), "health", Value::Null));
        let first = first.result.unwrap();
        let second = second.result.unwrap();
        assert_eq!(first["model"], second["model"]);
        assert_eq!(first["device"], second["device"]);
        assert_eq!(first["backend"], second["backend"]);
        assert_eq!(first["status"], "ok");
    }

    #[test]
    fn test_method_gate_agrees_with_routing() {
        // Every method that passes the metrics gate must reach a real
        // handler; names outside the gate never become label values.
        let mut d = dispatcher();
        for method in KNOWN_METHODS {
            let resp = d.dispatch(request(json!(1), method, Value::Null));
            if let Some(error) = resp.error {
                assert!(
                    !error.contains("Unknown method"),
                    "{} gated but not routed: {}",
                    method,
                    error
                );
            }
        }
        assert!(!is_known_method("frobnicate"));
    }

    #[test]
    fn test_unknown_method_is_an_error_response() {
        let mut d = dispatcher();
        let resp = d.dispatch(request(json!(9), "frobnicate", Value::Null));
        assert_eq!(resp.id, json!(9));
        assert!(resp.result.is_none());
        assert!(resp.error.unwrap().contains("Unknown method: frobnicate"));
    }

    #[test]
    fn test_embed_images_requires_non_empty_paths() {
        let mut d = dispatcher();
        let resp = d.dispatch(request(json!(1), "embed_images", json!({})));
        assert!(resp.error.unwrap().contains("paths"));

        let resp = d.dispatch(request(json!(2), "embed_images", json!({"paths": []})));
        assert!(resp.error.unwrap().contains("non-empty"));
    }

    #[test]
    fn test_embed_images_aligns_num_vectors() {
        let mut d = dispatcher();
        let resp = d.dispatch(request(
            json!(1),
            "embed_images",
            json!({"paths": ["a.png", "bb.png", "ccc.png"]}),
        ));
        let result = resp.result.unwrap();
        let embeddings = result["embeddings"].as_array().unwrap();
        let num_vectors = result["num_vectors"].as_array().unwrap();
        assert_eq!(embeddings.len(), 3);
        assert_eq!(num_vectors.len(), 3);
        for (e, n) in embeddings.iter().zip(num_vectors) {
            assert_eq!(e.as_array().unwrap().len() as u64, n.as_u64().unwrap());
        }
    }

    #[test]
    fn test_embed_query_equals_singleton_embed_queries() {
        let mut d = dispatcher();
        let single = d.dispatch(request(json!(1), "embed_query", json!({"text": "pasta"})));
        let batch = d.dispatch(request(
            json!(2),
            "embed_queries",
            json!({"texts": ["pasta"]}),
        ));
        assert_eq!(
            single.result.unwrap()["embedding"],
            batch.result.unwrap()["embeddings"][0]
        );
    }

    #[test]
    fn test_backend_failure_becomes_error_response() {
        let mut d = dispatcher();
        let resp = d.dispatch(request(
            json!(7),
            "embed_images",
            json!({"paths": ["unreadable.png"]}),
        ));
        assert_eq!(resp.id, json!(7));
        assert!(resp.error.unwrap().contains("unreadable.png"));
    }

    #[test]
    fn test_nan_injected_results_stay_finite_on_the_wire() {
        let mut d = Dispatcher::new(
            Box::new(MockBackend {
                inject_nan: true,
                ..MockBackend::new()
            }),
            DocumentExtractor::new(),
        );
        let resp = d.dispatch(request(json!(1), "embed_query", json!({"text": "x"})));
        let line = serde_json::to_string(&resp).unwrap();
        // guard zero-fills, so the wire carries real numbers, not nulls
        assert!(!line.contains("NaN"));
        assert!(!line.contains("null"));
        let resp_result = resp.result.unwrap();
        let vectors = resp_result["embedding"].as_array().unwrap();
        assert!(!vectors.is_empty());
    }

    #[test]
    fn test_shutdown_result_status() {
        let mut d = dispatcher();
        let resp = d.dispatch(request(json!(3), "shutdown", Value::Null));
        assert_eq!(resp.result.unwrap()["status"], "shutting_down");
    }

    #[test]
    fn test_missing_pdf_is_error_response() {
        let mut d = dispatcher();
        let resp = d.dispatch(request(
            json!(4),
            "extract_text",
            json!({"pdf_path": "missing.pdf"}),
        ));
        assert_eq!(resp.id, json!(4));
        assert!(resp.error.is_some());
    }
}
