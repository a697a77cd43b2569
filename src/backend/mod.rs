//! Inference backend contract
//!
//! One backend is active per process, selected at startup by the `backend`
//! config key. Both implementations produce protocol-compatible results:
//! per-input multi-vector embeddings, every vector L2-normalized with the
//! model's fixed dimension, `num_vectors` aligned with the input list.

pub mod nan_guard;
pub mod preprocess;

#[cfg(feature = "candle")]
pub mod candle;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use nan_guard::NanGuard;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur in the inference backends
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Model loading failed: {error}")]
    LoadFailed { error: String },

    #[error("Unknown backend: {name} (expected \"onnx\" or \"candle\")")]
    UnknownBackend { name: String },

    #[error("Backend \"{name}\" is not compiled into this binary")]
    NotCompiled { name: String },

    #[error("Tokenization failed: {error}")]
    Tokenize { error: String },

    #[error("Image preprocessing failed for {path}: {error}")]
    Preprocess { path: String, error: String },

    #[error("Inference failed: {error}")]
    Inference { error: String },
}

/// Device/dtype context — immutable after model initialization.
///
/// Selected once at startup from available hardware, never re-evaluated per
/// request; `health` reports these fields unchanged for the process lifetime.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub model_id: String,
    pub device: String,
    pub dtype: String,
    pub backend: String,
}

/// Batch embedding result: one multi-vector embedding per input, in input
/// order, with a parallel per-input vector count.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBatch {
    pub embeddings: Vec<Vec<Vec<f32>>>,
    pub num_vectors: Vec<usize>,
}

impl EmbeddingBatch {
    /// Build a batch from raw embeddings, deriving `num_vectors`.
    pub fn new(embeddings: Vec<Vec<Vec<f32>>>) -> Self {
        let num_vectors = embeddings.iter().map(|e| e.len()).collect();
        Self {
            embeddings,
            num_vectors,
        }
    }

    /// Whether any value in the batch is NaN or infinite.
    pub fn has_non_finite(&self) -> bool {
        self.embeddings
            .iter()
            .flatten()
            .flatten()
            .any(|v| !v.is_finite())
    }

    /// Batch indices of inputs that still contain non-finite values.
    pub fn non_finite_indices(&self) -> Vec<usize> {
        self.embeddings
            .iter()
            .enumerate()
            .filter(|(_, vecs)| vecs.iter().flatten().any(|v| !v.is_finite()))
            .map(|(i, _)| i)
            .collect()
    }

    /// Replace every non-finite value with 0.0.
    pub fn zero_fill_non_finite(&mut self) {
        for vecs in &mut self.embeddings {
            for vec in vecs {
                for v in vec {
                    if !v.is_finite() {
                        *v = 0.0;
                    }
                }
            }
        }
    }
}

/// Capability contract shared by the inference runtimes.
///
/// Calls are blocking and strictly serialized by the protocol loop: the
/// backing device context cannot safely serve two inference calls at once.
pub trait EmbeddingBackend: Send {
    /// Device/dtype/model state fixed at initialization.
    fn context(&self) -> &DeviceContext;

    /// Embed a list of page image files. One multi-vector embedding per path,
    /// vector count varying with image resolution.
    fn embed_images(&mut self, paths: &[String]) -> BackendResult<EmbeddingBatch>;

    /// Embed query texts. Vector count per query equals its token count
    /// including the fixed augmentation suffix.
    fn embed_queries(&mut self, texts: &[String]) -> BackendResult<EmbeddingBatch>;
}

/// Load the backend named by the configuration. Fails fatally (startup) when
/// the name is unknown, the backend was compiled out, or weights are missing.
pub fn init_backend(
    config: &crate::config::ModelConfig,
) -> BackendResult<Box<dyn EmbeddingBackend>> {
    match config.backend.as_str() {
        "onnx" => {
            #[cfg(feature = "onnx")]
            {
                Ok(Box::new(onnx::OrtBackend::initialize(config)?))
            }
            #[cfg(not(feature = "onnx"))]
            {
                Err(BackendError::NotCompiled {
                    name: "onnx".to_string(),
                })
            }
        }
        "candle" => {
            #[cfg(feature = "candle")]
            {
                Ok(Box::new(candle::CandleBackend::initialize(config)?))
            }
            #[cfg(not(feature = "candle"))]
            {
                Err(BackendError::NotCompiled {
                    name: "candle".to_string(),
                })
            }
        }
        other => Err(BackendError::UnknownBackend {
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_derives_num_vectors() {
        let batch = EmbeddingBatch::new(vec![
            vec![vec![0.1, 0.2], vec![0.3, 0.4], vec![0.5, 0.6]],
            vec![vec![0.7, 0.8]],
        ]);
        assert_eq!(batch.num_vectors, vec![3, 1]);
    }

    #[test]
    fn test_non_finite_detection_and_indices() {
        let mut batch = EmbeddingBatch::new(vec![
            vec![vec![0.1, 0.2]],
            vec![vec![f32::NAN, 0.4]],
            vec![vec![0.5, f32::INFINITY]],
        ]);
        assert!(batch.has_non_finite());
        assert_eq!(batch.non_finite_indices(), vec![1, 2]);

        batch.zero_fill_non_finite();
        assert!(!batch.has_non_finite());
        assert_eq!(batch.embeddings[1][0], vec![0.0, 0.4]);
        assert_eq!(batch.embeddings[2][0], vec![0.5, 0.0]);
    }

    #[test]
    fn test_unknown_backend_name() {
        let config = crate::config::ModelConfig {
            backend: "tensorflow".to_string(),
            ..Default::default()
        };
        let err = match init_backend(&config) {
            Ok(_) => panic!("expected init_backend to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, BackendError::UnknownBackend { .. }));
    }
}
