//! ONNX Runtime backend
//!
//! Runs a ColQwen2.5-style ONNX export through `ort`. The graph contract:
//! inputs `input_ids` and `attention_mask` (both `[batch, seq]` i64) for text,
//! plus `pixel_values` (`[num_patches, 1176]` f32) and `image_grid_thw`
//! (`[n_images, 3]` i64) for images; single output `embeddings` of shape
//! `[batch, seq, dim]`. The model itself is opaque to the server — only this
//! input/output contract is assumed.

use std::path::Path;

use ndarray::ArrayView;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::preprocess::{self, IMAGE_PAD_TOKEN, PATCH_DIM, VISUAL_PROMPT_PREFIX};
use super::{
    BackendError, BackendResult, DeviceContext, EmbeddingBackend, EmbeddingBatch, NanGuard,
};

pub struct OrtBackend {
    session: Session,
    tokenizer: Tokenizer,
    image_pad_id: u32,
    context: DeviceContext,
}

impl OrtBackend {
    /// Load the ONNX session and tokenizer from the configured model
    /// directory (`model.onnx` + `tokenizer.json`). Fails with a load error
    /// when either artifact is missing or the session cannot be created.
    pub fn initialize(config: &crate::config::ModelConfig) -> BackendResult<Self> {
        let model_path = config.model_dir.join("model.onnx");
        let tokenizer_path = config.model_dir.join("tokenizer.json");

        let device = if cfg!(feature = "cuda") { "cuda" } else { "cpu" };
        info!(
            "Loading {} on {} from {}...",
            config.model_id,
            device,
            config.model_dir.display()
        );

        let session = Self::build_session(&model_path, config.num_threads)?;

        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| BackendError::LoadFailed {
                error: format!(
                    "failed to load tokenizer from {}: {}",
                    tokenizer_path.display(),
                    e
                ),
            })?;

        let image_pad_id =
            tokenizer
                .token_to_id(IMAGE_PAD_TOKEN)
                .ok_or_else(|| BackendError::LoadFailed {
                    error: format!("tokenizer has no {} token", IMAGE_PAD_TOKEN),
                })?;

        info!("Model loaded. Device={}, dtype=float32", device);
        Ok(Self {
            session,
            tokenizer,
            image_pad_id,
            context: DeviceContext {
                model_id: config.model_id.clone(),
                device: device.to_string(),
                // Precision is fixed at graph export time
                dtype: "float32".to_string(),
                backend: "onnx".to_string(),
            },
        })
    }

    fn build_session(model_path: &Path, num_threads: usize) -> BackendResult<Session> {
        let mut builder = Session::builder()
            .and_then(|b| Ok(b.with_optimization_level(GraphOptimizationLevel::Level3)?))
            .and_then(|b| {
                // CUDA schedules its own work; extra intra-op threads only help CPU
                if cfg!(feature = "cuda") {
                    Ok(b.with_intra_threads(1)?)
                } else {
                    Ok(b.with_intra_threads(num_threads)?)
                }
            })
            .map_err(|e| BackendError::LoadFailed {
                error: format!("failed to configure ONNX session: {}", e),
            })?;

        #[cfg(feature = "cuda")]
        let builder = builder
            .with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default().build()
            ])
            .map_err(|e| BackendError::LoadFailed {
                error: format!("failed to register CUDA provider: {}", e),
            })?;

        builder
            .commit_from_file(model_path)
            .map_err(|e| BackendError::LoadFailed {
                error: format!("failed to load ONNX model: {}", e),
            })
    }

    fn embed_images_once(&mut self, paths: &[String]) -> BackendResult<EmbeddingBatch> {
        let mut embeddings = Vec::with_capacity(paths.len());

        for path in paths {
            let img = image::open(path).map_err(|e| BackendError::Preprocess {
                path: path.clone(),
                error: e.to_string(),
            })?;
            let processed =
                preprocess::process_image(&img).map_err(|error| BackendError::Preprocess {
                    path: path.clone(),
                    error,
                })?;

            let prompt = self
                .tokenizer
                .encode(VISUAL_PROMPT_PREFIX, false)
                .map_err(|e| BackendError::Tokenize {
                    error: e.to_string(),
                })?;
            let input_ids = preprocess::expand_image_pad(
                prompt.get_ids(),
                self.image_pad_id,
                processed.num_image_tokens(),
            );
            let seq_len = input_ids.len();
            debug!(
                "image {}: grid {:?}, {} tokens",
                path, processed.grid_thw, seq_len
            );

            let ids_i64: Vec<i64> = input_ids.iter().map(|&x| x as i64).collect();
            let mask: Vec<u32> = vec![1; seq_len];
            let mask_i64: Vec<i64> = vec![1; seq_len];
            let n_patches = processed.num_patches();

            let ids_tensor = Tensor::from_array(([1i64, seq_len as i64], ids_i64))
                .map_err(|e| tensor_error("input_ids", e))?;
            let mask_tensor = Tensor::from_array(([1i64, seq_len as i64], mask_i64))
                .map_err(|e| tensor_error("attention_mask", e))?;
            let pixels_tensor = Tensor::from_array((
                [n_patches as i64, PATCH_DIM as i64],
                processed.pixel_values,
            ))
            .map_err(|e| tensor_error("pixel_values", e))?;
            let grid_tensor = Tensor::from_array(([1i64, 3], processed.grid_thw.to_vec()))
                .map_err(|e| tensor_error("image_grid_thw", e))?;

            let outputs = self
                .session
                .run(ort::inputs![
                    "input_ids" => ids_tensor,
                    "attention_mask" => mask_tensor,
                    "pixel_values" => pixels_tensor,
                    "image_grid_thw" => grid_tensor,
                ])
                .map_err(|e| BackendError::Inference {
                    error: format!("ONNX inference failed: {}", e),
                })?;

            let (shape, data) = outputs["embeddings"]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::Inference {
                    error: format!("failed to extract output tensor: {}", e),
                })?;
            let dims: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
            embeddings.push(to_position_vectors(&dims, data, &mask)?);
        }

        Ok(EmbeddingBatch::new(embeddings))
    }

    fn embed_queries_once(&mut self, texts: &[String]) -> BackendResult<EmbeddingBatch> {
        let mut embeddings = Vec::with_capacity(texts.len());

        for text in texts {
            let augmented = preprocess::augment_query(text);
            let encoding = self
                .tokenizer
                .encode(augmented.as_str(), true)
                .map_err(|e| BackendError::Tokenize {
                    error: e.to_string(),
                })?;

            let mask = encoding.get_attention_mask().to_vec();
            let seq_len = encoding.get_ids().len();
            let ids_i64: Vec<i64> = encoding.get_ids().iter().map(|&x| x as i64).collect();
            let mask_i64: Vec<i64> = mask.iter().map(|&x| x as i64).collect();

            let ids_tensor = Tensor::from_array(([1i64, seq_len as i64], ids_i64))
                .map_err(|e| tensor_error("input_ids", e))?;
            let mask_tensor = Tensor::from_array(([1i64, seq_len as i64], mask_i64))
                .map_err(|e| tensor_error("attention_mask", e))?;

            let outputs = self
                .session
                .run(ort::inputs![
                    "input_ids" => ids_tensor,
                    "attention_mask" => mask_tensor,
                ])
                .map_err(|e| BackendError::Inference {
                    error: format!("ONNX inference failed: {}", e),
                })?;

            let (shape, data) = outputs["embeddings"]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::Inference {
                    error: format!("failed to extract output tensor: {}", e),
                })?;
            let dims: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
            embeddings.push(to_position_vectors(&dims, data, &mask)?);
        }

        Ok(EmbeddingBatch::new(embeddings))
    }
}

impl EmbeddingBackend for OrtBackend {
    fn context(&self) -> &DeviceContext {
        &self.context
    }

    fn embed_images(&mut self, paths: &[String]) -> BackendResult<EmbeddingBatch> {
        NanGuard::run("image", paths.len(), || self.embed_images_once(paths))
    }

    fn embed_queries(&mut self, texts: &[String]) -> BackendResult<EmbeddingBatch> {
        NanGuard::run("query", texts.len(), || self.embed_queries_once(texts))
    }
}

/// Turn a `[1, seq, dim]` output tensor into per-position vectors,
/// L2-normalized with masked-out positions zeroed.
fn to_position_vectors(
    dims: &[usize],
    data: &[f32],
    mask: &[u32],
) -> BackendResult<Vec<Vec<f32>>> {
    if dims.len() != 3 {
        return Err(BackendError::Inference {
            error: format!("expected 3D output tensor, got {}D", dims.len()),
        });
    }
    let output = ArrayView::from_shape(dims, data).map_err(|e| BackendError::Inference {
        error: format!("failed to view output tensor: {:?}", e),
    })?;

    let mut vectors: Vec<Vec<f32>> = output
        .index_axis(ndarray::Axis(0), 0)
        .outer_iter()
        .map(|row| row.iter().copied().collect())
        .collect();
    preprocess::normalize_positions(&mut vectors, Some(mask));
    Ok(vectors)
}

fn tensor_error(name: &str, e: ort::Error) -> BackendError {
    BackendError::Inference {
        error: format!("failed to create {} tensor: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_position_vectors_normalizes_and_masks() {
        // [1, 2, 2] tensor, second position masked out
        let data = vec![3.0, 4.0, 5.0, 12.0];
        let vectors = to_position_vectors(&[1, 2, 2], &data, &[1, 0]).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!((vectors[0][0] - 0.6).abs() < 1e-6);
        assert_eq!(vectors[1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_to_position_vectors_rejects_bad_rank() {
        assert!(to_position_vectors(&[2, 2], &[0.0; 4], &[1, 1]).is_err());
    }
}
