//! Candle backend
//!
//! Serves ColPali (PaliGemma 448px, 128-dim multi-vector) through candle,
//! loaded from local safetensors. This is the unified-memory accelerator
//! path: device precedence is Metal, then CUDA, then CPU; dtype is F32 on
//! Metal and CPU (no usable reduced precision there) and BF16 on CUDA.
//!
//! The fixed 448x448 input is this model family's degenerate resolution
//! window; the query augmentation suffix uses the model's pad token with the
//! same repeat count as the other backend.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{colpali, paligemma};
use image::imageops::FilterType;
use tokenizers::Tokenizer;
use tracing::info;

use super::preprocess::{self, QUERY_AUGMENTATION_COUNT};
use super::{
    BackendError, BackendResult, DeviceContext, EmbeddingBackend, EmbeddingBatch, NanGuard,
};

const IMAGE_SIZE: usize = 448;
/// (448 / patch 14)^2 patch positions per page image.
const NUM_IMAGE_TOKENS: usize = 1024;
const IMAGE_TOKEN: &str = "<image>";
const BOS_TOKEN: &str = "<bos>";
/// ColPali's augmentation suffix token (Gemma pad), repeated the same fixed
/// count as the Qwen-family backend.
const QUERY_AUGMENTATION_TOKEN: &str = "<pad>";
const IMAGE_PROMPT: &str = "Describe the image.\n";

pub struct CandleBackend {
    model: colpali::Model,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    context: DeviceContext,
}

impl CandleBackend {
    /// Load tokenizer + safetensors from the configured model directory.
    pub fn initialize(config: &crate::config::ModelConfig) -> BackendResult<Self> {
        let (device, dtype, device_name) = select_device();
        info!(
            "Loading {} on {} with {:?} from {}...",
            config.model_id,
            device_name,
            dtype,
            config.model_dir.display()
        );

        let tokenizer_path = config.model_dir.join("tokenizer.json");
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| BackendError::LoadFailed {
                error: format!(
                    "failed to load tokenizer from {}: {}",
                    tokenizer_path.display(),
                    e
                ),
            })?;

        let weight_files = safetensor_files(&config.model_dir)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&weight_files, dtype, &device).map_err(|e| {
                BackendError::LoadFailed {
                    error: format!("failed to map safetensors: {}", e),
                }
            })?
        };
        let model = colpali::Model::new(&paligemma::Config::paligemma_3b_448(), vb).map_err(
            |e| BackendError::LoadFailed {
                error: format!("failed to build ColPali model: {}", e),
            },
        )?;

        info!("Model loaded. Device={}, dtype={:?}", device_name, dtype);
        Ok(Self {
            model,
            tokenizer,
            device,
            dtype,
            context: DeviceContext {
                model_id: config.model_id.clone(),
                device: device_name,
                dtype: dtype_name(dtype).to_string(),
                backend: "candle".to_string(),
            },
        })
    }

    fn token_id(&self, token: &str) -> BackendResult<u32> {
        self.tokenizer
            .token_to_id(token)
            .ok_or_else(|| BackendError::Tokenize {
                error: format!("tokenizer has no {} token", token),
            })
    }

    /// 448x448 resize, [-1, 1] normalization, CHW tensor.
    fn image_tensor(&self, path: &str) -> BackendResult<Tensor> {
        let img = image::open(path)
            .map_err(|e| BackendError::Preprocess {
                path: path.to_string(),
                error: e.to_string(),
            })?
            .resize_exact(IMAGE_SIZE as u32, IMAGE_SIZE as u32, FilterType::Triangle)
            .to_rgb8();

        let mut chw = vec![0f32; 3 * IMAGE_SIZE * IMAGE_SIZE];
        for (x, y, pixel) in img.enumerate_pixels() {
            for c in 0..3 {
                chw[(c * IMAGE_SIZE + y as usize) * IMAGE_SIZE + x as usize] =
                    pixel.0[c] as f32 / 127.5 - 1.0;
            }
        }

        Tensor::from_vec(chw, (1, 3, IMAGE_SIZE, IMAGE_SIZE), &self.device)
            .and_then(|t| t.to_dtype(self.dtype))
            .map_err(|e| BackendError::Preprocess {
                path: path.to_string(),
                error: e.to_string(),
            })
    }

    /// Image prompt: one token per patch position, then BOS and the fixed
    /// textual prompt. The patch-token count must match what the vision
    /// tower emits or the forward pass shape-errors.
    fn image_input_ids(&self) -> BackendResult<Vec<u32>> {
        let image_id = self.token_id(IMAGE_TOKEN)?;
        let bos_id = self.token_id(BOS_TOKEN)?;
        let prompt = self
            .tokenizer
            .encode(IMAGE_PROMPT, false)
            .map_err(|e| BackendError::Tokenize {
                error: e.to_string(),
            })?;

        let mut ids = vec![image_id; NUM_IMAGE_TOKENS];
        ids.push(bos_id);
        ids.extend_from_slice(prompt.get_ids());
        Ok(ids)
    }

    fn extract_vectors(&self, embeddings: &Tensor) -> BackendResult<Vec<Vec<f32>>> {
        let mut vectors = embeddings
            .squeeze(0)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_device(&Device::Cpu))
            .and_then(|t| t.to_vec2::<f32>())
            .map_err(|e| BackendError::Inference {
                error: format!("failed to read embeddings off device: {}", e),
            })?;
        // The model normalizes its projections; re-normalizing is idempotent
        // and keeps the cross-backend contract explicit.
        preprocess::normalize_positions(&mut vectors, None);
        Ok(vectors)
    }

    fn embed_images_once(&mut self, paths: &[String]) -> BackendResult<EmbeddingBatch> {
        let input_ids = self.image_input_ids()?;
        let ids_tensor = Tensor::new(input_ids.as_slice(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| BackendError::Inference {
                error: e.to_string(),
            })?;

        let mut embeddings = Vec::with_capacity(paths.len());
        for path in paths {
            let pixel_values = self.image_tensor(path)?;
            let output = self
                .model
                .forward_images(&pixel_values, &ids_tensor)
                .map_err(|e| BackendError::Inference {
                    error: format!("ColPali image forward failed: {}", e),
                })?;
            embeddings.push(self.extract_vectors(&output)?);
        }
        Ok(EmbeddingBatch::new(embeddings))
    }

    fn embed_queries_once(&mut self, texts: &[String]) -> BackendResult<EmbeddingBatch> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            let mut augmented = text.clone();
            for _ in 0..QUERY_AUGMENTATION_COUNT {
                augmented.push_str(QUERY_AUGMENTATION_TOKEN);
            }
            let encoding = self
                .tokenizer
                .encode(augmented.as_str(), true)
                .map_err(|e| BackendError::Tokenize {
                    error: e.to_string(),
                })?;

            let ids_tensor = Tensor::new(encoding.get_ids(), &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(|e| BackendError::Inference {
                    error: e.to_string(),
                })?;
            let output =
                self.model
                    .forward_text(&ids_tensor)
                    .map_err(|e| BackendError::Inference {
                        error: format!("ColPali text forward failed: {}", e),
                    })?;
            embeddings.push(self.extract_vectors(&output)?);
        }
        Ok(EmbeddingBatch::new(embeddings))
    }
}

impl EmbeddingBackend for CandleBackend {
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

/// Metal first (unified memory), then CUDA, then CPU. Metal lacks usable
/// bf16 kernels for this model, so it runs full precision.
fn select_device() -> (Device, DType, String) {
    if let Ok(device) = Device::new_metal(0) {
        return (device, DType::F32, "metal".to_string());
    }
    if let Ok(device) = Device::new_cuda(0) {
        return (device, DType::BF16, "cuda".to_string());
    }
    (Device::Cpu, DType::F32, "cpu".to_string())
}

fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "float32",
        DType::BF16 => "bfloat16",
        DType::F16 => "float16",
        _ => "unknown",
    }
}

fn safetensor_files(dir: &std::path::Path) -> BackendResult<Vec<std::path::PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| BackendError::LoadFailed {
        error: format!("cannot read model dir {}: {}", dir.display(), e),
    })?;
    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "safetensors"))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(BackendError::LoadFailed {
            error: format!("no .safetensors files in {}", dir.display()),
        });
    }
    Ok(files)
}
