//! Model input preprocessing shared by the inference backends
//!
//! Mirrors the ColQwen2.5 processor settings: images are constrained to the
//! [`MIN_PIXELS`], [`MAX_PIXELS`] window with dimensions rounded to multiples
//! of patch×merge, queries get a fixed augmentation suffix, and the visual
//! prompt carries one `<|image_pad|>` placeholder that is expanded to the
//! image token count computed from the grid dimensions.

use image::{imageops::FilterType, DynamicImage};

/// Fixed visual prompt wrapping the image placeholder.
pub const VISUAL_PROMPT_PREFIX: &str = "<|im_start|>user\n<|vision_start|><|image_pad|><|vision_end|>Describe the image.<|im_end|><|endoftext|>";

/// Placeholder substituted with one token per retained image patch position.
pub const IMAGE_PAD_TOKEN: &str = "<|image_pad|>";

/// Augmentation suffix token, repeated [`QUERY_AUGMENTATION_COUNT`] times
/// after every query text before tokenization. Allocates extra computation
/// to short queries per the model's training recipe.
pub const QUERY_AUGMENTATION_TOKEN: &str = "<|endoftext|>";
pub const QUERY_AUGMENTATION_COUNT: usize = 10;

/// Resolution window: total pixel count after resizing stays inside it.
pub const MIN_PIXELS: u32 = 3136;
pub const MAX_PIXELS: u32 = 602_112;

/// Qwen2.5-VL vision geometry.
pub const PATCH_SIZE: u32 = 14;
pub const MERGE_SIZE: u32 = 2;
pub const TEMPORAL_PATCH_SIZE: u32 = 2;
/// Flattened patch width: channels × temporal × patch × patch.
pub const PATCH_DIM: usize = (3 * TEMPORAL_PATCH_SIZE * PATCH_SIZE * PATCH_SIZE) as usize;

/// CLIP normalization statistics, per channel.
pub const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// A preprocessed image ready for the model: flattened patches plus the
/// temporal/height/width grid the patch count derives from.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    /// Row-major `(grid_t * grid_h * grid_w, PATCH_DIM)` values.
    pub pixel_values: Vec<f32>,
    /// `[grid_t, grid_h, grid_w]`
    pub grid_thw: [i64; 3],
}

impl ProcessedImage {
    /// Total flattened patch rows.
    pub fn num_patches(&self) -> usize {
        (self.grid_thw[0] * self.grid_thw[1] * self.grid_thw[2]) as usize
    }

    /// Model tokens this image occupies: grid divided by the spatial merge
    /// factor along height and width, times the temporal dimension. Must
    /// equal the number of placeholder tokens substituted into the prompt.
    pub fn num_image_tokens(&self) -> usize {
        let [t, h, w] = self.grid_thw;
        (t * (h / MERGE_SIZE as i64) * (w / MERGE_SIZE as i64)) as usize
    }
}

/// Append the fixed augmentation suffix to a query. No additional padding:
/// the query's vector count equals its token count including this suffix.
pub fn augment_query(text: &str) -> String {
    let mut augmented = String::with_capacity(
        text.len() + QUERY_AUGMENTATION_TOKEN.len() * QUERY_AUGMENTATION_COUNT,
    );
    augmented.push_str(text);
    for _ in 0..QUERY_AUGMENTATION_COUNT {
        augmented.push_str(QUERY_AUGMENTATION_TOKEN);
    }
    augmented
}

/// Replace the single image placeholder token with `count` copies.
pub fn expand_image_pad(prompt_ids: &[u32], image_pad_id: u32, count: usize) -> Vec<u32> {
    let mut expanded = Vec::with_capacity(prompt_ids.len() + count);
    for &tid in prompt_ids {
        if tid == image_pad_id {
            expanded.extend(std::iter::repeat(image_pad_id).take(count));
        } else {
            expanded.push(tid);
        }
    }
    expanded
}

/// Compute the target resolution: both dimensions rounded to multiples of
/// patch×merge, scaled so the total pixel count lands inside the window.
pub fn smart_resize(height: u32, width: u32) -> Result<(u32, u32), String> {
    let factor = (PATCH_SIZE * MERGE_SIZE) as f64;
    let (h, w) = (height as f64, width as f64);
    if height == 0 || width == 0 {
        return Err("image has a zero dimension".to_string());
    }
    if h.max(w) / h.min(w) > 200.0 {
        return Err(format!(
            "absolute aspect ratio must be smaller than 200, got {}x{}",
            width, height
        ));
    }

    let mut h_bar = ((h / factor).round() * factor).max(factor);
    let mut w_bar = ((w / factor).round() * factor).max(factor);

    if h_bar * w_bar > MAX_PIXELS as f64 {
        let beta = ((h * w) / MAX_PIXELS as f64).sqrt();
        h_bar = ((h / beta / factor).floor() * factor).max(factor);
        w_bar = ((w / beta / factor).floor() * factor).max(factor);
    } else if h_bar * w_bar < MIN_PIXELS as f64 {
        let beta = (MIN_PIXELS as f64 / (h * w)).sqrt();
        h_bar = (h * beta / factor).ceil() * factor;
        w_bar = (w * beta / factor).ceil() * factor;
    }

    Ok((h_bar as u32, w_bar as u32))
}

/// Resize, normalize, and flatten an image into Qwen2.5-VL patch layout.
///
/// Output rows follow the spatial-merge ordering the model expects: patches
/// grouped by merge block, the two temporal copies interleaved per channel
/// (a still image is duplicated along the temporal axis).
pub fn process_image(img: &DynamicImage) -> Result<ProcessedImage, String> {
    let (resized_h, resized_w) = smart_resize(img.height(), img.width())?;
    let resized = img
        .resize_exact(resized_w, resized_h, FilterType::CatmullRom)
        .to_rgb8();

    let (h, w) = (resized_h as usize, resized_w as usize);
    // CHW, CLIP-normalized
    let mut chw = vec![0f32; 3 * h * w];
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel.0[c] as f32 / 255.0;
            chw[(c * h + y as usize) * w + x as usize] = (v - IMAGE_MEAN[c]) / IMAGE_STD[c];
        }
    }

    let grid_h = h / PATCH_SIZE as usize;
    let grid_w = w / PATCH_SIZE as usize;
    let (merge, patch, temporal) = (
        MERGE_SIZE as usize,
        PATCH_SIZE as usize,
        TEMPORAL_PATCH_SIZE as usize,
    );
    let (gh_blocks, gw_blocks) = (grid_h / merge, grid_w / merge);

    let mut pixel_values = vec![0f32; grid_h * grid_w * PATCH_DIM];
    for hb in 0..gh_blocks {
        for wb in 0..gw_blocks {
            for mh in 0..merge {
                for mw in 0..merge {
                    let row = (((hb * gw_blocks) + wb) * merge + mh) * merge + mw;
                    for c in 0..3 {
                        for tp in 0..temporal {
                            for py in 0..patch {
                                for px in 0..patch {
                                    let y = (hb * merge + mh) * patch + py;
                                    let x = (wb * merge + mw) * patch + px;
                                    let col = ((c * temporal + tp) * patch + py) * patch + px;
                                    pixel_values[row * PATCH_DIM + col] =
                                        chw[(c * h + y) * w + x];
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(ProcessedImage {
        pixel_values,
        grid_thw: [1, grid_h as i64, grid_w as i64],
    })
}

/// L2-normalize each position vector in place; positions masked out by the
/// validity mask are zeroed rather than skipped, since the result's vector
/// count always equals the mask length.
pub fn normalize_positions(vectors: &mut [Vec<f32>], mask: Option<&[u32]>) {
    for (i, vec) in vectors.iter_mut().enumerate() {
        let active = mask.map_or(true, |m| m.get(i).copied().unwrap_or(0) == 1);
        if !active {
            for v in vec.iter_mut() {
                *v = 0.0;
            }
            continue;
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vec.iter_mut() {
                *v /= norm;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_augment_query_appends_fixed_suffix() {
        let augmented = augment_query("pasta");
        assert!(augmented.starts_with("pasta"));
        assert_eq!(
            augmented.matches(QUERY_AUGMENTATION_TOKEN).count(),
            QUERY_AUGMENTATION_COUNT
        );
    }

    #[test]
    fn test_expand_image_pad() {
        let ids = vec![5, 9, 7];
        let expanded = expand_image_pad(&ids, 9, 4);
        assert_eq!(expanded, vec![5, 9, 9, 9, 9, 7]);
    }

    #[test]
    fn test_smart_resize_rounds_to_factor() {
        let (h, w) = smart_resize(1000, 700).unwrap();
        assert_eq!(h % 28, 0);
        assert_eq!(w % 28, 0);
        assert!(h * w <= MAX_PIXELS);
        assert!(h * w >= MIN_PIXELS);
    }

    #[test]
    fn test_smart_resize_upscales_tiny_images() {
        let (h, w) = smart_resize(20, 20).unwrap();
        assert!(h * w >= MIN_PIXELS);
        assert_eq!(h % 28, 0);
    }

    #[test]
    fn test_smart_resize_downscales_large_images() {
        let (h, w) = smart_resize(4000, 4000).unwrap();
        assert!(h * w <= MAX_PIXELS);
    }

    #[test]
    fn test_smart_resize_rejects_extreme_aspect_ratio() {
        assert!(smart_resize(10000, 10).is_err());
        assert!(smart_resize(0, 100).is_err());
    }

    #[test]
    fn test_image_token_count_uses_merge_factor() {
        let processed = ProcessedImage {
            pixel_values: Vec::new(),
            grid_thw: [1, 16, 20],
        };
        assert_eq!(processed.num_patches(), 320);
        assert_eq!(processed.num_image_tokens(), 8 * 10);
    }

    #[test]
    fn test_process_image_shapes() {
        let img = DynamicImage::new_rgb8(100, 60);
        let processed = process_image(&img).unwrap();
        let [t, gh, gw] = processed.grid_thw;
        assert_eq!(t, 1);
        assert_eq!(gh % MERGE_SIZE as i64, 0);
        assert_eq!(gw % MERGE_SIZE as i64, 0);
        assert_eq!(
            processed.pixel_values.len(),
            processed.num_patches() * PATCH_DIM
        );
    }

    #[test]
    fn test_normalize_positions_unit_norm() {
        let mut vectors = vec![vec![3.0, 4.0], vec![0.0, 0.0]];
        normalize_positions(&mut vectors, None);
        assert!((vectors[0][0] - 0.6).abs() < 1e-6);
        assert!((vectors[0][1] - 0.8).abs() < 1e-6);
        // Zero vector stays zero instead of dividing by zero
        assert_eq!(vectors[1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_normalize_positions_zeroes_masked_out() {
        let mut vectors = vec![vec![3.0, 4.0], vec![5.0, 12.0]];
        normalize_positions(&mut vectors, Some(&[1, 0]));
        assert!((vectors[0][0] - 0.6).abs() < 1e-6);
        assert_eq!(vectors[1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut vectors = vec![vec![3.0, 4.0]];
        normalize_positions(&mut vectors, None);
        let once = vectors.clone();
        normalize_positions(&mut vectors, None);
        assert_eq!(vectors, once);
    }
}
