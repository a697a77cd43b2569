//! NaN guard: detect → retry once → degrade to zero
//!
//! Some accelerator backends produce transient, input-dependent non-finite
//! values. Policy, in order: run once; on any non-finite value, warn and rerun
//! the identical call exactly once; if non-finite values persist, warn with
//! the offending batch indices, zero-fill, and return the result as a
//! success. Embedding requests never fail for numerical instability, and
//! every response stays fully finite on the wire.

use tracing::warn;

use super::{BackendResult, EmbeddingBatch};

/// Wraps embedding calls with the retry-then-degrade policy.
pub struct NanGuard;

impl NanGuard {
    /// Run `infer` under the guard. `label` names the batch in log output,
    /// `batch_size` the number of inputs. Never fails due to instability:
    /// the only error path is the underlying call itself failing.
    pub fn run<F>(label: &str, batch_size: usize, mut infer: F) -> BackendResult<EmbeddingBatch>
    where
        F: FnMut() -> BackendResult<EmbeddingBatch>,
    {
        let batch = infer()?;
        if !batch.has_non_finite() {
            return Ok(batch);
        }

        warn!(
            "NaN detected in {} embeddings for {} input(s). Retrying...",
            label, batch_size
        );
        let mut batch = infer()?;
        if !batch.has_non_finite() {
            return Ok(batch);
        }

        let indices = batch.non_finite_indices();
        warn!(
            "NaN persists after retry for {} batch indices {:?}. Replacing NaN with 0.0 (degraded).",
            label, indices
        );
        batch.zero_fill_non_finite();
        Ok(batch)
    }
}
