//! Perception backend contract.

use async_trait::async_trait;

use vigil_models::{Frame, InferenceOutput, ModelId};

use crate::error::InferenceResult;

/// Runs one model over a batch of frames on one device.
///
/// Implementations must return exactly one output per input frame, in
/// input order.
#[async_trait]
pub trait PerceptionBackend: Send + Sync {
    async fn infer_batch(
        &self,
        model: &ModelId,
        device: &str,
        frames: &[Frame],
    ) -> InferenceResult<Vec<InferenceOutput>>;
}
