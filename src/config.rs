use crate::common::DimSize;
use nonzero::nonzero as nz;
use serde::{Deserialize, Serialize};

/// What a [LoweringSession](crate::lowering::LoweringSession) does after an op fails to lower.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum,
)]
pub enum FailurePolicy {
    /// Stop at the first failure.
    #[default]
    Abort,
    /// Keep lowering the remaining ops and report every failure.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoweringConfig {
    pub num_warps: DimSize,
    pub threads_per_warp: DimSize,
    pub failure_policy: FailurePolicy,
    /// Alignment, in bytes, of each shared-memory buffer.
    pub smem_alignment: u32,
}

impl LoweringConfig {
    pub fn threads_per_cta(&self) -> u32 {
        self.num_warps.get() * self.threads_per_warp.get()
    }
}

impl Default for LoweringConfig {
    fn default() -> Self {
        LoweringConfig {
            num_warps: nz!(4u32),
            threads_per_warp: nz!(32u32),
            failure_policy: FailurePolicy::Abort,
            smem_alignment: 128,
        }
    }
}
