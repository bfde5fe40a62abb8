//! Errors raised by adapted layers.

use thiserror::Error;

/// Errors from building or running an adapted layer.
///
/// Everything except [`LoraError::SlotCountMismatch`] and
/// [`LoraError::Candle`] is raised while a layer is being constructed and is
/// fatal to that construction.
#[derive(Debug, Error)]
pub enum LoraError {
    #[error("adapter rank must be positive when corrections are requested, got {0}")]
    InvalidRank(usize),
    #[error("lora_alpha must be finite, got {0}")]
    InvalidAlpha(f64),
    #[error("lora_dropout must lie in [0, 1), got {0}")]
    InvalidDropout(f32),
    #[error("multi-task and EMA modes need at least one task, got {0}")]
    InvalidTaskCount(usize),
    #[error("enable_lora mask is empty")]
    EmptyMask,
    #[error("mask of {groups} groups must divide out_features={out_features}")]
    MaskDivisibility { out_features: usize, groups: usize },
    #[error("blend weights have {rows} rows but the bank holds {slots} slots")]
    BlendRowMismatch { rows: usize, slots: usize },
    #[error("unsupported base weight: {0}")]
    WeightShape(String),
    #[error("adapter bank holds {found} slots but the configuration expects {expected}")]
    SlotCountMismatch { expected: usize, found: usize },
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl LoraError {
    /// True for errors that reject a layer configuration.
    pub fn is_configuration(&self) -> bool {
        !matches!(
            self,
            LoraError::SlotCountMismatch { .. } | LoraError::Candle(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LoraError>;
