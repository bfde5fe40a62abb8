//! Low-rank adapters attached to frozen host transforms.
//!
//! A layer owns a bank of one or more rank-`r` slots. How many slots exist
//! and which of them train is fixed at construction from an
//! [`AdaptationConfig`]; which of them contribute to a given forward pass is
//! decided per call from a [`TaskState`]. Single-slot layers can fold their
//! correction into the base weight on `eval` and take it back out on `train`.

mod bank;
mod blend;
mod config;
mod context;
mod error;
mod layer;
mod lock;
mod merge;
mod selection;
mod transform;

pub use bank::{AdapterBank, AdapterSlot, FactorDims};
pub use blend::BlendWeights;
pub use config::{AdaptationConfig, FactorInit, LoraLayerConfig, TrainingType};
pub use context::{FuseTarget, LoraContext, TaskState};
pub use error::{LoraError, Result};
pub use layer::LoraLayer;
pub use lock::{apply_lock_policy, trainable_mask};
pub use merge::{MergeState, MergeStateMachine};
pub use selection::{SelectedSlot, SelectionPolicy, SlotWeight};
pub use transform::{
    BaseTransform, Conv2dTransform, DenseTransform, EmbeddingTransform, GroupedDenseTransform,
};

/// Dense projection with adapters.
pub type LoraLinear = LoraLayer<DenseTransform>;
/// Embedding lookup with adapters.
pub type LoraEmbedding = LoraLayer<EmbeddingTransform>;
/// Grouped dense projection with per-group adapters.
pub type LoraMergedLinear = LoraLayer<GroupedDenseTransform>;
/// 2-D convolution with adapters.
pub type LoraConv2d = LoraLayer<Conv2dTransform>;
