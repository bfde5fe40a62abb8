//! Per-forward task state.

use serde::{Deserialize, Serialize};

/// Which adapter track an EMA-mode layer reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuseTarget {
    /// The live, trained slot.
    #[default]
    Live,
    /// The EMA shadow slot.
    Ema,
}

/// Task information consulted on every forward pass.
pub trait TaskState {
    /// Index of the task currently being trained or evaluated.
    fn active_task_index(&self) -> usize;

    /// Track an EMA-mode layer should read.
    fn fuse_target(&self) -> FuseTarget;
}

/// Plain [`TaskState`] value passed through a model's forward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoraContext {
    pub task_id: usize,
    #[serde(default)]
    pub fuse_target: FuseTarget,
}

impl LoraContext {
    pub fn new(task_id: usize, fuse_target: FuseTarget) -> Self {
        Self {
            task_id,
            fuse_target,
        }
    }

    /// Context for a task, reading the live track.
    pub fn for_task(task_id: usize) -> Self {
        Self::new(task_id, FuseTarget::Live)
    }

    /// Context for a task, reading the EMA track.
    pub fn ema(task_id: usize) -> Self {
        Self::new(task_id, FuseTarget::Ema)
    }
}

impl TaskState for LoraContext {
    fn active_task_index(&self) -> usize {
        self.task_id
    }

    fn fuse_target(&self) -> FuseTarget {
        self.fuse_target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lora_context_default() {
        let ctx = LoraContext::default();
        assert_eq!(ctx.active_task_index(), 0);
        assert_eq!(ctx.fuse_target(), FuseTarget::Live);
    }

    #[test]
    fn test_lora_context_ema() {
        let ctx = LoraContext::ema(3);
        assert_eq!(ctx.active_task_index(), 3);
        assert_eq!(ctx.fuse_target(), FuseTarget::Ema);
    }

    #[test]
    fn test_lora_context_deserialize() {
        let ctx: LoraContext = serde_json::from_str(r#"{"task_id": 2, "fuse_target": "ema"}"#).unwrap();
        assert_eq!(ctx, LoraContext::ema(2));
        let ctx: LoraContext = serde_json::from_str(r#"{"task_id": 1}"#).unwrap();
        assert_eq!(ctx, LoraContext::for_task(1));
    }
}
