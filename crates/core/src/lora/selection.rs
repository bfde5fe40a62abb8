//! Forward-time slot selection.

use super::config::AdaptationConfig;
use super::context::{FuseTarget, TaskState};

/// Scalar multiplier for one selected slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWeight {
    /// Exactly 1.
    Unit,
    /// Entry `col` of blend row `row`.
    Blend { row: usize, col: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedSlot {
    pub index: usize,
    pub weight: SlotWeight,
}

impl SelectedSlot {
    fn unit(index: usize) -> Self {
        Self {
            index,
            weight: SlotWeight::Unit,
        }
    }
}

/// Decides which slots contribute to a forward pass and with what weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    num_adapters: usize,
    ema: bool,
    blend: bool,
}

impl SelectionPolicy {
    pub fn new(config: &AdaptationConfig) -> Self {
        Self {
            num_adapters: config.num_adapters(),
            ema: config.ema,
            blend: config.ada_weights_enabled(),
        }
    }

    pub fn num_adapters(&self) -> usize {
        self.num_adapters
    }

    /// Slot `ix` belongs to a task already reached.
    pub fn should_exec(&self, ix: usize, task_index: usize) -> bool {
        self.num_adapters == 1 || ix <= task_index
    }

    /// Blend row read for `task_index`.
    pub fn blend_row(&self, task_index: usize) -> usize {
        task_index.min(self.num_adapters.saturating_sub(1))
    }

    /// Slots contributing to this forward pass.
    ///
    /// EMA mode reads exactly one slot, the shadow when the fuse target is
    /// the EMA track and the live slot otherwise, with no gating or blending.
    pub fn select(&self, task: &dyn TaskState) -> Vec<SelectedSlot> {
        if self.ema {
            let index = match task.fuse_target() {
                FuseTarget::Ema => 1,
                FuseTarget::Live => 0,
            };
            return vec![SelectedSlot::unit(index)];
        }

        let task_index = task.active_task_index();
        let row = self.blend_row(task_index);
        (0..self.num_adapters)
            .filter(|&ix| self.should_exec(ix, task_index))
            .map(|index| SelectedSlot {
                index,
                weight: if self.blend {
                    SlotWeight::Blend { row, col: index }
                } else {
                    SlotWeight::Unit
                },
            })
            .collect()
    }
}
