//! Learned per-slot blend weights.

use candle_core::{DType, Device, Tensor, Var};

use super::error::{LoraError, Result};

/// Triangular family of blend vectors: row `k` holds `k + 1` weights.
///
/// The row read at forward time is chosen by the active task index, clamped
/// to the last row. Element `i` of that row scales slot `i`.
#[derive(Debug, Clone)]
pub struct BlendWeights {
    rows: Vec<Var>,
}

impl BlendWeights {
    /// `num_rows` rows initialised to ones.
    pub fn new(num_rows: usize, dtype: DType, device: &Device) -> Result<Self> {
        let rows = (0..num_rows)
            .map(|k| Var::ones(k + 1, dtype, device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { rows })
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// One row per slot: the last row must be able to weight every slot.
    pub fn check_slot_count(&self, slots: usize) -> Result<()> {
        if self.rows.len() != slots {
            return Err(LoraError::BlendRowMismatch {
                rows: self.rows.len(),
                slots,
            });
        }
        Ok(())
    }

    /// Row used for `task_index`.
    pub fn row_for_task(&self, task_index: usize) -> usize {
        task_index.min(self.rows.len().saturating_sub(1))
    }

    pub fn row(&self, row: usize) -> Option<&Tensor> {
        self.rows.get(row).map(|v| v.as_tensor())
    }

    /// Weight for slot `col` in `row`, as a one-element tensor that
    /// broadcasts against a contribution.
    pub fn weight(&self, row: usize, col: usize) -> Result<Tensor> {
        let row = self.rows.get(row).ok_or_else(|| {
            candle_core::Error::Msg(format!(
                "blend row {row} out of range for {} rows",
                self.rows.len()
            ))
        })?;
        Ok(row.narrow(0, col, 1)?)
    }

    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.rows.iter()
    }

    pub fn num_params(&self) -> usize {
        self.rows.iter().map(|r| r.elem_count()).sum()
    }
}
