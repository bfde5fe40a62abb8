//! Dense host whose output channels are split into groups, only some of
//! which carry an adapter (e.g. a fused qkv projection adapting q and v).

use candle_core::{Module, Tensor};
use candle_nn::Linear;

use super::{check_same_shape, flatten_leading, restore_leading, BaseTransform};
use crate::lora::bank::{AdapterSlot, FactorDims};
use crate::lora::error::{LoraError, Result};

/// Frozen dense projection with a per-group adapter mask.
///
/// With `G` groups of which `E` are enabled, a slot's down-factor is
/// `[rank * E, in]` and its up-factor `[out / G * E, rank]`. The up
/// projection is a grouped 1-D convolution (one group per enabled output
/// group); its output is scattered back into the enabled channels and
/// disabled channels receive zero.
#[derive(Debug, Clone)]
pub struct GroupedDenseTransform {
    weight: Tensor,
    bias: Option<Tensor>,
    fan_in_fan_out: bool,
    in_features: usize,
    out_features: usize,
    enable_lora: Vec<bool>,
    enabled_groups: usize,
    group_size: usize,
    /// For each output channel, its column in the compact correction, or the
    /// trailing zero column for disabled channels.
    lora_ind: Tensor,
}

impl GroupedDenseTransform {
    pub fn new(
        weight: Tensor,
        bias: Option<Tensor>,
        enable_lora: Vec<bool>,
        fan_in_fan_out: bool,
    ) -> Result<Self> {
        let (rows, cols) = weight
            .dims2()
            .map_err(|_| LoraError::WeightShape(format!("dense weight {:?}", weight.dims())))?;
        let (in_features, out_features) = if fan_in_fan_out {
            (rows, cols)
        } else {
            (cols, rows)
        };
        if enable_lora.is_empty() {
            return Err(LoraError::EmptyMask);
        }
        let groups = enable_lora.len();
        if out_features % groups != 0 {
            return Err(LoraError::MaskDivisibility {
                out_features,
                groups,
            });
        }
        let group_size = out_features / groups;
        let enabled_groups = enable_lora.iter().filter(|&&e| e).count();
        let zero_column = (group_size * enabled_groups) as u32;

        let mut next = 0u32;
        let mut ind = Vec::with_capacity(out_features);
        for &enabled in &enable_lora {
            for _ in 0..group_size {
                if enabled {
                    ind.push(next);
                    next += 1;
                } else {
                    ind.push(zero_column);
                }
            }
        }
        let lora_ind = Tensor::from_vec(ind, out_features, weight.device())?;

        Ok(Self {
            weight,
            bias,
            fan_in_fan_out,
            in_features,
            out_features,
            enable_lora,
            enabled_groups,
            group_size,
            lora_ind,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn enable_lora(&self) -> &[bool] {
        &self.enable_lora
    }

    pub fn enabled_groups(&self) -> usize {
        self.enabled_groups
    }

    /// Output channels that receive a correction.
    pub fn enabled_channels(&self) -> impl Iterator<Item = usize> + '_ {
        self.enable_lora
            .iter()
            .enumerate()
            .filter(|(_, &e)| e)
            .flat_map(move |(g, _)| g * self.group_size..(g + 1) * self.group_size)
    }

    /// Scatter `[n, out/G * E]` into `[n, out]`.
    fn zero_pad(&self, xs: &Tensor) -> Result<Tensor> {
        let n = xs.dim(0)?;
        let zeros = Tensor::zeros((n, 1), xs.dtype(), xs.device())?;
        let padded = Tensor::cat(&[xs, &zeros], 1)?;
        Ok(padded.index_select(&self.lora_ind, 1)?)
    }

    /// Grouped up-projection, `[n, r*E]` to `[n, out/G * E]`.
    fn grouped_up(&self, after_a: &Tensor, slot: &AdapterSlot) -> Result<Tensor> {
        let kernel = slot.lora_b().unsqueeze(2)?.contiguous()?;
        let signal = after_a.t()?.unsqueeze(0)?.contiguous()?;
        let out = signal.conv1d(&kernel, 0, 1, 1, self.enabled_groups)?;
        Ok(out.squeeze(0)?.t()?.contiguous()?)
    }
}

impl BaseTransform for GroupedDenseTransform {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let weight = if self.fan_in_fan_out {
            self.weight.t()?.contiguous()?
        } else {
            self.weight.clone()
        };
        Ok(Linear::new(weight, self.bias.clone()).forward(xs)?)
    }

    fn weight(&self) -> &Tensor {
        &self.weight
    }

    fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        check_same_shape(&self.weight, &weight)?;
        self.weight = weight;
        Ok(())
    }

    fn factor_dims(&self, rank: usize) -> Option<FactorDims> {
        if self.enabled_groups == 0 {
            return None;
        }
        Some(FactorDims::new(
            (rank * self.enabled_groups, self.in_features),
            (self.group_size * self.enabled_groups, rank),
        ))
    }

    fn slot_contribution(&self, xs: &Tensor, slot: &AdapterSlot) -> Result<Tensor> {
        let (x_2d, lead) = flatten_leading(xs)?;
        let after_a = x_2d.matmul(&slot.lora_a().t()?)?;
        let after_b = self.grouped_up(&after_a, slot)?;
        let out = self.zero_pad(&after_b)?;
        restore_leading(&out, &lead)
    }

    fn slot_delta(&self, slot: &AdapterSlot) -> Result<Tensor> {
        // [1, r*E, in] * [out/G*E, r, 1] -> [out/G*E, in]
        let kernel = slot.lora_b().unsqueeze(2)?.contiguous()?;
        let delta = slot
            .lora_a()
            .unsqueeze(0)?
            .conv1d(&kernel, 0, 1, 1, self.enabled_groups)?
            .squeeze(0)?;
        // scatter rows: pad the transposed delta along its channel columns
        let full = self.zero_pad(&delta.t()?.contiguous()?)?;
        if self.fan_in_fan_out {
            Ok(full.contiguous()?)
        } else {
            Ok(full.t()?.contiguous()?)
        }
    }
}
