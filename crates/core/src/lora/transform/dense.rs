//! Dense projection host.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::{check_same_shape, flatten_leading, restore_leading, BaseTransform};
use crate::lora::bank::{AdapterSlot, FactorDims};
use crate::lora::error::{LoraError, Result};

/// Frozen dense projection.
///
/// The correction for one slot is:
/// ```text
/// x @ lora_a.T @ lora_b.T
/// ```
/// with `lora_a: [rank, in_features]` and `lora_b: [out_features, rank]`.
/// With `fan_in_fan_out` the weight is stored `[in, out]` and transposed on
/// use.
#[derive(Debug, Clone)]
pub struct DenseTransform {
    weight: Tensor,
    bias: Option<Tensor>,
    fan_in_fan_out: bool,
    in_features: usize,
    out_features: usize,
}

impl DenseTransform {
    pub fn new(weight: Tensor, bias: Option<Tensor>, fan_in_fan_out: bool) -> Result<Self> {
        let (rows, cols) = weight
            .dims2()
            .map_err(|_| LoraError::WeightShape(format!("dense weight {:?}", weight.dims())))?;
        let (in_features, out_features) = if fan_in_fan_out {
            (rows, cols)
        } else {
            (cols, rows)
        };
        Ok(Self {
            weight,
            bias,
            fan_in_fan_out,
            in_features,
            out_features,
        })
    }

    /// Load `weight` (and `bias` when requested) from a VarBuilder.
    pub fn load(
        in_features: usize,
        out_features: usize,
        bias: bool,
        fan_in_fan_out: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let shape = if fan_in_fan_out {
            (in_features, out_features)
        } else {
            (out_features, in_features)
        };
        let weight = vb.get(shape, "weight")?;
        let bias = if bias {
            Some(vb.get(out_features, "bias")?)
        } else {
            None
        };
        Self::new(weight, bias, fan_in_fan_out)
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Weight as `[out, in]`.
    fn oriented_weight(&self) -> Result<Tensor> {
        if self.fan_in_fan_out {
            Ok(self.weight.t()?.contiguous()?)
        } else {
            Ok(self.weight.clone())
        }
    }
}

impl BaseTransform for DenseTransform {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let linear = Linear::new(self.oriented_weight()?, self.bias.clone());
        Ok(linear.forward(xs)?)
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
        Some(FactorDims::new(
            (rank, self.in_features),
            (self.out_features, rank),
        ))
    }

    fn slot_contribution(&self, xs: &Tensor, slot: &AdapterSlot) -> Result<Tensor> {
        let (x_2d, lead) = flatten_leading(xs)?;
        let intermediate = x_2d.matmul(&slot.lora_a().t()?)?;
        let out = intermediate.matmul(&slot.lora_b().t()?)?;
        restore_leading(&out, &lead)
    }

    fn slot_delta(&self, slot: &AdapterSlot) -> Result<Tensor> {
        let delta = slot.lora_b().matmul(slot.lora_a())?;
        if self.fan_in_fan_out {
            Ok(delta.t()?.contiguous()?)
        } else {
            Ok(delta)
        }
    }
}
