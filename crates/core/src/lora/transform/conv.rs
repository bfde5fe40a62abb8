//! Spatial convolution host.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use super::{check_same_shape, BaseTransform};
use crate::lora::bank::{AdapterSlot, FactorDims};
use crate::lora::error::{LoraError, Result};

/// Frozen 2-D convolution with a square kernel.
///
/// A slot's factors are `lora_a: [rank * k, in * k]` and
/// `lora_b: [out * k, rank * k]`; their product is viewed as a kernel of the
/// same `[out, in, k, k]` shape as the base weight and convolved with the
/// input using the host's stride, padding and dilation.
#[derive(Debug, Clone)]
pub struct Conv2dTransform {
    weight: Tensor,
    bias: Option<Tensor>,
    config: Conv2dConfig,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
}

impl Conv2dTransform {
    pub fn new(weight: Tensor, bias: Option<Tensor>, config: Conv2dConfig) -> Result<Self> {
        let (out_channels, in_channels, kh, kw) = weight
            .dims4()
            .map_err(|_| LoraError::WeightShape(format!("conv weight {:?}", weight.dims())))?;
        if kh != kw {
            return Err(LoraError::WeightShape(format!(
                "conv kernel must be square, got {kh}x{kw}"
            )));
        }
        if config.groups != 1 {
            return Err(LoraError::WeightShape(format!(
                "grouped convolution (groups={}) cannot host a low-rank kernel",
                config.groups
            )));
        }
        Ok(Self {
            weight,
            bias,
            config,
            in_channels,
            out_channels,
            kernel_size: kh,
        })
    }

    pub fn load(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv2dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get(
            (out_channels, in_channels, kernel_size, kernel_size),
            "weight",
        )?;
        let bias = vb.get(out_channels, "bias")?;
        Self::new(weight, Some(bias), config)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }
}

impl BaseTransform for Conv2dTransform {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let conv = Conv2d::new(self.weight.clone(), self.bias.clone(), self.config);
        Ok(conv.forward(xs)?)
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
        let k = self.kernel_size;
        Some(FactorDims::new(
            (rank * k, self.in_channels * k),
            (self.out_channels * k, rank * k),
        ))
    }

    fn slot_contribution(&self, xs: &Tensor, slot: &AdapterSlot) -> Result<Tensor> {
        let kernel = self.slot_delta(slot)?;
        Ok(xs.conv2d(
            &kernel,
            self.config.padding,
            self.config.stride,
            self.config.dilation,
            self.config.groups,
        )?)
    }

    fn slot_delta(&self, slot: &AdapterSlot) -> Result<Tensor> {
        let delta = slot.lora_b().matmul(slot.lora_a())?;
        Ok(delta.reshape(self.weight.shape())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_conv_factor_dims() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let conv = Conv2dTransform::load(3, 8, 3, Conv2dConfig::default(), vb).unwrap();
        assert_eq!(
            conv.factor_dims(2).unwrap(),
            FactorDims::new((6, 9), (24, 6))
        );
        assert_eq!(conv.kernel_size(), 3);
    }

    #[test]
    fn test_conv_forward_shape() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0.0f32, 1.0, (4, 2, 3, 3), &device).unwrap();
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = Conv2dTransform::new(weight, None, config).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 5, 5), &device).unwrap();
        assert_eq!(conv.forward(&x).unwrap().dims(), &[1, 4, 5, 5]);
    }

    #[test]
    fn test_conv_rejects_groups() {
        let weight = Tensor::zeros((4, 1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let config = Conv2dConfig {
            groups: 2,
            ..Default::default()
        };
        assert!(matches!(
            Conv2dTransform::new(weight, None, config),
            Err(LoraError::WeightShape(_))
        ));
    }

    #[test]
    fn test_conv_rejects_rectangular_kernel() {
        let weight = Tensor::zeros((4, 2, 3, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(Conv2dTransform::new(weight, None, Conv2dConfig::default()).is_err());
    }
}
