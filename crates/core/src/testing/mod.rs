//! Shared test utilities for cl-lora-core.

use candle_core::{DType, Device, Tensor};

/// Largest elementwise absolute difference between two same-shaped tensors.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .and_then(|d| d.abs())
        .and_then(|d| d.to_dtype(DType::F32))
        .and_then(|d| d.flatten_all())
        .and_then(|d| d.max(0))
        .and_then(|d| d.to_scalar::<f32>())
        .unwrap_or(f32::INFINITY)
}

/// Deterministic `[rows, cols]` tensor with values in `[-1, 1]`.
pub fn patterned(rows: usize, cols: usize, seed: f32, device: &Device) -> Tensor {
    let data: Vec<f32> = (0..rows * cols)
        .map(|i| ((i as f32 + seed) * 0.37).sin())
        .collect();
    Tensor::from_vec(data, (rows, cols), device).expect("patterned tensor")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_abs_diff() {
        let device = Device::Cpu;
        let a = Tensor::new(&[1f32, 2.0, 3.0], &device).unwrap();
        let b = Tensor::new(&[1f32, 2.5, 1.0], &device).unwrap();
        assert!((max_abs_diff(&a, &b) - 2.0).abs() < 1e-6);
        assert_eq!(max_abs_diff(&a, &a), 0.0);
    }

    #[test]
    fn test_patterned_is_deterministic() {
        let a = patterned(3, 4, 1.0, &Device::Cpu);
        let b = patterned(3, 4, 1.0, &Device::Cpu);
        assert_eq!(max_abs_diff(&a, &b), 0.0);
        assert_eq!(a.dims(), &[3, 4]);
    }
}
