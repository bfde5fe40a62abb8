//! Host transforms that an adapter bank can be attached to.
//!
//! Each host knows its frozen computation, one slot's contribution in its own
//! input/output algebra, and how a slot's `B @ A` product lays out inside its
//! weight tensor.

mod conv;
mod dense;
mod embedding;
mod grouped;

pub use conv::Conv2dTransform;
pub use dense::DenseTransform;
pub use embedding::EmbeddingTransform;
pub use grouped::GroupedDenseTransform;

use candle_core::Tensor;

use super::bank::{AdapterSlot, FactorDims};
use super::config::FactorInit;
use super::error::Result;

pub trait BaseTransform {
    /// The frozen host computation.
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Base weight in the host's storage layout.
    fn weight(&self) -> &Tensor;

    /// Replace the base weight. Shape must be unchanged.
    fn set_weight(&mut self, weight: Tensor) -> Result<()>;

    /// Factor shapes for a slot of the given rank, or `None` when this host
    /// has nothing to adapt.
    fn factor_dims(&self, rank: usize) -> Option<FactorDims>;

    fn default_init(&self) -> FactorInit {
        FactorInit::KaimingUniformDown
    }

    /// Whether correction-path dropout applies to this host's input.
    fn supports_input_dropout(&self) -> bool {
        true
    }

    /// Unscaled correction of one slot for input `xs`.
    fn slot_contribution(&self, xs: &Tensor, slot: &AdapterSlot) -> Result<Tensor>;

    /// Unscaled `B @ A` of one slot, laid out like [`BaseTransform::weight`].
    fn slot_delta(&self, slot: &AdapterSlot) -> Result<Tensor>;

    /// Count of frozen base parameters.
    fn num_params(&self) -> usize {
        self.weight().elem_count()
    }
}

/// `[..., d]` to `[n, d]`, returning the leading dims.
pub(crate) fn flatten_leading(xs: &Tensor) -> Result<(Tensor, Vec<usize>)> {
    let dims = xs.dims();
    let Some((&last, lead)) = dims.split_last() else {
        return Err(candle_core::Error::Msg("cannot adapt a scalar input".to_string()).into());
    };
    let n = lead.iter().product::<usize>();
    Ok((xs.reshape((n, last))?, lead.to_vec()))
}

/// Inverse of [`flatten_leading`].
pub(crate) fn restore_leading(xs: &Tensor, lead: &[usize]) -> Result<Tensor> {
    let mut dims = lead.to_vec();
    dims.push(xs.dim(1)?);
    Ok(xs.reshape(dims)?)
}

/// Check a replacement weight against the current one.
pub(crate) fn check_same_shape(current: &Tensor, new: &Tensor) -> Result<()> {
    if current.dims() != new.dims() {
        return Err(super::error::LoraError::WeightShape(format!(
            "replacement weight {:?} does not match {:?}",
            new.dims(),
            current.dims()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_flatten_restore() {
        let xs = Tensor::zeros((2, 3, 5), DType::F32, &Device::Cpu).unwrap();
        let (flat, lead) = flatten_leading(&xs).unwrap();
        assert_eq!(flat.dims(), &[6, 5]);
        assert_eq!(lead, vec![2, 3]);
        let back = restore_leading(&flat, &lead).unwrap();
        assert_eq!(back.dims(), &[2, 3, 5]);
    }

    #[test]
    fn test_flatten_vector() {
        let xs = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let (flat, lead) = flatten_leading(&xs).unwrap();
        assert_eq!(flat.dims(), &[1, 4]);
        assert_eq!(restore_leading(&flat, &lead).unwrap().dims(), &[4]);
    }
}
