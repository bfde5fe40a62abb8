//! Adapter slots and the bank that owns them.

use candle_core::{DType, Device, Tensor, Var};

use super::config::FactorInit;
use super::error::{LoraError, Result};

/// Factor shapes for one slot, as `(rows, cols)`.
///
/// The down-factor is `[rank', fan_in]` and the up-factor `[fan_out, rank']`
/// where `rank'` is the layer rank possibly multiplied by a layout factor
/// (enabled groups, kernel size).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactorDims {
    pub down: (usize, usize),
    pub up: (usize, usize),
}

impl FactorDims {
    pub fn new(down: (usize, usize), up: (usize, usize)) -> Self {
        Self { down, up }
    }
}

/// One low-rank correction: down-factor A, up-factor B.
///
/// ```text
/// delta = B @ A
/// ```
#[derive(Debug, Clone)]
pub struct AdapterSlot {
    lora_a: Var,
    lora_b: Var,
    trainable: bool,
}

impl AdapterSlot {
    fn init(dims: FactorDims, init: FactorInit, dtype: DType, device: &Device) -> Result<Self> {
        let (lora_a, lora_b) = match init {
            FactorInit::KaimingUniformDown => {
                // kaiming_uniform with a = sqrt(5) reduces to U(-1/sqrt(fan_in), 1/sqrt(fan_in))
                let bound = 1.0 / (dims.down.1.max(1) as f32).sqrt();
                let a = Tensor::rand(-bound, bound, dims.down, device)?.to_dtype(dtype)?;
                let b = Tensor::zeros(dims.up, dtype, device)?;
                (a, b)
            }
            FactorInit::ZeroDown => {
                let a = Tensor::zeros(dims.down, dtype, device)?;
                let b = Tensor::randn(0f32, 1f32, dims.up, device)?.to_dtype(dtype)?;
                (a, b)
            }
        };
        Ok(Self {
            lora_a: Var::from_tensor(&lora_a)?,
            lora_b: Var::from_tensor(&lora_b)?,
            trainable: true,
        })
    }

    /// Down-factor A.
    pub fn lora_a(&self) -> &Tensor {
        self.lora_a.as_tensor()
    }

    /// Up-factor B.
    pub fn lora_b(&self) -> &Tensor {
        self.lora_b.as_tensor()
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub(crate) fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Overwrite both factors in place. Shapes must match.
    ///
    /// Used by whatever maintains the EMA track, and by tests.
    pub fn set_factors(&self, lora_a: &Tensor, lora_b: &Tensor) -> Result<()> {
        self.lora_a.set(lora_a)?;
        self.lora_b.set(lora_b)?;
        Ok(())
    }

    pub fn vars(&self) -> [&Var; 2] {
        [&self.lora_a, &self.lora_b]
    }

    pub fn num_params(&self) -> usize {
        self.lora_a.elem_count() + self.lora_b.elem_count()
    }
}

/// Ordered, fixed-length collection of slots sharing one rank.
#[derive(Debug, Clone)]
pub struct AdapterBank {
    slots: Vec<AdapterSlot>,
    rank: usize,
    dims: FactorDims,
}

impl AdapterBank {
    /// Allocate `count` slots of rank `rank`, all trainable.
    pub fn create(
        rank: usize,
        dims: FactorDims,
        count: usize,
        init: FactorInit,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if rank == 0 {
            return Err(LoraError::InvalidRank(rank));
        }
        if count == 0 {
            return Err(LoraError::InvalidTaskCount(count));
        }
        if dims.down.0 != dims.up.1 {
            return Err(LoraError::WeightShape(format!(
                "down-factor {:?} and up-factor {:?} disagree on rank",
                dims.down, dims.up
            )));
        }
        let slots = (0..count)
            .map(|_| AdapterSlot::init(dims, init, dtype, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slots, rank, dims })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn dims(&self) -> FactorDims {
        self.dims
    }

    pub fn get(&self, index: usize) -> Option<&AdapterSlot> {
        self.slots.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut AdapterSlot> {
        self.slots.get_mut(index)
    }

    pub fn slots(&self) -> &[AdapterSlot] {
        &self.slots
    }

    pub fn iter(&self) -> impl Iterator<Item = &AdapterSlot> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(rank: usize, d_in: usize, d_out: usize) -> FactorDims {
        FactorDims::new((rank, d_in), (d_out, rank))
    }

    #[test]
    fn test_bank_shapes() {
        let bank = AdapterBank::create(
            4,
            dims(4, 16, 8),
            3,
            FactorInit::KaimingUniformDown,
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(bank.len(), 3);
        assert_eq!(bank.rank(), 4);
        for slot in bank.iter() {
            assert_eq!(slot.lora_a().dims(), &[4, 16]);
            assert_eq!(slot.lora_b().dims(), &[8, 4]);
            assert!(slot.is_trainable());
            assert_eq!(slot.num_params(), 4 * 16 + 8 * 4);
        }
    }

    #[test]
    fn test_kaiming_init_bounds() {
        let bank = AdapterBank::create(
            2,
            dims(2, 25, 3),
            1,
            FactorInit::KaimingUniformDown,
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        let slot = bank.get(0).unwrap();
        let a: Vec<f32> = slot.lora_a().flatten_all().unwrap().to_vec1().unwrap();
        assert!(a.iter().all(|v| v.abs() <= 0.2 + 1e-6));
        let b: Vec<f32> = slot.lora_b().flatten_all().unwrap().to_vec1().unwrap();
        assert!(b.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_zero_down_init() {
        let bank = AdapterBank::create(
            2,
            dims(2, 6, 5),
            2,
            FactorInit::ZeroDown,
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        for slot in bank.iter() {
            let a: Vec<f32> = slot.lora_a().flatten_all().unwrap().to_vec1().unwrap();
            assert!(a.iter().all(|&v| v == 0.0));
            let b_abs = slot
                .lora_b()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(b_abs > 0.0);
        }
    }

    #[test]
    fn test_zero_rank_rejected() {
        let err = AdapterBank::create(
            0,
            dims(0, 4, 4),
            1,
            FactorInit::ZeroDown,
            DType::F32,
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, LoraError::InvalidRank(0)));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_rank_disagreement_rejected() {
        let err = AdapterBank::create(
            2,
            FactorDims::new((2, 4), (4, 3)),
            1,
            FactorInit::ZeroDown,
            DType::F32,
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, LoraError::WeightShape(_)));
    }

    #[test]
    fn test_set_factors() {
        let device = Device::Cpu;
        let bank = AdapterBank::create(
            2,
            dims(2, 3, 4),
            1,
            FactorInit::ZeroDown,
            DType::F32,
            &device,
        )
        .unwrap();
        let slot = bank.get(0).unwrap();
        let a = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        let b = Tensor::ones((4, 2), DType::F32, &device).unwrap();
        slot.set_factors(&a, &b).unwrap();
        let sum = slot.lora_a().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(sum, 6.0);

        let wrong = Tensor::ones((3, 3), DType::F32, &device).unwrap();
        assert!(slot.set_factors(&wrong, &b).is_err());
    }
}
