//! Merged/unmerged weight state.
//!
//! The two transition functions are the only way to flip the state. Each runs
//! its weight edit first and flips the state only if the edit succeeded, so a
//! failed fold leaves the layer where it was. The delta folded in on `to_eval`
//! is kept and handed back to `to_train`, so unmerging subtracts exactly what
//! was added even if the factors changed in between.

use candle_core::Tensor;

use super::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeState {
    /// Corrections are computed as a separate additive term.
    #[default]
    Unmerged,
    /// Corrections are folded into the base weight.
    Merged,
}

#[derive(Debug, Clone)]
pub struct MergeStateMachine {
    folded: Option<Tensor>,
    enabled: bool,
}

impl MergeStateMachine {
    /// A disabled machine stays [`MergeState::Unmerged`] forever.
    pub fn new(enabled: bool) -> Self {
        Self {
            folded: None,
            enabled,
        }
    }

    pub fn state(&self) -> MergeState {
        if self.folded.is_some() {
            MergeState::Merged
        } else {
            MergeState::Unmerged
        }
    }

    pub fn is_merged(&self) -> bool {
        self.folded.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Delta currently folded into the base weight.
    pub fn folded_delta(&self) -> Option<&Tensor> {
        self.folded.as_ref()
    }

    /// Fold and move to `Merged` if enabled and currently unmerged.
    ///
    /// `fold` applies the delta and returns it. Returns whether a transition
    /// happened.
    pub fn to_eval<F>(&mut self, fold: F) -> Result<bool>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        if !self.enabled || self.folded.is_some() {
            return Ok(false);
        }
        self.folded = Some(fold()?);
        Ok(true)
    }

    /// Unfold the stored delta and move to `Unmerged` if currently merged.
    pub fn to_train<F>(&mut self, unfold: F) -> Result<bool>
    where
        F: FnOnce(&Tensor) -> Result<()>,
    {
        let Some(delta) = self.folded.as_ref() else {
            return Ok(false);
        };
        unfold(delta)?;
        self.folded = None;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::error::LoraError;
    use candle_core::Device;
    use std::cell::Cell;

    fn delta(v: f32) -> Tensor {
        Tensor::new(&[v, v], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_transitions() {
        let mut machine = MergeStateMachine::new(true);
        let folds = Cell::new(0);
        assert_eq!(machine.state(), MergeState::Unmerged);

        assert!(machine
            .to_eval(|| {
                folds.set(folds.get() + 1);
                Ok(delta(1.0))
            })
            .unwrap());
        assert!(machine.is_merged());

        // second eval is a no-op
        assert!(!machine
            .to_eval(|| {
                folds.set(folds.get() + 1);
                Ok(delta(2.0))
            })
            .unwrap());
        assert_eq!(folds.get(), 1);

        assert!(machine.to_train(|_| Ok(())).unwrap());
        assert!(!machine.is_merged());
        assert!(!machine.to_train(|_| panic!("not merged")).unwrap());
    }

    #[test]
    fn test_unfold_receives_folded_delta() {
        let mut machine = MergeStateMachine::new(true);
        machine.to_eval(|| Ok(delta(3.0))).unwrap();
        let seen = Cell::new(0.0f32);
        machine
            .to_train(|d| {
                seen.set(d.to_vec1::<f32>().unwrap()[0]);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.get(), 3.0);
        assert!(machine.folded_delta().is_none());
    }

    #[test]
    fn test_disabled_never_merges() {
        let mut machine = MergeStateMachine::new(false);
        assert!(!machine.to_eval(|| panic!("disabled")).unwrap());
        assert_eq!(machine.state(), MergeState::Unmerged);
        assert!(!machine.to_train(|_| panic!("disabled")).unwrap());
    }

    #[test]
    fn test_failed_fold_keeps_state() {
        let mut machine = MergeStateMachine::new(true);
        let result = machine.to_eval(|| Err(LoraError::WeightShape("boom".into())));
        assert!(result.is_err());
        assert_eq!(machine.state(), MergeState::Unmerged);
    }

    #[test]
    fn test_failed_unfold_stays_merged() {
        let mut machine = MergeStateMachine::new(true);
        machine.to_eval(|| Ok(delta(1.0))).unwrap();
        assert!(machine
            .to_train(|_| Err(LoraError::WeightShape("boom".into())))
            .is_err());
        assert!(machine.is_merged());
    }
}
