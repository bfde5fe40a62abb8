//! A host transform composed with an adapter bank.

use candle_core::{Tensor, Var};
use candle_nn::Dropout;

use super::bank::{AdapterBank, AdapterSlot};
use super::blend::BlendWeights;
use super::config::{AdaptationConfig, LoraLayerConfig};
use super::context::TaskState;
use super::error::{LoraError, Result};
use super::lock::apply_lock_policy;
use super::merge::{MergeState, MergeStateMachine};
use super::selection::{SelectionPolicy, SlotWeight};
use super::transform::BaseTransform;

/// Frozen host transform plus trainable low-rank corrections.
///
/// ```text
/// unmerged: y = base(x) + scaling * sum_i w_i * contribution_i(dropout(x))
/// merged:   y = base'(x),  base' = base + scaling * sum_i delta_i
/// ```
///
/// The layer starts in training mode and unmerged. `eval` folds the
/// corrections into the base weight when merging is enabled; `train` takes
/// them back out.
pub struct LoraLayer<T: BaseTransform> {
    base: T,
    rank: usize,
    scaling: f64,
    bank: Option<AdapterBank>,
    blend: Option<BlendWeights>,
    policy: SelectionPolicy,
    merge: MergeStateMachine,
    dropout: Option<Dropout>,
    training: bool,
}

impl<T: BaseTransform> LoraLayer<T> {
    pub fn new(base: T, layer: &LoraLayerConfig, adaptation: &AdaptationConfig) -> Result<Self> {
        layer.validate()?;
        adaptation.validate()?;

        let policy = SelectionPolicy::new(adaptation);
        let num_adapters = adaptation.num_adapters();
        let dtype = base.weight().dtype();
        let device = base.weight().device().clone();

        let bank = match (layer.r, base.factor_dims(layer.r)) {
            (0, _) | (_, None) => None,
            (rank, Some(dims)) => {
                let init = layer.init.unwrap_or_else(|| base.default_init());
                let mut bank = AdapterBank::create(rank, dims, num_adapters, init, dtype, &device)?;
                apply_lock_policy(&mut bank, adaptation);
                Some(bank)
            }
        };

        let blend = match &bank {
            Some(bank) if adaptation.ada_weights_enabled() => {
                let blend = BlendWeights::new(bank.len(), dtype, &device)?;
                blend.check_slot_count(policy.num_adapters())?;
                Some(blend)
            }
            _ => None,
        };

        // folding several slots would bypass gating and EMA isolation
        let merge_enabled = layer.merge_weights && bank.is_some() && num_adapters == 1;
        if layer.merge_weights && num_adapters > 1 {
            tracing::debug!(num_adapters, "weight merging disabled for multi-slot layer");
        }

        let dropout = (layer.lora_dropout > 0.0 && base.supports_input_dropout())
            .then(|| Dropout::new(layer.lora_dropout));

        Ok(Self {
            base,
            rank: if bank.is_some() { layer.r } else { 0 },
            scaling: if bank.is_some() {
                layer.scaling().unwrap_or(0.0)
            } else {
                0.0
            },
            bank,
            blend,
            policy,
            merge: MergeStateMachine::new(merge_enabled),
            dropout,
            training: true,
        })
    }

    /// Base output plus the selected slots' corrections.
    ///
    /// Once merged, or when adaptation is disabled, this is the base op alone.
    pub fn forward(&self, xs: &Tensor, task: &dyn TaskState) -> Result<Tensor> {
        let bank = match &self.bank {
            Some(bank) if !self.merge.is_merged() => bank,
            _ => return self.base.forward(xs),
        };
        let expected = self.policy.num_adapters();
        if bank.len() != expected {
            return Err(LoraError::SlotCountMismatch {
                expected,
                found: bank.len(),
            });
        }

        let mut result = self.base.forward(xs)?;
        let lora_in = match &self.dropout {
            Some(dropout) => dropout.forward(xs, self.training)?,
            None => xs.clone(),
        };

        let selected = self.policy.select(task);
        tracing::trace!(
            task = task.active_task_index(),
            slots = ?selected.iter().map(|s| s.index).collect::<Vec<_>>(),
            "selected adapter slots"
        );
        for sel in selected {
            let slot = bank.get(sel.index).ok_or(LoraError::SlotCountMismatch {
                expected,
                found: bank.len(),
            })?;
            let mut contribution = (self.base.slot_contribution(&lora_in, slot)? * self.scaling)?;
            if let SlotWeight::Blend { row, col } = sel.weight {
                if let Some(blend) = &self.blend {
                    contribution = contribution.broadcast_mul(&blend.weight(row, col)?)?;
                }
            }
            result = (result + contribution)?;
        }
        Ok(result)
    }

    /// `train(true)` unmerges; `train(false)` is [`LoraLayer::eval`].
    pub fn train(&mut self, mode: bool) -> Result<()> {
        if !mode {
            return self.eval();
        }
        self.training = true;
        let Self { base, merge, .. } = self;
        let unmerged = merge.to_train(|delta| {
            let weight = (base.weight() - delta)?;
            base.set_weight(weight)
        })?;
        if unmerged {
            tracing::debug!(rank = self.rank, "unmerged adapter weights");
        }
        Ok(())
    }

    /// Switch to evaluation mode, folding corrections when enabled.
    pub fn eval(&mut self) -> Result<()> {
        self.training = false;
        let Self {
            base,
            bank,
            merge,
            scaling,
            ..
        } = self;
        let merged = merge.to_eval(|| {
            let delta = combined_delta(base, bank.as_ref(), *scaling)?;
            let weight = (base.weight() + &delta)?;
            base.set_weight(weight)?;
            Ok(delta)
        })?;
        if merged {
            tracing::debug!(rank = self.rank, "merged adapter weights");
        }
        Ok(())
    }

    /// `scaling * sum_i B_i @ A_i` over every slot, in the base weight layout.
    pub fn delta_weight(&self) -> Result<Tensor> {
        combined_delta(&self.base, self.bank.as_ref(), self.scaling)
    }

    /// Vars an optimizer should update: trainable slots and blend weights.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self
            .slots()
            .iter()
            .filter(|s| s.is_trainable())
            .flat_map(|s| s.vars().into_iter().cloned())
            .collect();
        if let Some(blend) = &self.blend {
            vars.extend(blend.vars().cloned());
        }
        vars
    }

    pub fn num_trainable_params(&self) -> usize {
        self.trainable_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Base weight plus frozen slots.
    pub fn num_frozen_params(&self) -> usize {
        let frozen_slots: usize = self
            .slots()
            .iter()
            .filter(|s| !s.is_trainable())
            .map(|s| s.num_params())
            .sum();
        self.base.num_params() + frozen_slots
    }

    pub fn base(&self) -> &T {
        &self.base
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// `alpha / r`, or 0 when adaptation is disabled.
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    pub fn is_adapted(&self) -> bool {
        self.bank.is_some()
    }

    pub fn num_adapters(&self) -> usize {
        self.bank.as_ref().map_or(0, |b| b.len())
    }

    pub fn slot(&self, index: usize) -> Option<&AdapterSlot> {
        self.bank.as_ref().and_then(|b| b.get(index))
    }

    pub fn slots(&self) -> &[AdapterSlot] {
        self.bank.as_ref().map(|b| b.slots()).unwrap_or(&[])
    }

    pub fn blend_weights(&self) -> Option<&BlendWeights> {
        self.blend.as_ref()
    }

    pub fn state(&self) -> MergeState {
        self.merge.state()
    }

    pub fn is_merged(&self) -> bool {
        self.merge.is_merged()
    }

    pub fn merges_on_eval(&self) -> bool {
        self.merge.is_enabled()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

fn combined_delta<T: BaseTransform>(
    base: &T,
    bank: Option<&AdapterBank>,
    scaling: f64,
) -> Result<Tensor> {
    let mut total = base.weight().zeros_like()?;
    if let Some(bank) = bank {
        for slot in bank.iter() {
            total = (total + base.slot_delta(slot)?)?;
        }
    }
    Ok((total * scaling)?)
}
