//! Which slots receive gradients.
//!
//! Trainability is decided once, when the bank is built, and never revisited.

use super::bank::AdapterBank;
use super::config::{AdaptationConfig, TrainingType};

/// Trainable flag for each of `count` slots.
///
/// - EMA: slot 0 (live) trains; slot 1 (shadow) and the `mix` slot 2 are frozen.
/// - Multi-task: only the last slot, the newest task, trains.
/// - Single slot: trains.
pub fn trainable_mask(count: usize, config: &AdaptationConfig) -> Vec<bool> {
    if config.ema {
        (0..count)
            .map(|ix| match ix {
                0 => true,
                1 => false,
                2 if config.training_type == TrainingType::Mix => false,
                _ => true,
            })
            .collect()
    } else {
        (0..count).map(|ix| ix + 1 == count).collect()
    }
}

/// Set each slot's trainable flag according to [`trainable_mask`].
pub fn apply_lock_policy(bank: &mut AdapterBank, config: &AdaptationConfig) {
    let mask = trainable_mask(bank.len(), config);
    for (ix, trainable) in mask.into_iter().enumerate() {
        if let Some(slot) = bank.get_mut(ix) {
            slot.set_trainable(trainable);
        }
    }
    tracing::debug!(
        slots = bank.len(),
        ema = config.ema,
        trainable = bank.iter().filter(|s| s.is_trainable()).count(),
        "applied adapter lock policy"
    );
}
