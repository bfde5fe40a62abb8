//! Layer and adaptation configuration.

use serde::{Deserialize, Serialize};

use super::error::{LoraError, Result};

/// Training regime reported by the host, serialized under the key `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingType {
    /// EMA training with an extra, always-frozen third slot.
    Mix,
    #[default]
    #[serde(other)]
    Standard,
}

/// Adaptation flags supplied once at layer construction.
///
/// Replaces the shared agent object of a training loop: every layer built
/// from the same value agrees on how many slots exist and which are trained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationConfig {
    /// One slot per task, gated by the active task index.
    #[serde(default)]
    pub multi: bool,
    /// Live slot plus an EMA shadow slot.
    #[serde(default)]
    pub ema: bool,
    /// Learned per-slot blend weights when several slots contribute.
    #[serde(default)]
    pub ada_weights: bool,
    /// Number of tasks in the continual-learning schedule.
    #[serde(default = "default_num_tasks")]
    pub num_tasks: usize,
    #[serde(rename = "type", default)]
    pub training_type: TrainingType,
}

fn default_num_tasks() -> usize {
    1
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            multi: false,
            ema: false,
            ada_weights: false,
            num_tasks: 1,
            training_type: TrainingType::Standard,
        }
    }
}

impl AdaptationConfig {
    /// Single adapter, no gating.
    pub fn single() -> Self {
        Self::default()
    }

    /// One slot per task.
    pub fn multi_task(num_tasks: usize) -> Self {
        Self {
            multi: true,
            num_tasks,
            ..Self::default()
        }
    }

    /// Live slot plus EMA shadow.
    pub fn ema(num_tasks: usize) -> Self {
        Self {
            ema: true,
            num_tasks,
            ..Self::default()
        }
    }

    pub fn with_ada_weights(mut self, enabled: bool) -> Self {
        self.ada_weights = enabled;
        self
    }

    pub fn with_training_type(mut self, training_type: TrainingType) -> Self {
        self.training_type = training_type;
        self
    }

    /// Parse from a JSON document.
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Number of slots every layer built from this config holds.
    ///
    /// EMA mode always holds the live and shadow slots, plus a frozen third
    /// slot for [`TrainingType::Mix`]. Multi-task mode holds one slot per task.
    pub fn num_adapters(&self) -> usize {
        if self.ema {
            match self.training_type {
                TrainingType::Mix => 3,
                TrainingType::Standard => 2,
            }
        } else if self.multi {
            self.num_tasks
        } else {
            1
        }
    }

    /// Blend weights exist only when more than one slot can contribute.
    ///
    /// EMA layers read a single track per forward, so they never blend.
    pub fn ada_weights_enabled(&self) -> bool {
        self.ada_weights && !self.ema && self.num_adapters() > 1
    }

    pub fn validate(&self) -> Result<()> {
        if (self.multi || self.ema) && self.num_tasks == 0 {
            return Err(LoraError::InvalidTaskCount(self.num_tasks));
        }
        Ok(())
    }
}

/// Initialization scheme for one slot's factor pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorInit {
    /// Down-factor kaiming-uniform (a = sqrt(5)), up-factor zero.
    KaimingUniformDown,
    /// Down-factor zero, up-factor standard normal.
    ZeroDown,
}

/// Per-layer adapter hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraLayerConfig {
    /// Adapter rank; 0 disables adaptation.
    #[serde(default)]
    pub r: usize,
    #[serde(default = "default_alpha")]
    pub lora_alpha: f64,
    /// Dropout applied to the correction path input while training.
    #[serde(default)]
    pub lora_dropout: f32,
    /// Fold corrections into the base weight on `eval`.
    #[serde(default = "default_merge_weights")]
    pub merge_weights: bool,
    /// The host stores its weight as `[in, out]`.
    #[serde(default)]
    pub fan_in_fan_out: bool,
    /// Overrides the host transform's default scheme.
    #[serde(default)]
    pub init: Option<FactorInit>,
}

fn default_alpha() -> f64 {
    1.0
}

fn default_merge_weights() -> bool {
    true
}

impl Default for LoraLayerConfig {
    fn default() -> Self {
        Self {
            r: 0,
            lora_alpha: default_alpha(),
            lora_dropout: 0.0,
            merge_weights: true,
            fan_in_fan_out: false,
            init: None,
        }
    }
}

impl LoraLayerConfig {
    pub fn new(r: usize, lora_alpha: f64) -> Self {
        Self {
            r,
            lora_alpha,
            ..Self::default()
        }
    }

    pub fn with_dropout(mut self, p: f32) -> Self {
        self.lora_dropout = p;
        self
    }

    pub fn with_merge_weights(mut self, merge: bool) -> Self {
        self.merge_weights = merge;
        self
    }

    pub fn with_fan_in_fan_out(mut self, fan_in_fan_out: bool) -> Self {
        self.fan_in_fan_out = fan_in_fan_out;
        self
    }

    pub fn with_init(mut self, init: FactorInit) -> Self {
        self.init = Some(init);
        self
    }

    /// `alpha / r`, shared by every slot of the layer. `None` when `r == 0`.
    pub fn scaling(&self) -> Option<f64> {
        (self.r > 0).then(|| self.lora_alpha / self.r as f64)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lora_alpha.is_finite() {
            return Err(LoraError::InvalidAlpha(self.lora_alpha));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(LoraError::InvalidDropout(self.lora_dropout));
        }
        Ok(())
    }
}
