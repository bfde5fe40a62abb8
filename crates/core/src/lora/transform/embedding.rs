//! Embedding lookup host.

use candle_core::{Module, Tensor};
use candle_nn::{Embedding, VarBuilder};

use super::{check_same_shape, flatten_leading, restore_leading, BaseTransform};
use crate::lora::bank::{AdapterSlot, FactorDims};
use crate::lora::config::FactorInit;
use crate::lora::error::{LoraError, Result};

/// Frozen embedding table `[num_embeddings, embedding_dim]`.
///
/// The down-factor `[rank, num_embeddings]` is itself gathered by token id,
/// then projected by the up-factor `[embedding_dim, rank]`:
/// ```text
/// embedding(ids, lora_a.T) @ lora_b.T
/// ```
#[derive(Debug, Clone)]
pub struct EmbeddingTransform {
    weight: Tensor,
    num_embeddings: usize,
    embedding_dim: usize,
}

impl EmbeddingTransform {
    pub fn new(weight: Tensor) -> Result<Self> {
        let (num_embeddings, embedding_dim) = weight.dims2().map_err(|_| {
            LoraError::WeightShape(format!("embedding table {:?}", weight.dims()))
        })?;
        Ok(Self {
            weight,
            num_embeddings,
            embedding_dim,
        })
    }

    pub fn load(num_embeddings: usize, embedding_dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((num_embeddings, embedding_dim), "weight")?;
        Self::new(weight)
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

impl BaseTransform for EmbeddingTransform {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let embedding = Embedding::new(self.weight.clone(), self.embedding_dim);
        Ok(embedding.forward(ids)?)
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
            (rank, self.num_embeddings),
            (self.embedding_dim, rank),
        ))
    }

    fn default_init(&self) -> FactorInit {
        FactorInit::ZeroDown
    }

    // token ids are not perturbed
    fn supports_input_dropout(&self) -> bool {
        false
    }

    fn slot_contribution(&self, ids: &Tensor, slot: &AdapterSlot) -> Result<Tensor> {
        let rank = slot.lora_a().dim(0)?;
        let table = slot.lora_a().t()?.contiguous()?;
        let after_a = Embedding::new(table, rank).forward(ids)?;
        let (a_2d, lead) = flatten_leading(&after_a)?;
        let out = a_2d.matmul(&slot.lora_b().t()?)?;
        restore_leading(&out, &lead)
    }

    fn slot_delta(&self, slot: &AdapterSlot) -> Result<Tensor> {
        let delta = slot.lora_b().matmul(slot.lora_a())?;
        Ok(delta.t()?.contiguous()?)
    }
}
