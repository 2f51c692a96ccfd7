//! In-memory representation of a checkpoint's weight mapping.

use candle_core::{DType, Tensor};
use std::collections::BTreeMap;

/// A checkpoint's full parameter set: dotted hierarchical key -> weight.
///
/// `BTreeMap` keeps iteration deterministic; every per-key decision in the
/// pipeline looks entries up by name, never by position, so sorted order is
/// observationally equivalent to the source file's insertion order.
pub type StateDict = BTreeMap<String, Weight>;

/// A single checkpoint entry.
///
/// Almost every entry is a tensor. The scalar variants cover the rare
/// bookkeeping payloads (step counters, decay factors) some training
/// frameworks store alongside the weights; they are never precision-cast.
#[derive(Debug, Clone)]
pub enum Weight {
    Tensor(Tensor),
    Int(i64),
    Float(f64),
}

impl Weight {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Weight::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Element dtype for tensor entries, `None` for scalar payloads.
    pub fn dtype(&self) -> Option<DType> {
        self.as_tensor().map(Tensor::dtype)
    }
}

impl From<Tensor> for Weight {
    fn from(t: Tensor) -> Self {
        Weight::Tensor(t)
    }
}
