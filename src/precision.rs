//! Target precision and the dtype-cast eligibility tables.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dtypes eligible for reduction to f16.
///
/// position_ids in CLIP is int64 and model_ema.num_updates is a 32-bit
/// counter; integer tensors and already-reduced floats must never be cast,
/// which is exactly what membership in these closed sets encodes.
pub const DTYPES_TO_FP16: [DType; 3] = [DType::F32, DType::F64, DType::BF16];

/// Dtypes eligible for reduction to bf16.
pub const DTYPES_TO_BF16: [DType; 3] = [DType::F32, DType::F64, DType::F16];

/// Output precision for converted tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Full,
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    /// Apply the precision cast to one tensor.
    ///
    /// Tensors whose dtype is outside the eligibility set pass through
    /// untouched, shape is always preserved verbatim.
    pub fn cast(&self, t: &Tensor) -> Result<Tensor> {
        let (target, eligible) = match self {
            Precision::Full | Precision::Fp32 => return Ok(t.clone()),
            Precision::Fp16 => (DType::F16, &DTYPES_TO_FP16),
            Precision::Bf16 => (DType::BF16, &DTYPES_TO_BF16),
        };
        if eligible.contains(&t.dtype()) {
            t.to_dtype(target)
        } else {
            Ok(t.clone())
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Precision::Full => "full",
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Bf16 => "bf16",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(Precision::Full),
            "fp32" => Ok(Precision::Fp32),
            "fp16" => Ok(Precision::Fp16),
            "bf16" => Ok(Precision::Bf16),
            _ => Err(format!(
                "unknown precision: {s} (expected full, fp32, fp16 or bf16)"
            )),
        }
    }
}
