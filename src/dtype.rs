use half::{bf16, f16};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compute precision tag carried by tensors. Storage is always f32; reduced
/// precisions are emulated by rounding through the `half` types, so overflow
/// behaves the way it would on real f16/bf16 hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        }
    }

    pub fn parse(s: &str) -> Option<DType> {
        match s.to_lowercase().as_str() {
            "f32" | "float32" => Some(DType::F32),
            "f16" | "float16" => Some(DType::F16),
            "bf16" | "bfloat16" => Some(DType::BF16),
            _ => None,
        }
    }

    pub fn is_reduced(&self) -> bool {
        !matches!(self, DType::F32)
    }

    /// Largest finite value representable in this precision.
    pub fn max_finite(&self) -> f32 {
        match self {
            DType::F32 => f32::MAX,
            DType::F16 => f16::MAX.to_f32(),
            DType::BF16 => bf16::MAX.to_f32(),
        }
    }

    /// Round a single value through this precision.
    pub fn round(&self, v: f32) -> f32 {
        match self {
            DType::F32 => v,
            DType::F16 => f16::from_f32(v).to_f32(),
            DType::BF16 => bf16::from_f32(v).to_f32(),
        }
    }

    pub fn round_array(&self, a: &ArrayD<f32>) -> ArrayD<f32> {
        match self {
            DType::F32 => a.clone(),
            _ => a.mapv(|v| self.round(v)),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
