//! Precision, accelerator and checkpoint-mode enums.

use serde::{Deserialize, Serialize};

/// Precision of stored weights (`trainer.precision`).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WeightPrecision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl std::fmt::Display for WeightPrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fp32 => write!(f, "fp32"),
            Self::Fp16 => write!(f, "fp16"),
            Self::Bf16 => write!(f, "bf16"),
        }
    }
}

/// Compute precision of the backend (`lightning.precision`).
///
/// Accepts the integer forms `32` and `16` as well as the strings `"32"`,
/// `"16"`, `"bf16"` and the `-mixed` spellings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ComputePrecision {
    #[default]
    Full,
    Half,
    BFloat,
}

impl std::fmt::Display for ComputePrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "32"),
            Self::Half => write!(f, "16"),
            Self::BFloat => write!(f, "bf16"),
        }
    }
}

impl std::str::FromStr for ComputePrecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "32" | "32-true" | "fp32" => Ok(Self::Full),
            "16" | "16-mixed" | "fp16" => Ok(Self::Half),
            "bf16" | "bf16-mixed" => Ok(Self::BFloat),
            _ => Err(format!(
                "unknown precision '{s}'. Use: 32, 16, bf16"
            )),
        }
    }
}

impl Serialize for ComputePrecision {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Full => serializer.serialize_u32(32),
            Self::Half => serializer.serialize_u32(16),
            Self::BFloat => serializer.serialize_str("bf16"),
        }
    }
}

impl<'de> Deserialize<'de> for ComputePrecision {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u32),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(bits) => bits.to_string().parse(),
            Raw::Str(s) => s.parse(),
        }
        .map_err(serde::de::Error::custom)
    }
}

/// Accelerator requested for the run.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    Gpu,
    #[default]
    Auto,
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Whether a monitored metric improves when it decreases or increases.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    #[default]
    Min,
    Max,
}

impl CheckpointMode {
    /// Returns true if `candidate` is strictly better than `current`.
    #[must_use]
    pub fn is_better(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Min => candidate < current,
            Self::Max => candidate > current,
        }
    }
}
