//! Weight files written at the configured storage precision.

use std::path::PathBuf;

use burn::{
    module::Module,
    prelude::Backend,
    record::{
        FullPrecisionSettings, HalfPrecisionSettings, NamedMpkFileRecorder, PrecisionSettings,
        RecorderError,
    },
};
use kiln_config::WeightPrecision;
use serde::{Deserialize, Serialize};

/// Stores floats as `bf16`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BFloatPrecisionSettings;

impl PrecisionSettings for BFloatPrecisionSettings {
    type FloatElem = half::bf16;
    type IntElem = i32;
}

/// Save `module` to `path` (the recorder appends `.mpk`).
pub fn save_weights<B: Backend, M: Module<B>>(
    module: M,
    path: impl Into<PathBuf>,
    precision: WeightPrecision,
) -> Result<(), RecorderError> {
    let path = path.into();
    match precision {
        WeightPrecision::Fp32 => {
            module.save_file(path, &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
        }
        WeightPrecision::Fp16 => {
            module.save_file(path, &NamedMpkFileRecorder::<HalfPrecisionSettings>::new())
        }
        WeightPrecision::Bf16 => {
            module.save_file(path, &NamedMpkFileRecorder::<BFloatPrecisionSettings>::new())
        }
    }
}

/// Load weights written by [`save_weights`] with the same precision.
pub fn load_weights<B: Backend, M: Module<B>>(
    module: M,
    path: impl Into<PathBuf>,
    precision: WeightPrecision,
    device: &B::Device,
) -> Result<M, RecorderError> {
    let path = path.into();
    match precision {
        WeightPrecision::Fp32 => module.load_file(
            path,
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        ),
        WeightPrecision::Fp16 => module.load_file(
            path,
            &NamedMpkFileRecorder::<HalfPrecisionSettings>::new(),
            device,
        ),
        WeightPrecision::Bf16 => module.load_file(
            path,
            &NamedMpkFileRecorder::<BFloatPrecisionSettings>::new(),
            device,
        ),
    }
}
