//! Checkpoint loading.
//!
//! Two container formats are supported, dispatched on file extension:
//!
//! - `.safetensors`: length-prefixed JSON header plus a flat byte buffer,
//!   parsed directly with no arbitrary-code deserialization
//! - anything else: a torch pickle archive (`.ckpt` / `.pt`), read through
//!   candle's CPU-only pickle support

use candle_core::{Device, Tensor, pickle};
use std::path::Path;

use crate::state_dict::{StateDict, Weight};

/// Errors produced while reading a checkpoint file.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read safetensors file: {path}")]
    Safetensors {
        path: String,
        #[source]
        source: candle_core::Error,
    },

    #[error("failed to read checkpoint archive: {path}")]
    Pickle {
        path: String,
        #[source]
        source: candle_core::Error,
    },
}

/// Load a checkpoint into a fresh [`StateDict`], entirely on CPU memory.
///
/// Torch archives are unwrapped through their `state_dict` entry when one is
/// present; otherwise the top-level mapping is taken as-is. A malformed or
/// unreadable file fails the whole load, there is no partial recovery.
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<StateDict, LoadError> {
    let path = path.as_ref();
    let tensors = if has_extension(path, "safetensors") {
        load_safetensors(path)?
    } else {
        load_pickle(path)?
    };

    Ok(tensors
        .into_iter()
        .map(|(name, t)| (name, Weight::Tensor(t)))
        .collect())
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

fn load_safetensors(path: &Path) -> Result<Vec<(String, Tensor)>, LoadError> {
    let tensors =
        candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| LoadError::Safetensors {
            path: path.display().to_string(),
            source: e,
        })?;
    Ok(tensors.into_iter().collect())
}

fn load_pickle(path: &Path) -> Result<Vec<(String, Tensor)>, LoadError> {
    // Wrapped and bare layouts cannot be told apart without unpickling, so
    // try the `state_dict` entry first and fall back to the whole object.
    match pickle::read_all_with_key(path, Some("state_dict")) {
        Ok(tensors) if !tensors.is_empty() => Ok(tensors),
        _ => pickle::read_all(path).map_err(|e| LoadError::Pickle {
            path: path.display().to_string(),
            source: e,
        }),
    }
}
