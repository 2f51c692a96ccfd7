//! Multi-format checkpoint saving.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::ckpt::{self, CkptError};
use crate::state_dict::{StateDict, Weight};

/// Output container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Safetensors,
    Ckpt,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Safetensors => "safetensors",
            OutputFormat::Ckpt => "ckpt",
        }
    }
}

/// Errors produced while serializing the output mapping.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("failed to write safetensors file: {path}")]
    Safetensors {
        path: String,
        #[source]
        source: candle_core::Error,
    },

    #[error("failed to write checkpoint archive: {path}")]
    Ckpt {
        path: String,
        #[source]
        source: CkptError,
    },
}

/// Write one file per requested format into `dir`, named
/// `<base_name>.<ext>`, and return the paths written.
///
/// Formats are written in request order with no cross-format atomicity: a
/// failure aborts the remaining formats and leaves earlier files on disk.
pub fn save_state_dict(
    state_dict: &StateDict,
    dir: &Path,
    base_name: &str,
    formats: &[OutputFormat],
) -> Result<Vec<PathBuf>, SaveError> {
    let mut written = Vec::with_capacity(formats.len());

    for format in formats {
        let path = dir.join(format!("{base_name}.{}", format.extension()));
        info!("saving to {}", path.display());
        match format {
            OutputFormat::Safetensors => save_safetensors(state_dict, &path)?,
            OutputFormat::Ckpt => {
                ckpt::write_checkpoint(state_dict, &path).map_err(|e| SaveError::Ckpt {
                    path: path.display().to_string(),
                    source: e,
                })?;
            }
        }
        written.push(path);
    }

    Ok(written)
}

fn save_safetensors(state_dict: &StateDict, path: &Path) -> Result<(), SaveError> {
    let mut tensors = HashMap::new();
    for (key, weight) in state_dict {
        match weight {
            Weight::Tensor(t) => {
                tensors.insert(key.clone(), t.clone());
            }
            // The format stores tensors only; scalar payloads survive in
            // ckpt output but not here.
            _ => warn!("skipping non-tensor entry {key}: not representable in safetensors"),
        }
    }
    candle_core::safetensors::save(&tensors, path).map_err(|e| SaveError::Safetensors {
        path: path.display().to_string(),
        source: e,
    })
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "safetensors" => Ok(OutputFormat::Safetensors),
            "ckpt" => Ok(OutputFormat::Ckpt),
            _ => Err(format!(
                "unknown checkpoint format: {s} (expected safetensors or ckpt)"
            )),
        }
    }
}
