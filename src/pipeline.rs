//! The conversion pipeline and its host-side collaborators.
//!
//! The host application owns model discovery, progress display and path
//! configuration; the pipeline sees them only as the [`ModelRegistry`] and
//! [`JobTracker`] traits plus an explicit destination directory, so a run is
//! a pure function of (input file, request) -> (output files, diagnostics).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::convert::{ConvertOptions, PruneMode, SubsystemActions, convert_state_dict};
use crate::loader::{LoadError, load_checkpoint};
use crate::precision::Precision;
use crate::repair::{RepairReport, fix_state_dict};
use crate::save::{OutputFormat, SaveError, save_state_dict};

// =============================================================================
// Host collaborators
// =============================================================================

/// A model known to the host's registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub filename: PathBuf,
    pub display_name: String,
}

impl ModelInfo {
    /// Build registry info straight from a checkpoint path; the display name
    /// is the file stem.
    pub fn from_path(path: &Path) -> Option<Self> {
        let display_name = path.file_stem()?.to_str()?.to_string();
        Some(Self {
            filename: path.to_path_buf(),
            display_name,
        })
    }
}

/// Model discovery, supplied by the host.
pub trait ModelRegistry {
    fn resolve(&self, model_id: &str) -> Option<ModelInfo>;
}

/// File extensions recognized as checkpoints by [`DirectoryRegistry`].
const CHECKPOINT_EXTENSIONS: [&str; 3] = ["safetensors", "ckpt", "pt"];

/// Registry backed by a flat directory of checkpoint files.
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// All checkpoints in the registry directory, sorted by display name.
    pub fn list(&self) -> std::io::Result<Vec<ModelInfo>> {
        let mut models = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if is_checkpoint_file(&path)
                && let Some(info) = ModelInfo::from_path(&path)
            {
                models.push(info);
            }
        }
        models.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(models)
    }
}

impl ModelRegistry for DirectoryRegistry {
    /// Resolves a display name, a file name, or a direct checkpoint path.
    fn resolve(&self, model_id: &str) -> Option<ModelInfo> {
        let direct = Path::new(model_id);
        if direct.is_file() {
            return ModelInfo::from_path(direct);
        }
        self.list().ok()?.into_iter().find(|m| {
            m.display_name == model_id
                || m.filename.file_name().and_then(|n| n.to_str()) == Some(model_id)
        })
    }
}

fn is_checkpoint_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| CHECKPOINT_EXTENSIONS.contains(&ext))
}

/// Advisory job/progress tracking, supplied by the host.
pub trait JobTracker {
    fn begin(&mut self);
    fn set_status(&mut self, status: &str);
    fn end(&mut self);
}

/// Tracker that discards everything.
pub struct NullTracker;

impl JobTracker for NullTracker {
    fn begin(&mut self) {}
    fn set_status(&mut self, _status: &str) {}
    fn end(&mut self) {}
}

/// Tracker that forwards status texts to the log.
pub struct LogTracker;

impl JobTracker for LogTracker {
    fn begin(&mut self) {
        info!("model conversion started");
    }

    fn set_status(&mut self, status: &str) {
        info!("{status}");
    }

    fn end(&mut self) {
        info!("model conversion finished");
    }
}

// =============================================================================
// Request / outcome
// =============================================================================

/// Per-run configuration, as supplied by the host UI or the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConvertRequest {
    pub model: String,
    pub formats: Vec<OutputFormat>,
    pub precision: Precision,
    pub prune: PruneMode,
    pub actions: SubsystemActions,
    pub custom_name: Option<String>,
    pub force_position_ids: bool,
    pub fix_clip: bool,
}

impl Default for ConvertRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            formats: vec![OutputFormat::Ckpt],
            precision: Precision::Fp32,
            prune: PruneMode::Disabled,
            actions: SubsystemActions::default(),
            custom_name: None,
            force_position_ids: false,
            fix_clip: false,
        }
    }
}

/// Errors produced while loading a request from JSON.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read request file: {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse request file: {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConvertRequest {
    /// Load a full request from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}

/// What one successful run produced.
#[derive(Debug)]
pub struct ConvertOutcome {
    pub written: Vec<PathBuf>,
    pub repair: RepairReport,
    pub input_keys: usize,
    pub output_keys: usize,
}

impl ConvertOutcome {
    /// The single user-facing text for this run.
    pub fn summary(&self) -> String {
        self.written
            .iter()
            .map(|p| format!("Checkpoint saved to {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Errors that abort a conversion run.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("you must choose a model")]
    EmptyModel,

    #[error("at least choose one model save format")]
    NoFormats,

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error("tensor operation failed")]
    Tensor(#[from] candle_core::Error),
}

// =============================================================================
// Pipeline
// =============================================================================

/// Derive the output base name from the run settings.
///
/// A non-empty custom name replaces the derived name entirely.
pub fn output_base_name(
    display_name: &str,
    precision: Precision,
    prune: PruneMode,
    fix_clip: bool,
    custom_name: Option<&str>,
) -> String {
    if let Some(custom) = custom_name
        && !custom.is_empty()
    {
        return custom.to_string();
    }

    let mut name = format!("{display_name}-{precision}");
    if prune != PruneMode::Disabled {
        name.push_str(&format!("-{prune}"));
    }
    if fix_clip {
        name.push_str("-clip-fix");
    }
    name
}

/// Run one conversion: load, repair, convert, save.
///
/// Validation happens first and fails before any I/O. The run is synchronous
/// and single-threaded; the whole mapping is in memory throughout.
pub fn run(
    request: &ConvertRequest,
    registry: &dyn ModelRegistry,
    dest_dir: &Path,
    tracker: &mut dyn JobTracker,
) -> Result<ConvertOutcome, ConvertError> {
    if request.model.is_empty() {
        return Err(ConvertError::EmptyModel);
    }
    if request.formats.is_empty() {
        return Err(ConvertError::NoFormats);
    }
    let info = registry
        .resolve(&request.model)
        .ok_or_else(|| ConvertError::UnknownModel(request.model.clone()))?;

    tracker.begin();
    let result = run_stages(request, &info, dest_dir, tracker);
    tracker.end();
    result
}

fn run_stages(
    request: &ConvertRequest,
    info: &ModelInfo,
    dest_dir: &Path,
    tracker: &mut dyn JobTracker,
) -> Result<ConvertOutcome, ConvertError> {
    tracker.set_status(&format!("Loading {}...", info.filename.display()));
    info!("loading {}", info.filename.display());
    let mut state_dict = load_checkpoint(&info.filename)?;
    let input_keys = state_dict.len();

    let repair = fix_state_dict(&mut state_dict, request.fix_clip, request.force_position_ids)?;

    tracker.set_status("Converting model...");
    let options = ConvertOptions {
        precision: request.precision,
        prune: request.prune,
        actions: request.actions,
    };
    let output = convert_state_dict(&state_dict, &options)?;

    let base_name = output_base_name(
        &info.display_name,
        request.precision,
        request.prune,
        request.fix_clip,
        request.custom_name.as_deref(),
    );
    tracker.set_status(&format!("Saving {base_name}..."));
    let written = save_state_dict(&output, dest_dir, &base_name, &request.formats)?;

    Ok(ConvertOutcome {
        written,
        repair,
        input_keys,
        output_keys: output.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_base_name_derivation() {
        assert_eq!(
            output_base_name("sd-v1-5", Precision::Fp16, PruneMode::Disabled, false, None),
            "sd-v1-5-fp16"
        );
        assert_eq!(
            output_base_name("sd-v1-5", Precision::Fp16, PruneMode::NoEma, false, None),
            "sd-v1-5-fp16-no-ema"
        );
        assert_eq!(
            output_base_name("sd-v1-5", Precision::Bf16, PruneMode::EmaOnly, true, None),
            "sd-v1-5-bf16-ema-only-clip-fix"
        );
        assert_eq!(
            output_base_name("sd-v1-5", Precision::Full, PruneMode::Disabled, true, None),
            "sd-v1-5-full-clip-fix"
        );
    }

    #[test]
    fn test_output_base_name_custom_override() {
        assert_eq!(
            output_base_name(
                "sd-v1-5",
                Precision::Fp16,
                PruneMode::NoEma,
                true,
                Some("my-model")
            ),
            "my-model"
        );
        // An empty custom name does not override.
        assert_eq!(
            output_base_name("sd-v1-5", Precision::Fp16, PruneMode::Disabled, false, Some("")),
            "sd-v1-5-fp16"
        );
    }
}
