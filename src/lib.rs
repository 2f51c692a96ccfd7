//! Checkpoint precision conversion and EMA pruning for Stable Diffusion
//! models.
//!
//! The pipeline loads a checkpoint (safetensors or torch archive), repairs
//! known key corruptions, selects and precision-casts weights per subsystem,
//! and writes the result to one or more container formats.

pub mod ckpt;
pub mod classify;
pub mod convert;
pub mod loader;
pub mod pipeline;
pub mod precision;
pub mod repair;
pub mod save;
pub mod state_dict;

pub use classify::{WeightClass, classify_key, ema_shadow_key};
pub use convert::{
    ConvertAction, ConvertOptions, PruneMode, SubsystemActions, convert_state_dict,
};
pub use loader::{LoadError, load_checkpoint};
pub use pipeline::{
    ConvertError, ConvertOutcome, ConvertRequest, DirectoryRegistry, JobTracker, LogTracker,
    ModelInfo, ModelRegistry, NullTracker, run,
};
pub use precision::Precision;
pub use repair::{ClipFix, RepairReport, fix_state_dict};
pub use save::{OutputFormat, SaveError, save_state_dict};
pub use state_dict::{StateDict, Weight};
