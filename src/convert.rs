//! The selection and conversion pass.
//!
//! Walks the (possibly repaired) input mapping once, deciding per key whether
//! it survives pruning, which value stands in for it (raw or EMA shadow) and
//! what the subsystem directive does to that value. The input is never
//! mutated; a fresh output mapping is built.

use candle_core::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::classify::{EMA_KEEP_KEYS, EMA_PREFIX, WeightClass, classify_key, ema_shadow_key};
use crate::precision::Precision;
use crate::state_dict::{StateDict, Weight};

/// Policy controlling which of the primary / EMA-shadow weight copies
/// survive into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PruneMode {
    Disabled,
    NoEma,
    EmaOnly,
}

/// Per-subsystem conversion directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertAction {
    Convert,
    Copy,
    Delete,
}

/// Directive lookup table keyed by [`WeightClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsystemActions {
    pub unet: ConvertAction,
    pub clip: ConvertAction,
    pub vae: ConvertAction,
    pub other: ConvertAction,
}

impl Default for SubsystemActions {
    fn default() -> Self {
        Self::uniform(ConvertAction::Convert)
    }
}

impl SubsystemActions {
    pub fn uniform(action: ConvertAction) -> Self {
        Self {
            unet: action,
            clip: action,
            vae: action,
            other: action,
        }
    }

    pub fn for_class(&self, class: WeightClass) -> ConvertAction {
        match class {
            WeightClass::Unet => self.unet,
            WeightClass::Clip => self.clip,
            WeightClass::Vae => self.vae,
            WeightClass::Other => self.other,
        }
    }
}

/// Settings for one conversion pass.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub precision: Precision,
    pub prune: PruneMode,
    pub actions: SubsystemActions,
}

/// Produce the output weight mapping for `input` under `opts`.
pub fn convert_state_dict(input: &StateDict, opts: &ConvertOptions) -> Result<StateDict> {
    let mut output = StateDict::new();

    match opts.prune {
        PruneMode::Disabled => {
            for (key, value) in input {
                emit(&mut output, key, value, opts)?;
            }
        }
        PruneMode::NoEma => {
            for (key, value) in input {
                if !key.contains(EMA_PREFIX) {
                    emit(&mut output, key, value, opts)?;
                }
            }
        }
        PruneMode::EmaOnly => {
            for (key, value) in input {
                // A key whose shadow cannot be derived falls through to the
                // plain-inclusion check, same as a key with no shadow.
                let shadow = ema_shadow_key(key).and_then(|k| input.get(&k));
                if let Some(shadow) = shadow {
                    emit(&mut output, key, shadow, opts)?;
                } else if !key.starts_with(EMA_PREFIX) || EMA_KEEP_KEYS.contains(&key.as_str()) {
                    emit(&mut output, key, value, opts)?;
                } else {
                    debug!("dropped unmatched ema key {key}");
                }
            }
        }
    }

    info!(
        "converted {} of {} keys ({} precision, {:?} pruning)",
        output.len(),
        input.len(),
        opts.precision,
        opts.prune,
    );
    Ok(output)
}

fn emit(output: &mut StateDict, key: &str, value: &Weight, opts: &ConvertOptions) -> Result<()> {
    match opts.actions.for_class(classify_key(key)) {
        ConvertAction::Delete => {}
        ConvertAction::Copy => {
            output.insert(key.to_string(), value.clone());
        }
        ConvertAction::Convert => {
            let converted = match value {
                Weight::Tensor(t) => Weight::Tensor(opts.precision.cast(t)?),
                // Scalar payloads are never cast; convert degrades to copy.
                scalar => scalar.clone(),
            };
            output.insert(key.to_string(), converted);
        }
    }
    Ok(())
}

impl fmt::Display for PruneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PruneMode::Disabled => "disabled",
            PruneMode::NoEma => "no-ema",
            PruneMode::EmaOnly => "ema-only",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PruneMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(PruneMode::Disabled),
            "no-ema" => Ok(PruneMode::NoEma),
            "ema-only" => Ok(PruneMode::EmaOnly),
            _ => Err(format!(
                "unknown pruning mode: {s} (expected disabled, no-ema or ema-only)"
            )),
        }
    }
}

impl fmt::Display for ConvertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConvertAction::Convert => "convert",
            ConvertAction::Copy => "copy",
            ConvertAction::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ConvertAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "convert" => Ok(ConvertAction::Convert),
            "copy" => Ok(ConvertAction::Copy),
            "delete" => Ok(ConvertAction::Delete),
            _ => Err(format!(
                "unknown action: {s} (expected convert, copy or delete)"
            )),
        }
    }
}
