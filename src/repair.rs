//! In-place repair of known checkpoint corruptions.
//!
//! Two independent issues are handled:
//!
//! - text-encoder keys written without the `text_model` path segment by some
//!   community exports (renamed unconditionally)
//! - a CLIP position-id tensor with the wrong integer width or wrong
//!   contents (each fix individually flag-gated)

use candle_core::{DType, Device, Result, Tensor};
use tracing::info;

use crate::state_dict::{StateDict, Weight};

/// Broken text-encoder prefixes and their corrected forms.
const BROKEN_CLIP_PREFIXES: [(&str, &str); 3] = [
    (
        "cond_stage_model.transformer.embeddings.",
        "cond_stage_model.transformer.text_model.embeddings.",
    ),
    (
        "cond_stage_model.transformer.encoder.",
        "cond_stage_model.transformer.text_model.encoder.",
    ),
    (
        "cond_stage_model.transformer.final_layer_norm.",
        "cond_stage_model.transformer.text_model.final_layer_norm.",
    ),
];

/// The CLIP text-model positional-id tensor.
pub const POSITION_IDS_KEY: &str =
    "cond_stage_model.transformer.text_model.embeddings.position_ids";

/// Length of the canonical position-id sequence, fixed by the architecture.
const POSITION_IDS_LEN: usize = 77;

/// Outcome of the position-id content check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ClipFix {
    /// Check not requested, or the position-id key is absent.
    #[default]
    NotChecked,
    /// Every index already matched the canonical sequence.
    Ok,
    /// Tensor replaced; lists the indices that were wrong.
    Fixed(Vec<usize>),
}

/// What [`fix_state_dict`] changed.
#[derive(Debug, Clone, Default)]
pub struct RepairReport {
    /// `(old, new)` key renames applied by the prefix repair.
    pub renamed: Vec<(String, String)>,
    pub position_ids_forced: bool,
    pub clip_fix: ClipFix,
}

/// Repair a weight mapping in place.
///
/// Key-prefix repair always runs; the position-id fixes are gated by
/// `force_position_ids` (integer width) and `fix_clip` (contents). A missing
/// position-id key is silently skippable, never an error.
pub fn fix_state_dict(
    state_dict: &mut StateDict,
    fix_clip: bool,
    force_position_ids: bool,
) -> Result<RepairReport> {
    let mut report = RepairReport {
        renamed: rename_broken_keys(state_dict),
        ..RepairReport::default()
    };

    if force_position_ids {
        let current = state_dict
            .get(POSITION_IDS_KEY)
            .and_then(Weight::as_tensor)
            .cloned();
        if let Some(t) = current {
            let forced = t.to_dtype(DType::I64)?;
            state_dict.insert(POSITION_IDS_KEY.to_string(), Weight::Tensor(forced));
            report.position_ids_forced = true;
        }
    }

    if fix_clip {
        report.clip_fix = repair_position_ids(state_dict)?;
    }

    Ok(report)
}

fn rename_broken_keys(state_dict: &mut StateDict) -> Vec<(String, String)> {
    let keys: Vec<String> = state_dict.keys().cloned().collect();
    let mut renamed = Vec::new();

    for key in keys {
        for (broken, fixed) in BROKEN_CLIP_PREFIXES {
            if key.starts_with(broken) {
                let new_key = key.replacen(broken, fixed, 1);
                if let Some(value) = state_dict.remove(&key) {
                    state_dict.insert(new_key.clone(), value);
                    info!("fixed broken text-encoder key {key}");
                    renamed.push((key, new_key));
                }
                break;
            }
        }
    }

    renamed
}

fn repair_position_ids(state_dict: &mut StateDict) -> Result<ClipFix> {
    let Some(Weight::Tensor(current)) = state_dict.get(POSITION_IDS_KEY) else {
        return Ok(ClipFix::NotChecked);
    };

    // Compare on an i64 copy; the stored tensor keeps its dtype unless the
    // contents are actually wrong.
    let now = current
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1::<i64>()?;
    let broken: Vec<usize> = if now.len() == POSITION_IDS_LEN {
        (0..POSITION_IDS_LEN)
            .filter(|&i| now[i] != i as i64)
            .collect()
    } else {
        // Wrong element count: the whole sequence is unusable.
        (0..POSITION_IDS_LEN).collect()
    };

    if broken.is_empty() {
        info!("clip position ids are fine, skip fixing");
        return Ok(ClipFix::Ok);
    }

    let canonical = Tensor::arange(0i64, POSITION_IDS_LEN as i64, &Device::Cpu)?
        .reshape((1, POSITION_IDS_LEN))?;
    state_dict.insert(POSITION_IDS_KEY.to_string(), Weight::Tensor(canonical));
    info!("fixed broken clip position ids at {broken:?}");
    Ok(ClipFix::Fixed(broken))
}
