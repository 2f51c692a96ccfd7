//! Key classification and EMA shadow-key naming.
//!
//! Both are pure string functions so the pruning logic can be tested without
//! real tensors.

/// Model subsystem a parameter key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightClass {
    Unet,
    Vae,
    Clip,
    Other,
}

/// Substring that marks a key as an EMA shadow entry.
pub const EMA_PREFIX: &str = "model_ema.";

/// EMA bookkeeping entries that survive `ema-only` pruning even though they
/// have no primary counterpart.
pub const EMA_KEEP_KEYS: [&str; 2] = ["model_ema.num_updates", "model_ema.decay"];

/// Classify a parameter key by its subsystem prefix.
///
/// Total: every key maps to exactly one class, `Other` being the default.
pub fn classify_key(key: &str) -> WeightClass {
    if key.starts_with("model.diffusion_model") {
        WeightClass::Unet
    } else if key.starts_with("first_stage_model") {
        WeightClass::Vae
    } else if key.starts_with("cond_stage_model") {
        WeightClass::Clip
    } else {
        WeightClass::Other
    }
}

/// Derive the EMA shadow-key name for a primary weight key.
///
/// The shadow naming scheme strips the 6-character `model.` prefix and joins
/// the remaining path segments without separators, so
/// `model.diffusion_model.out.2.weight` shadows as
/// `model_ema.diffusion_modelout2weight`.
///
/// Returns `None` when the key is too short to carry the prefix or byte 6
/// falls inside a multi-byte character; callers treat that as "no shadow
/// exists" and keep going.
pub fn ema_shadow_key(key: &str) -> Option<String> {
    let rest = key.get(6..)?;
    Some(format!("{EMA_PREFIX}{}", rest.replace('.', "")))
}
