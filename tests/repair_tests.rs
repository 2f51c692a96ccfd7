//! Tests for in-place checkpoint repair
//!
//! Covers the broken text-encoder key renames and both position-id fixes.

use candle_core::{DType, Device, Result, Tensor};
use model_converter::repair::{ClipFix, POSITION_IDS_KEY, fix_state_dict};
use model_converter::state_dict::{StateDict, Weight};

// =============================================================================
// Helpers
// =============================================================================

fn f32_tensor(data: Vec<f32>, shape: &[usize]) -> Weight {
    Weight::Tensor(Tensor::from_vec(data, shape, &Device::Cpu).unwrap())
}

fn canonical_position_ids() -> Tensor {
    Tensor::arange(0i64, 77, &Device::Cpu)
        .unwrap()
        .reshape((1, 77))
        .unwrap()
}

fn tensor_values(state_dict: &StateDict, key: &str) -> Vec<f64> {
    state_dict[key]
        .as_tensor()
        .unwrap()
        .to_dtype(DType::F64)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f64>()
        .unwrap()
}

// =============================================================================
// Key-prefix repair
// =============================================================================

#[test]
fn test_broken_embeddings_prefix_is_renamed() -> Result<()> {
    let mut sd = StateDict::new();
    sd.insert(
        "cond_stage_model.transformer.embeddings.token_embedding.weight".to_string(),
        f32_tensor(vec![1.0, 2.0], &[2]),
    );
    sd.insert(
        "model.diffusion_model.out.weight".to_string(),
        f32_tensor(vec![3.0], &[1]),
    );

    let report = fix_state_dict(&mut sd, false, false)?;

    assert_eq!(report.renamed.len(), 1);
    assert_eq!(
        report.renamed[0].1,
        "cond_stage_model.transformer.text_model.embeddings.token_embedding.weight"
    );
    // Renamed, not duplicated: key count unchanged, value carried over.
    assert_eq!(sd.len(), 2);
    assert!(
        !sd.contains_key("cond_stage_model.transformer.embeddings.token_embedding.weight")
    );
    assert_eq!(
        tensor_values(
            &sd,
            "cond_stage_model.transformer.text_model.embeddings.token_embedding.weight"
        ),
        vec![1.0, 2.0]
    );
    Ok(())
}

#[test]
fn test_all_three_broken_prefixes_are_renamed() -> Result<()> {
    let mut sd = StateDict::new();
    for key in [
        "cond_stage_model.transformer.embeddings.position_embedding.weight",
        "cond_stage_model.transformer.encoder.layers.0.mlp.fc1.weight",
        "cond_stage_model.transformer.final_layer_norm.weight",
    ] {
        sd.insert(key.to_string(), f32_tensor(vec![0.0], &[1]));
    }

    let report = fix_state_dict(&mut sd, false, false)?;

    assert_eq!(report.renamed.len(), 3);
    for key in [
        "cond_stage_model.transformer.text_model.embeddings.position_embedding.weight",
        "cond_stage_model.transformer.text_model.encoder.layers.0.mlp.fc1.weight",
        "cond_stage_model.transformer.text_model.final_layer_norm.weight",
    ] {
        assert!(sd.contains_key(key), "missing {key}");
    }
    Ok(())
}

#[test]
fn test_correct_keys_are_left_alone() -> Result<()> {
    let mut sd = StateDict::new();
    sd.insert(
        "cond_stage_model.transformer.text_model.encoder.layers.0.mlp.fc1.weight".to_string(),
        f32_tensor(vec![0.5], &[1]),
    );

    let report = fix_state_dict(&mut sd, false, false)?;

    assert!(report.renamed.is_empty());
    assert_eq!(sd.len(), 1);
    Ok(())
}

// =============================================================================
// Position-id integer-width normalization
// =============================================================================

#[test]
fn test_force_position_ids_casts_to_i64() -> Result<()> {
    let data: Vec<f32> = (0..77).map(|i| i as f32).collect();
    let mut sd = StateDict::new();
    sd.insert(POSITION_IDS_KEY.to_string(), f32_tensor(data, &[1, 77]));

    let report = fix_state_dict(&mut sd, false, true)?;

    assert!(report.position_ids_forced);
    let ids = sd[POSITION_IDS_KEY].as_tensor().unwrap();
    assert_eq!(ids.dtype(), DType::I64);
    assert_eq!(ids.dims(), &[1, 77]);
    let values = ids.flatten_all()?.to_vec1::<i64>()?;
    assert_eq!(values, (0..77).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn test_force_position_ids_skips_absent_key() -> Result<()> {
    let mut sd = StateDict::new();
    sd.insert("model.diffusion_model.x".to_string(), f32_tensor(vec![1.0], &[1]));

    let report = fix_state_dict(&mut sd, false, true)?;

    assert!(!report.position_ids_forced);
    Ok(())
}

// =============================================================================
// Position-id content repair
// =============================================================================

#[test]
fn test_fix_clip_reports_noop_on_canonical_ids() -> Result<()> {
    let mut sd = StateDict::new();
    sd.insert(
        POSITION_IDS_KEY.to_string(),
        Weight::Tensor(canonical_position_ids()),
    );

    let report = fix_state_dict(&mut sd, true, false)?;

    assert_eq!(report.clip_fix, ClipFix::Ok);
    Ok(())
}

#[test]
fn test_fix_clip_replaces_broken_index() -> Result<()> {
    let mut data: Vec<i64> = (0..77).collect();
    data[5] = 99;
    let mut sd = StateDict::new();
    sd.insert(
        POSITION_IDS_KEY.to_string(),
        Weight::Tensor(Tensor::from_vec(data, (1, 77), &Device::Cpu)?),
    );

    let report = fix_state_dict(&mut sd, true, false)?;

    assert_eq!(report.clip_fix, ClipFix::Fixed(vec![5]));
    let ids = sd[POSITION_IDS_KEY].as_tensor().unwrap();
    assert_eq!(ids.dtype(), DType::I64);
    let values = ids.flatten_all()?.to_vec1::<i64>()?;
    assert_eq!(values, (0..77).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn test_fix_clip_compares_on_cast_copy_only() -> Result<()> {
    // Values match after the i64 comparison cast, so the stored tensor keeps
    // its original dtype.
    let data: Vec<f32> = (0..77).map(|i| i as f32).collect();
    let mut sd = StateDict::new();
    sd.insert(POSITION_IDS_KEY.to_string(), f32_tensor(data, &[1, 77]));

    let report = fix_state_dict(&mut sd, true, false)?;

    assert_eq!(report.clip_fix, ClipFix::Ok);
    assert_eq!(sd[POSITION_IDS_KEY].dtype(), Some(DType::F32));
    Ok(())
}

#[test]
fn test_fix_clip_replaces_wrong_length_tensor() -> Result<()> {
    let mut sd = StateDict::new();
    sd.insert(
        POSITION_IDS_KEY.to_string(),
        Weight::Tensor(Tensor::from_vec(vec![0i64, 1, 2], (1, 3), &Device::Cpu)?),
    );

    let report = fix_state_dict(&mut sd, true, false)?;

    assert_eq!(report.clip_fix, ClipFix::Fixed((0..77).collect()));
    let ids = sd[POSITION_IDS_KEY].as_tensor().unwrap();
    assert_eq!(ids.dims(), &[1, 77]);
    Ok(())
}

#[test]
fn test_fix_clip_skips_absent_key() -> Result<()> {
    let mut sd = StateDict::new();
    sd.insert("first_stage_model.decoder.w".to_string(), f32_tensor(vec![1.0], &[1]));

    let report = fix_state_dict(&mut sd, true, false)?;

    assert_eq!(report.clip_fix, ClipFix::NotChecked);
    Ok(())
}

#[test]
fn test_repairs_compose_in_one_pass() -> Result<()> {
    let mut data: Vec<f32> = (0..77).map(|i| i as f32).collect();
    data[10] = 0.0;
    let mut sd = StateDict::new();
    sd.insert(POSITION_IDS_KEY.to_string(), f32_tensor(data, &[1, 77]));
    sd.insert(
        "cond_stage_model.transformer.encoder.layers.1.self_attn.q_proj.weight".to_string(),
        f32_tensor(vec![1.0], &[1]),
    );

    let report = fix_state_dict(&mut sd, true, true)?;

    assert_eq!(report.renamed.len(), 1);
    assert!(report.position_ids_forced);
    assert_eq!(report.clip_fix, ClipFix::Fixed(vec![10]));
    Ok(())
}
