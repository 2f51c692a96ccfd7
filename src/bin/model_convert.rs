//! Checkpoint conversion CLI.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin model-convert -- \
//!     --model sd-v1-5 \
//!     --ckpt-dir ./models \
//!     --precision fp16 --prune no-ema \
//!     --format safetensors --format ckpt
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

use model_converter::convert::{ConvertAction, PruneMode, SubsystemActions};
use model_converter::pipeline::{self, ConvertRequest, DirectoryRegistry, LogTracker};
use model_converter::precision::Precision;
use model_converter::save::OutputFormat;

/// Command line arguments for checkpoint conversion
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Convert Stable Diffusion checkpoints between precisions and prune EMA weights"
)]
struct Args {
    /// Model to convert: a name known to the registry or a checkpoint path
    #[arg(short, long, default_value = "")]
    model: String,

    /// Directory containing checkpoints (registry root)
    #[arg(long, default_value = ".")]
    ckpt_dir: PathBuf,

    /// Output directory (defaults to --ckpt-dir)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Output container format; repeat for several
    #[arg(long = "format", default_value = "ckpt", value_parser = OutputFormat::from_str)]
    formats: Vec<OutputFormat>,

    /// Output precision
    #[arg(long, default_value = "fp32", value_parser = Precision::from_str)]
    precision: Precision,

    /// Pruning method
    #[arg(long, default_value = "disabled", value_parser = PruneMode::from_str)]
    prune: PruneMode,

    /// Directive for unet weights
    #[arg(long, default_value = "convert", value_parser = ConvertAction::from_str)]
    unet: ConvertAction,

    /// Directive for text-encoder weights
    #[arg(long, default_value = "convert", value_parser = ConvertAction::from_str)]
    clip: ConvertAction,

    /// Directive for vae weights
    #[arg(long, default_value = "convert", value_parser = ConvertAction::from_str)]
    vae: ConvertAction,

    /// Directive for all remaining weights
    #[arg(long, default_value = "convert", value_parser = ConvertAction::from_str)]
    other: ConvertAction,

    /// Custom output name (optional)
    #[arg(long)]
    name: Option<String>,

    /// Force CLIP position_id to int64 before convert
    #[arg(long)]
    force_position_ids: bool,

    /// Replace broken CLIP position ids with the canonical sequence
    #[arg(long)]
    fix_clip: bool,

    /// Load the whole conversion request from a JSON file instead of flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// List models visible to the registry and exit
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("model_converter=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let registry = DirectoryRegistry::new(&args.ckpt_dir);

    if args.list {
        for model in registry.list()? {
            println!("{}  ({})", model.display_name, model.filename.display());
        }
        return Ok(());
    }

    let request = match &args.config {
        Some(path) => ConvertRequest::from_json_file(path)?,
        None => ConvertRequest {
            model: args.model.clone(),
            formats: args.formats.clone(),
            precision: args.precision,
            prune: args.prune,
            actions: SubsystemActions {
                unet: args.unet,
                clip: args.clip,
                vae: args.vae,
                other: args.other,
            },
            custom_name: args.name.clone(),
            force_position_ids: args.force_position_ids,
            fix_clip: args.fix_clip,
        },
    };

    let dest_dir = args.out_dir.clone().unwrap_or_else(|| args.ckpt_dir.clone());
    let outcome = pipeline::run(&request, &registry, &dest_dir, &mut LogTracker)?;
    println!("{}", outcome.summary());
    Ok(())
}
