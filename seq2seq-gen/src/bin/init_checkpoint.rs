//! Write a randomly initialised checkpoint for a hyperparameter file.
//!
//! Useful for exercising `generate_seq2seq` end to end without trained
//! weights.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seq2seq_gen::checkpoint::Checkpoint;
use seq2seq_gen::config::{HyperParams, ModelOverrides, TargetKind};
use seq2seq_gen::model::GenerateSeq2seq;
use seq2seq_gen::tokenizer::Vocab;

#[derive(Parser, Debug)]
#[command(author, version, about, rename_all = "snake_case")]
struct Args {
    /// Path of the hyperparameter JSON file.
    #[arg(long)]
    config_path: Option<PathBuf>,

    /// Path of the source vocabulary file.
    #[arg(long)]
    vocab_path: PathBuf,

    /// Path of the target vocabulary file, used with the seq2seq target.
    #[arg(long)]
    tgt_vocab_path: Option<PathBuf>,

    /// Output file for the checkpoint.
    #[arg(long, default_value = "model.s2sg")]
    output: PathBuf,

    #[arg(long, default_value_t = 7)]
    seed: u64,

    #[command(flatten)]
    model: ModelOverrides,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "seq2seq_gen=info,init_checkpoint=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut params = match &args.config_path {
        Some(path) => HyperParams::load(path)
            .with_context(|| format!("failed to read hyperparameters from {:?}", path))?,
        None => HyperParams::default(),
    };
    args.model.apply(&mut params);
    params.validate()?;

    let src_vocab = Vocab::load(&args.vocab_path)?.len();
    let tgt_vocab = match (params.target, &args.tgt_vocab_path) {
        (TargetKind::Seq2seq, Some(path)) => Vocab::load(path)?.len(),
        (TargetKind::Seq2seq, None) => anyhow::bail!("--tgt_vocab_path is required with the seq2seq target"),
        (TargetKind::T5, _) => src_vocab,
    };

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut model = GenerateSeq2seq::new(params, src_vocab, tgt_vocab, &mut rng);
    let checkpoint = Checkpoint::from_model(&mut model)?;
    checkpoint
        .save(&args.output)
        .with_context(|| format!("failed to write {:?}", args.output))?;
    info!(
        "saved {} tensors ({} parameters) to {:?}",
        checkpoint.len(),
        model.num_params()?,
        args.output
    );
    Ok(())
}
