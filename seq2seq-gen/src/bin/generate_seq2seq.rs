//! Generate a target sentence for the first line of a file.
//!
//! The model is rebuilt from its hyperparameters, filled from a checkpoint
//! and then sampled token by token for a fixed target length.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seq2seq_gen::checkpoint;
use seq2seq_gen::config::{HyperParams, ModelOverrides};
use seq2seq_gen::generate::{read_source_line, write_prediction, Generator};
use seq2seq_gen::model::GenerateSeq2seq;
use seq2seq_gen::sampling::SamplingConfig;
use seq2seq_gen::tokenizer::{TokenizerKind, TokenizerPair};

#[derive(Parser, Debug)]
#[command(author, version, about, rename_all = "snake_case")]
struct Args {
    /// Path of the model checkpoint.
    #[arg(long)]
    load_model_path: PathBuf,

    /// Path of the source vocabulary file.
    #[arg(long)]
    vocab_path: PathBuf,

    /// Path of the target vocabulary file, used with the seq2seq target.
    #[arg(long)]
    tgt_vocab_path: Option<PathBuf>,

    /// Path of the input file; only its first line is used.
    #[arg(long)]
    test_path: PathBuf,

    /// Path of the output file.
    #[arg(long)]
    prediction_path: PathBuf,

    /// Path of the hyperparameter JSON file.
    #[arg(long)]
    config_path: Option<PathBuf>,

    /// Source tokenizer.
    #[arg(long, value_enum, default_value = "bert")]
    tokenizer: TokenizerKind,

    /// Target tokenizer, used with the seq2seq target.
    #[arg(long, value_enum, default_value = "bert")]
    tgt_tokenizer: TokenizerKind,

    /// Maximum source sequence length.
    #[arg(long, default_value_t = 128)]
    seq_length: usize,

    /// Target sequence length, including the start token.
    #[arg(long, default_value_t = 128)]
    tgt_seq_length: usize,

    /// Values of 0 or below disable top-k filtering.
    #[arg(long, default_value_t = 70, allow_negative_numbers = true)]
    top_k: i64,

    #[arg(long, default_value_t = 0.0)]
    top_p: f32,

    #[arg(long, default_value_t = 1.0)]
    temperature: f32,

    /// Seed for sampling; entropy when absent.
    #[arg(long)]
    seed: Option<u64>,

    #[command(flatten)]
    model: ModelOverrides,
}

impl Args {
    fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            top_k: self.top_k.max(0) as usize,
            top_p: self.top_p,
            temperature: self.temperature,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "seq2seq_gen=info,generate_seq2seq=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut params = match &args.config_path {
        Some(path) => HyperParams::load(path)
            .with_context(|| format!("failed to read hyperparameters from {:?}", path))?,
        None => HyperParams::default(),
    };
    args.model.apply(&mut params);
    params.validate()?;
    info!("hyperparameters: {:?}", params);

    let tokenizers = TokenizerPair::load(
        params.target,
        args.tokenizer,
        &args.vocab_path,
        args.tgt_tokenizer,
        args.tgt_vocab_path.as_deref(),
    )
    .context("failed to build tokenizers")?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut model = GenerateSeq2seq::new(
        params,
        tokenizers.source().vocab().len(),
        tokenizers.target().vocab().len(),
        &mut rng,
    );
    checkpoint::load_model(&mut model, &args.load_model_path)
        .with_context(|| format!("failed to load checkpoint {:?}", args.load_model_path))?;
    info!("loaded model with {} parameters", model.num_params()?);

    let line = read_source_line(&args.test_path)
        .with_context(|| format!("failed to read {:?}", args.test_path))?;

    let generator = Generator::new(
        &model,
        tokenizers.source(),
        tokenizers.target(),
        args.seq_length,
        args.tgt_seq_length,
        args.sampling(),
    );
    let generation = generator.generate(&line, &mut rng)?;

    write_prediction(&args.prediction_path, &line, &generation)
        .with_context(|| format!("failed to write {:?}", args.prediction_path))?;
    info!("wrote {} target tokens to {:?}", generation.tokens.len(), args.prediction_path);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq2seq_gen::config::{EmbeddingKind, TargetKind};

    const REQUIRED: [&str; 9] = [
        "generate_seq2seq",
        "--load_model_path",
        "model.s2sg",
        "--vocab_path",
        "vocab.txt",
        "--test_path",
        "test.txt",
        "--prediction_path",
        "pred.txt",
    ];

    #[test]
    fn defaults_match_reference_settings() {
        let args = Args::try_parse_from(REQUIRED).unwrap();
        assert_eq!(args.sampling(), SamplingConfig::default());
        assert_eq!(args.top_k, 70);
        assert_eq!(args.top_p, 0.0);
        assert_eq!(args.temperature, 1.0);
        assert_eq!(args.seq_length, 128);
        assert_eq!(args.tgt_seq_length, 128);
        assert_eq!(args.tokenizer, TokenizerKind::Bert);
        assert_eq!(args.tgt_tokenizer, TokenizerKind::Bert);
        assert!(args.tgt_vocab_path.is_none());
        assert!(args.seed.is_none());
    }

    #[test]
    fn snake_case_flags_override_config_file() {
        let mut argv = REQUIRED.to_vec();
        argv.extend([
            "--tgt_embedding",
            "word_sinusoidalpos",
            "--tie_weights",
            "--target",
            "seq2seq",
            "--tgt_seq_length",
            "5",
            "--top_p",
            "0.9",
        ]);
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.tgt_seq_length, 5);
        assert_eq!(args.sampling().top_p, 0.9);

        let mut params: HyperParams =
            serde_json::from_str(r#"{"tgt_embedding": "word", "target": "t5"}"#).unwrap();
        args.model.apply(&mut params);
        assert_eq!(params.tgt_embedding, EmbeddingKind::WordSinusoidalpos);
        assert_eq!(params.target, TargetKind::Seq2seq);
        assert!(params.tie_weights);
        assert!(!params.has_lmtarget_bias);
    }

    #[test]
    fn negative_top_k_disables_filtering() {
        let mut argv = REQUIRED.to_vec();
        argv.extend(["--top_k", "-1"]);
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.top_k, -1);
        assert_eq!(args.sampling().top_k, 0);
    }

    #[test]
    fn unknown_tokenizer_is_rejected() {
        let mut argv = REQUIRED.to_vec();
        argv.extend(["--tokenizer", "bpe"]);
        assert!(Args::try_parse_from(argv).is_err());
    }
}
