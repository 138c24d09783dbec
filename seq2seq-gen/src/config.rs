//! Model hyperparameters and the closed sets of architecture names.
//!
//! Hyperparameters come from a JSON file in the format written next to
//! pretrained checkpoints. Keys that are absent fall back to the defaults
//! below; unknown keys (dropout rates, optimiser settings) are ignored.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Source/target embedding composition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum EmbeddingKind {
    Word,
    WordPos,
    WordPosSeg,
    WordSinusoidalpos,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum EncoderKind {
    Transformer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum DecoderKind {
    Transformer,
}

/// Training target the checkpoint was produced with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum TargetKind {
    #[serde(rename = "seq2seq")]
    #[value(name = "seq2seq")]
    Seq2seq,
    #[serde(rename = "t5")]
    #[value(name = "t5")]
    T5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerNormPositioning {
    Pre,
    Post,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerNormKind {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "t5")]
    T5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedForwardKind {
    Dense,
    Gated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Gelu,
    GeluFast,
    Relu,
    Silu,
}

/// Configuration for the encoder-decoder model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParams {
    /// Embedding dimension.
    pub emb_size: usize,
    /// Hidden dimension; must equal `emb_size`.
    pub hidden_size: usize,
    /// Inner dimension of the feed-forward network.
    pub feedforward_size: usize,
    /// Number of attention heads.
    pub heads_num: usize,
    /// Number of encoder layers.
    pub layers_num: usize,
    /// Number of decoder layers; `layers_num` when absent.
    pub decoder_layers_num: Option<usize>,
    /// Number of learned positions.
    pub max_seq_length: usize,
    pub layernorm_positioning: LayerNormPositioning,
    pub layernorm: LayerNormKind,
    pub feed_forward: FeedForwardKind,
    pub hidden_act: Activation,
    pub relative_position_embedding: bool,
    pub relative_attention_buckets_num: usize,
    pub remove_embedding_layernorm: bool,
    pub remove_transformer_bias: bool,
    pub remove_attention_scale: bool,
    pub tie_weights: bool,
    pub has_lmtarget_bias: bool,
    pub share_relative_position_embedding: bool,
    pub embedding: EmbeddingKind,
    pub tgt_embedding: EmbeddingKind,
    pub encoder: EncoderKind,
    pub decoder: DecoderKind,
    pub target: TargetKind,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            emb_size: 768,
            hidden_size: 768,
            feedforward_size: 3072,
            heads_num: 12,
            layers_num: 12,
            decoder_layers_num: None,
            max_seq_length: 512,
            layernorm_positioning: LayerNormPositioning::Post,
            layernorm: LayerNormKind::Normal,
            feed_forward: FeedForwardKind::Dense,
            hidden_act: Activation::Gelu,
            relative_position_embedding: false,
            relative_attention_buckets_num: 32,
            remove_embedding_layernorm: false,
            remove_transformer_bias: false,
            remove_attention_scale: false,
            tie_weights: false,
            has_lmtarget_bias: false,
            share_relative_position_embedding: false,
            embedding: EmbeddingKind::WordPosSeg,
            tgt_embedding: EmbeddingKind::Word,
            encoder: EncoderKind::Transformer,
            decoder: DecoderKind::Transformer,
            target: TargetKind::T5,
        }
    }
}

impl HyperParams {
    /// Read hyperparameters from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let params: Self = serde_json::from_reader(reader)?;
        params.validate()?;
        Ok(params)
    }

    pub fn decoder_layers(&self) -> usize {
        self.decoder_layers_num.unwrap_or(self.layers_num)
    }

    /// Reject combinations the model cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.emb_size != self.hidden_size {
            return Err(Error::Config(format!(
                "emb_size ({}) must equal hidden_size ({})",
                self.emb_size, self.hidden_size
            )));
        }
        if self.heads_num == 0 || self.hidden_size % self.heads_num != 0 {
            return Err(Error::Config(format!(
                "hidden_size ({}) is not divisible by heads_num ({})",
                self.hidden_size, self.heads_num
            )));
        }
        if self.relative_position_embedding && self.relative_attention_buckets_num < 2 {
            return Err(Error::Config(
                "relative_attention_buckets_num must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Architecture switches accepted on the command line. Values given here
/// take precedence over the hyperparameter file.
#[derive(Args, Clone, Debug, Default)]
#[command(rename_all = "snake_case")]
pub struct ModelOverrides {
    /// Source embedding type [config default: word_pos_seg].
    #[arg(long, value_enum)]
    pub embedding: Option<EmbeddingKind>,

    /// Target embedding type [config default: word].
    #[arg(long, value_enum)]
    pub tgt_embedding: Option<EmbeddingKind>,

    /// Encoder type.
    #[arg(long, value_enum)]
    pub encoder: Option<EncoderKind>,

    /// Decoder type.
    #[arg(long, value_enum)]
    pub decoder: Option<DecoderKind>,

    /// The training target of the pretrained model [config default: t5].
    #[arg(long, value_enum)]
    pub target: Option<TargetKind>,

    /// Tie the word embedding and softmax weights.
    #[arg(long)]
    pub tie_weights: bool,

    /// Add bias on the output layer of the target.
    #[arg(long)]
    pub has_lmtarget_bias: bool,

    /// Let the decoder reuse the encoder's relative position embedding.
    #[arg(long)]
    pub share_relative_position_embedding: bool,
}

impl ModelOverrides {
    pub fn apply(&self, params: &mut HyperParams) {
        if let Some(kind) = self.embedding {
            params.embedding = kind;
        }
        if let Some(kind) = self.tgt_embedding {
            params.tgt_embedding = kind;
        }
        if let Some(kind) = self.encoder {
            params.encoder = kind;
        }
        if let Some(kind) = self.decoder {
            params.decoder = kind;
        }
        if let Some(kind) = self.target {
            params.target = kind;
        }
        params.tie_weights |= self.tie_weights;
        params.has_lmtarget_bias |= self.has_lmtarget_bias;
        params.share_relative_position_embedding |= self.share_relative_position_embedding;
    }
}
