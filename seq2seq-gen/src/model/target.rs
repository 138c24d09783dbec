use ndarray::{Array1, Array2, Axis};
use rand::Rng;

use super::embeddings::Embedding;
use super::layers::{random_matrix, RelativePositionEmbedding};
use super::transformer::TransformerDecoder;
use super::{join, ParamVisitor, Parameters};
use crate::config::{DecoderKind, HyperParams, TargetKind};
use crate::error::Result;

/// Projection from decoder hidden states to vocabulary logits.
struct OutputLayer {
    weight: Option<Array2<f32>>, // vocab x hidden, None when tied
    bias: Option<Array1<f32>>,
}

/// Target side of the model: target embedding, decoder and output head.
pub struct Target {
    kind: TargetKind,
    pub embedding: Embedding,
    pub decoder: TransformerDecoder,
    output_layer: OutputLayer,
    hidden_size: usize,
}

impl Target {
    pub fn new<R: Rng + ?Sized>(args: &HyperParams, vocab_size: usize, rng: &mut R) -> Self {
        let embedding = Embedding::new(args.tgt_embedding, args, vocab_size, rng);
        let decoder = match args.decoder {
            DecoderKind::Transformer => {
                TransformerDecoder::new(args, args.share_relative_position_embedding, rng)
            }
        };
        let output_layer = OutputLayer {
            weight: (!args.tie_weights).then(|| random_matrix(vocab_size, args.hidden_size, rng)),
            bias: args.has_lmtarget_bias.then(|| Array1::zeros(vocab_size)),
        };
        Self {
            kind: args.target,
            embedding,
            decoder,
            output_layer,
            hidden_size: args.hidden_size,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.word_weight().nrows()
    }

    /// Map decoder hidden states to logits `[tgt_len, vocab]`.
    pub fn output(&self, hidden: &Array2<f32>) -> Array2<f32> {
        let mut logits = match &self.output_layer.weight {
            Some(weight) => hidden.dot(&weight.t()),
            None => {
                let word = self.embedding.word_weight();
                match self.kind {
                    // T5 rescales before projecting with the tied embedding.
                    TargetKind::T5 => (hidden * (self.hidden_size as f32).powf(-0.5)).dot(&word.t()),
                    TargetKind::Seq2seq => hidden.dot(&word.t()),
                }
            }
        };
        if let Some(b) = &self.output_layer.bias {
            logits += &b.view().insert_axis(Axis(0));
        }
        logits
    }

    /// Embed and decode `tgt`, returning logits for every target position.
    pub fn forward(
        &self,
        memory_bank: &Array2<f32>,
        src: &[usize],
        tgt: &[usize],
        shared_pos_emb: Option<&RelativePositionEmbedding>,
    ) -> Array2<f32> {
        let emb = self.embedding.forward(tgt, None);
        let hidden = self.decoder.forward(memory_bank, &emb, src, shared_pos_emb);
        self.output(&hidden)
    }
}

impl Parameters for Target {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        self.embedding.visit_params(&join(prefix, "embedding"), visitor)?;
        self.decoder.visit_params(&join(prefix, "decoder"), visitor)?;
        if let Some(weight) = &mut self.output_layer.weight {
            visitor.visit(&join(prefix, "output_layer.weight"), weight.view_mut().into_dyn())?;
        }
        if let Some(bias) = &mut self.output_layer.bias {
            visitor.visit(&join(prefix, "output_layer.bias"), bias.view_mut().into_dyn())?;
        }
        Ok(())
    }
}
