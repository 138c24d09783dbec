//! Encoder-decoder model used for sequence-to-sequence generation.
//!
//! The wrapper composes a source embedding, an encoder and a target (target
//! embedding, decoder and output layer). Architecture pieces are chosen from
//! the closed enums in [`crate::config`].

pub mod embeddings;
pub mod layers;
pub mod target;
pub mod transformer;

use ndarray::{Array3, ArrayView2, ArrayViewMutD, Axis};
use rand::Rng;

use crate::config::{EncoderKind, HyperParams};
use crate::error::Result;
use embeddings::Embedding;
use target::Target;
use transformer::TransformerEncoder;

/// Receives every named parameter of a model in a fixed order.
pub trait ParamVisitor {
    fn visit(&mut self, name: &str, param: ArrayViewMutD<'_, f32>) -> Result<()>;
}

/// Implemented by every component holding weights.
pub trait Parameters {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()>;
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

struct ParamCounter(usize);

impl ParamVisitor for ParamCounter {
    fn visit(&mut self, _name: &str, param: ArrayViewMutD<'_, f32>) -> Result<()> {
        self.0 += param.len();
        Ok(())
    }
}

/// Full encoder-decoder model producing target-vocabulary logits.
pub struct GenerateSeq2seq {
    pub args: HyperParams,
    embedding: Embedding,
    encoder: TransformerEncoder,
    target: Target,
}

impl GenerateSeq2seq {
    /// Build a randomly initialised model; weights are normally replaced by
    /// [`crate::checkpoint::load_model`].
    pub fn new<R: Rng + ?Sized>(args: HyperParams, src_vocab_size: usize, tgt_vocab_size: usize, rng: &mut R) -> Self {
        let embedding = Embedding::new(args.embedding, &args, src_vocab_size, rng);
        let encoder = match args.encoder {
            EncoderKind::Transformer => TransformerEncoder::new(&args, rng),
        };
        let target = Target::new(&args, tgt_vocab_size, rng);
        Self {
            args,
            embedding,
            encoder,
            target,
        }
    }

    /// Total number of scalar weights.
    pub fn num_params(&mut self) -> Result<usize> {
        let mut counter = ParamCounter(0);
        self.visit_params("", &mut counter).map(|_| counter.0)
    }

    /// Logits of shape `[batch, tgt_len, tgt_vocab]`.
    ///
    /// `src` and `seg` must share a shape and all three inputs must have the
    /// same batch size; anything else panics.
    pub fn forward(&self, src: ArrayView2<usize>, seg: ArrayView2<usize>, tgt: ArrayView2<usize>) -> Array3<f32> {
        assert_eq!(src.dim(), seg.dim(), "source and segment shapes differ");
        assert_eq!(src.nrows(), tgt.nrows(), "source and target batch sizes differ");

        let shared_pos_emb = if self.args.share_relative_position_embedding {
            self.encoder.relative_pos_emb()
        } else {
            None
        };

        let (batch, tgt_len) = tgt.dim();
        let mut logits = Array3::<f32>::zeros((batch, tgt_len, self.target.vocab_size()));
        for (b, ((src, seg), tgt)) in src.outer_iter().zip(seg.outer_iter()).zip(tgt.outer_iter()).enumerate() {
            let src = src.to_vec();
            let seg = seg.to_vec();
            let emb = self.embedding.forward(&src, Some(&seg));
            let memory_bank = self.encoder.forward(&emb, &seg);
            let out = self.target.forward(&memory_bank, &src, &tgt.to_vec(), shared_pos_emb);
            logits.index_axis_mut(Axis(0), b).assign(&out);
        }
        logits
    }
}

impl Parameters for GenerateSeq2seq {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        self.embedding.visit_params(&join(prefix, "embedding"), visitor)?;
        self.encoder.visit_params(&join(prefix, "encoder"), visitor)?;
        self.target.visit_params(&join(prefix, "target"), visitor)
    }
}
