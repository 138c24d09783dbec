use ndarray::{s, Array2};
use rand::Rng;

use super::layers::{random_matrix, LayerNorm};
use super::{join, ParamVisitor, Parameters};
use crate::config::{EmbeddingKind, HyperParams};
use crate::error::Result;

/// Number of segment labels: padding, first sentence, second sentence.
const SEGMENT_VOCAB_SIZE: usize = 3;

/// Token embedding composed of word, position and segment tables.
pub struct Embedding {
    word: Array2<f32>, // vocab_size x emb_size
    position: Option<Array2<f32>>,
    segment: Option<Array2<f32>>,
    sinusoid: Option<Array2<f32>>,
    layer_norm: Option<LayerNorm>,
    max_seq_length: usize,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(
        kind: EmbeddingKind,
        args: &HyperParams,
        vocab_size: usize,
        rng: &mut R,
    ) -> Self {
        let emb_size = args.emb_size;
        let word = random_matrix(vocab_size, emb_size, rng);
        let position = matches!(kind, EmbeddingKind::WordPos | EmbeddingKind::WordPosSeg)
            .then(|| random_matrix(args.max_seq_length, emb_size, rng));
        let segment = (kind == EmbeddingKind::WordPosSeg)
            .then(|| random_matrix(SEGMENT_VOCAB_SIZE, emb_size, rng));
        let sinusoid = (kind == EmbeddingKind::WordSinusoidalpos)
            .then(|| sinusoid_table(args.max_seq_length, emb_size));
        let layer_norm =
            (!args.remove_embedding_layernorm).then(|| LayerNorm::new(args.layernorm, emb_size));
        Self {
            word,
            position,
            segment,
            sinusoid,
            layer_norm,
            max_seq_length: args.max_seq_length,
        }
    }

    /// Word table, shared with the output layer when weights are tied.
    pub fn word_weight(&self) -> &Array2<f32> {
        &self.word
    }

    /// Embed one sequence. Missing segment labels are treated as label 0.
    pub fn forward(&self, tokens: &[usize], seg: Option<&[usize]>) -> Array2<f32> {
        let len = tokens.len();
        assert!(
            (self.position.is_none() && self.sinusoid.is_none()) || len <= self.max_seq_length,
            "sequence of {} tokens exceeds max_seq_length {}",
            len,
            self.max_seq_length
        );

        let mut out = Array2::<f32>::zeros((len, self.word.ncols()));
        for (i, &tok) in tokens.iter().enumerate() {
            out.row_mut(i).assign(&self.word.row(tok));
        }
        if let Some(sinusoid) = &self.sinusoid {
            out *= (self.word.ncols() as f32).sqrt();
            out += &sinusoid.slice(s![..len, ..]);
        }
        if let Some(position) = &self.position {
            out += &position.slice(s![..len, ..]);
        }
        if let Some(segment) = &self.segment {
            for i in 0..len {
                let label = seg.map_or(0, |seg| seg[i]);
                let mut row = out.row_mut(i);
                row += &segment.row(label);
            }
        }
        match &self.layer_norm {
            Some(ln) => ln.forward(&out),
            None => out,
        }
    }
}

impl Parameters for Embedding {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        visitor.visit(&join(prefix, "word.weight"), self.word.view_mut().into_dyn())?;
        if let Some(position) = &mut self.position {
            visitor.visit(&join(prefix, "position.weight"), position.view_mut().into_dyn())?;
        }
        if let Some(segment) = &mut self.segment {
            visitor.visit(&join(prefix, "segment.weight"), segment.view_mut().into_dyn())?;
        }
        if let Some(ln) = &mut self.layer_norm {
            ln.visit_params(&join(prefix, "layer_norm"), visitor)?;
        }
        Ok(())
    }
}

fn sinusoid_table(max_len: usize, dim: usize) -> Array2<f32> {
    Array2::from_shape_fn((max_len, dim), |(pos, i)| {
        let exponent = (2 * (i / 2)) as f32 / dim as f32;
        let angle = pos as f32 / 10000f32.powf(exponent);
        if i % 2 == 0 {
            angle.sin()
        } else {
            angle.cos()
        }
    })
}
