//! Transformer encoder and decoder stacks.

use ndarray::{Array2, Array3};
use rand::Rng;

use super::layers::{FeedForward, LayerNorm, MultiHeadedAttention, RelativePositionEmbedding, MASK_VALUE};
use super::{join, ParamVisitor, Parameters};
use crate::config::{HyperParams, LayerNormPositioning};
use crate::error::Result;

fn attention<R: Rng + ?Sized>(args: &HyperParams, rng: &mut R) -> MultiHeadedAttention {
    MultiHeadedAttention::new(
        args.hidden_size,
        args.heads_num,
        !args.remove_transformer_bias,
        !args.remove_attention_scale,
        rng,
    )
}

fn feed_forward<R: Rng + ?Sized>(args: &HyperParams, rng: &mut R) -> FeedForward {
    FeedForward::new(
        args.feed_forward,
        args.hidden_size,
        args.feedforward_size,
        args.hidden_act,
        !args.remove_transformer_bias,
        rng,
    )
}

/// Additive mask letting every query see the keys where `visible` holds.
fn key_mask(query_len: usize, visible: impl Iterator<Item = bool>) -> Array2<f32> {
    let row: Vec<f32> = visible.map(|v| if v { 0.0 } else { MASK_VALUE }).collect();
    Array2::from_shape_fn((query_len, row.len()), |(_, j)| row[j])
}

/// Additive mask hiding future positions.
fn causal_mask(len: usize) -> Array2<f32> {
    Array2::from_shape_fn((len, len), |(i, j)| if j <= i { 0.0 } else { MASK_VALUE })
}

/// Self-attention followed by a feed-forward network.
pub struct TransformerLayer {
    self_attn: MultiHeadedAttention,
    layer_norm_1: LayerNorm,
    feed_forward: FeedForward,
    layer_norm_2: LayerNorm,
    positioning: LayerNormPositioning,
}

impl TransformerLayer {
    pub fn new<R: Rng + ?Sized>(args: &HyperParams, rng: &mut R) -> Self {
        Self {
            self_attn: attention(args, rng),
            layer_norm_1: LayerNorm::new(args.layernorm, args.hidden_size),
            feed_forward: feed_forward(args, rng),
            layer_norm_2: LayerNorm::new(args.layernorm, args.hidden_size),
            positioning: args.layernorm_positioning,
        }
    }

    pub fn forward(&self, hidden: &Array2<f32>, mask: &Array2<f32>, position_bias: Option<&Array3<f32>>) -> Array2<f32> {
        match self.positioning {
            LayerNormPositioning::Post => {
                let inter = self.self_attn.forward(hidden, hidden, hidden, mask, position_bias) + hidden;
                let inter = self.layer_norm_1.forward(&inter);
                let out = self.feed_forward.forward(&inter) + &inter;
                self.layer_norm_2.forward(&out)
            }
            LayerNormPositioning::Pre => {
                let h = self.layer_norm_1.forward(hidden);
                let inter = self.self_attn.forward(&h, &h, &h, mask, position_bias) + hidden;
                let h = self.layer_norm_2.forward(&inter);
                self.feed_forward.forward(&h) + &inter
            }
        }
    }
}

impl Parameters for TransformerLayer {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        self.self_attn.visit_params(&join(prefix, "self_attn"), visitor)?;
        self.layer_norm_1.visit_params(&join(prefix, "layer_norm_1"), visitor)?;
        self.feed_forward.visit_params(&join(prefix, "feed_forward"), visitor)?;
        self.layer_norm_2.visit_params(&join(prefix, "layer_norm_2"), visitor)
    }
}

/// Stack of fully visible transformer layers.
pub struct TransformerEncoder {
    layers: Vec<TransformerLayer>,
    layer_norm: Option<LayerNorm>,
    relative_pos_emb: Option<RelativePositionEmbedding>,
}

impl TransformerEncoder {
    pub fn new<R: Rng + ?Sized>(args: &HyperParams, rng: &mut R) -> Self {
        let layers = (0..args.layers_num).map(|_| TransformerLayer::new(args, rng)).collect();
        let layer_norm = (args.layernorm_positioning == LayerNormPositioning::Pre)
            .then(|| LayerNorm::new(args.layernorm, args.hidden_size));
        let relative_pos_emb = args.relative_position_embedding.then(|| {
            RelativePositionEmbedding::new(args.heads_num, true, args.relative_attention_buckets_num, rng)
        });
        Self {
            layers,
            layer_norm,
            relative_pos_emb,
        }
    }

    pub fn relative_pos_emb(&self) -> Option<&RelativePositionEmbedding> {
        self.relative_pos_emb.as_ref()
    }

    /// Encode one embedded sequence; positions with segment label 0 are
    /// hidden from attention.
    pub fn forward(&self, emb: &Array2<f32>, seg: &[usize]) -> Array2<f32> {
        let len = emb.nrows();
        let mask = key_mask(len, seg.iter().map(|&s| s > 0));
        let position_bias = self.relative_pos_emb.as_ref().map(|r| r.forward(len, len));

        let mut hidden = emb.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &mask, position_bias.as_ref());
        }
        match &self.layer_norm {
            Some(ln) => ln.forward(&hidden),
            None => hidden,
        }
    }
}

impl Parameters for TransformerEncoder {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_params(&join(prefix, &format!("transformer.{}", i)), visitor)?;
        }
        if let Some(ln) = &mut self.layer_norm {
            ln.visit_params(&join(prefix, "layer_norm"), visitor)?;
        }
        if let Some(r) = &mut self.relative_pos_emb {
            r.visit_params(&join(prefix, "relative_pos_emb"), visitor)?;
        }
        Ok(())
    }
}

/// Causal self-attention, cross-attention over the memory bank, then a
/// feed-forward network.
pub struct TransformerDecoderLayer {
    self_attn: MultiHeadedAttention,
    context_attn: MultiHeadedAttention,
    layer_norm_1: LayerNorm,
    layer_norm_2: LayerNorm,
    layer_norm_3: LayerNorm,
    feed_forward: FeedForward,
    positioning: LayerNormPositioning,
}

impl TransformerDecoderLayer {
    pub fn new<R: Rng + ?Sized>(args: &HyperParams, rng: &mut R) -> Self {
        Self {
            self_attn: attention(args, rng),
            context_attn: attention(args, rng),
            layer_norm_1: LayerNorm::new(args.layernorm, args.hidden_size),
            layer_norm_2: LayerNorm::new(args.layernorm, args.hidden_size),
            layer_norm_3: LayerNorm::new(args.layernorm, args.hidden_size),
            feed_forward: feed_forward(args, rng),
            positioning: args.layernorm_positioning,
        }
    }

    pub fn forward(
        &self,
        hidden: &Array2<f32>,
        memory_bank: &Array2<f32>,
        self_mask: &Array2<f32>,
        context_mask: &Array2<f32>,
        position_bias: Option<&Array3<f32>>,
    ) -> Array2<f32> {
        match self.positioning {
            LayerNormPositioning::Post => {
                let query = self.self_attn.forward(hidden, hidden, hidden, self_mask, position_bias) + hidden;
                let query = self.layer_norm_1.forward(&query);
                let mid = self
                    .context_attn
                    .forward(memory_bank, memory_bank, &query, context_mask, None)
                    + &query;
                let mid = self.layer_norm_2.forward(&mid);
                let out = self.feed_forward.forward(&mid) + &mid;
                self.layer_norm_3.forward(&out)
            }
            LayerNormPositioning::Pre => {
                let h = self.layer_norm_1.forward(hidden);
                let query = self.self_attn.forward(&h, &h, &h, self_mask, position_bias) + hidden;
                let h = self.layer_norm_2.forward(&query);
                let mid = self.context_attn.forward(memory_bank, memory_bank, &h, context_mask, None) + &query;
                let h = self.layer_norm_3.forward(&mid);
                self.feed_forward.forward(&h) + &mid
            }
        }
    }
}

impl Parameters for TransformerDecoderLayer {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        self.self_attn.visit_params(&join(prefix, "self_attn"), visitor)?;
        self.context_attn.visit_params(&join(prefix, "context_attn"), visitor)?;
        self.layer_norm_1.visit_params(&join(prefix, "layer_norm_1"), visitor)?;
        self.layer_norm_2.visit_params(&join(prefix, "layer_norm_2"), visitor)?;
        self.layer_norm_3.visit_params(&join(prefix, "layer_norm_3"), visitor)?;
        self.feed_forward.visit_params(&join(prefix, "feed_forward"), visitor)
    }
}

/// Stack of decoder layers attending to an encoded memory bank.
pub struct TransformerDecoder {
    layers: Vec<TransformerDecoderLayer>,
    layer_norm: Option<LayerNorm>,
    self_pos_emb: Option<RelativePositionEmbedding>,
}

impl TransformerDecoder {
    /// With `share_pos_emb` the decoder owns no relative position table and
    /// expects one to be passed to `forward`.
    pub fn new<R: Rng + ?Sized>(args: &HyperParams, share_pos_emb: bool, rng: &mut R) -> Self {
        let layers = (0..args.decoder_layers())
            .map(|_| TransformerDecoderLayer::new(args, rng))
            .collect();
        let layer_norm = (args.layernorm_positioning == LayerNormPositioning::Pre)
            .then(|| LayerNorm::new(args.layernorm, args.hidden_size));
        let self_pos_emb = (args.relative_position_embedding && !share_pos_emb).then(|| {
            RelativePositionEmbedding::new(args.heads_num, false, args.relative_attention_buckets_num, rng)
        });
        Self {
            layers,
            layer_norm,
            self_pos_emb,
        }
    }

    /// Decode one embedded target sequence against `memory_bank`. Source
    /// positions holding id 0 are hidden from cross-attention.
    pub fn forward(
        &self,
        memory_bank: &Array2<f32>,
        emb: &Array2<f32>,
        src: &[usize],
        shared_pos_emb: Option<&RelativePositionEmbedding>,
    ) -> Array2<f32> {
        let tgt_len = emb.nrows();
        let self_mask = causal_mask(tgt_len);
        let context_mask = key_mask(tgt_len, src.iter().map(|&s| s > 0));
        let position_bias = self
            .self_pos_emb
            .as_ref()
            .or(shared_pos_emb)
            .map(|r| r.forward(tgt_len, tgt_len));

        let mut hidden = emb.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, memory_bank, &self_mask, &context_mask, position_bias.as_ref());
        }
        match &self.layer_norm {
            Some(ln) => ln.forward(&hidden),
            None => hidden,
        }
    }
}

impl Parameters for TransformerDecoder {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_params(&join(prefix, &format!("transformer_decoder.{}", i)), visitor)?;
        }
        if let Some(ln) = &mut self.layer_norm {
            ln.visit_params(&join(prefix, "layer_norm"), visitor)?;
        }
        if let Some(r) = &mut self.self_pos_emb {
            r.visit_params(&join(prefix, "self_pos_emb"), visitor)?;
        }
        Ok(())
    }
}
