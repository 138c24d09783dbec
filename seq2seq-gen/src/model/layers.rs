//! Building blocks shared by the encoder, decoder and embeddings.

use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::Rng;

use super::{join, ParamVisitor, Parameters};
use crate::config::{Activation, FeedForwardKind, LayerNormKind};
use crate::error::Result;

/// Additive mask value for positions a query may not attend to.
pub const MASK_VALUE: f32 = -10000.0;

pub(crate) fn random_matrix<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-0.1..0.1))
}

/// Row-wise softmax in place.
pub(crate) fn softmax_rows(scores: &mut Array2<f32>) {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

/// Fully connected layer.
pub struct Linear {
    weight: Array2<f32>, // out x in
    bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        let weight = random_matrix(out_features, in_features, rng);
        let bias = if bias {
            Some(Array1::from_shape_fn(out_features, |_| rng.gen_range(-0.1..0.1)))
        } else {
            None
        };
        Self { weight, bias }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight.t());
        if let Some(b) = &self.bias {
            y += &b.view().insert_axis(Axis(0));
        }
        y
    }
}

impl Parameters for Linear {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        visitor.visit(&join(prefix, "weight"), self.weight.view_mut().into_dyn())?;
        if let Some(b) = &mut self.bias {
            visitor.visit(&join(prefix, "bias"), b.view_mut().into_dyn())?;
        }
        Ok(())
    }
}

/// Layer normalization, either mean/variance based or the RMS form used by T5.
pub struct LayerNorm {
    kind: LayerNormKind,
    gamma: Array1<f32>,
    beta: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(kind: LayerNormKind, dim: usize) -> Self {
        Self {
            kind,
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            eps: 1e-6,
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let gamma = self.gamma.view().insert_axis(Axis(0));
        let dim = x.ncols() as f32;
        match self.kind {
            LayerNormKind::Normal => {
                let mean = (x.sum_axis(Axis(1)) / dim).insert_axis(Axis(1));
                let centered = x - &mean;
                let var = centered.mapv(|v| v * v).sum_axis(Axis(1)) / dim;
                let denom = var.mapv(|v| (v + self.eps).sqrt()).insert_axis(Axis(1));
                centered / &denom * &gamma + &self.beta.view().insert_axis(Axis(0))
            }
            LayerNormKind::T5 => {
                let mean = x.mapv(|v| v * v).sum_axis(Axis(1)) / dim;
                let denom = mean.mapv(|m| (m + self.eps).sqrt()).insert_axis(Axis(1));
                x / &denom * &gamma
            }
        }
    }
}

impl Parameters for LayerNorm {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        match self.kind {
            LayerNormKind::Normal => {
                visitor.visit(&join(prefix, "gamma"), self.gamma.view_mut().into_dyn())?;
                visitor.visit(&join(prefix, "beta"), self.beta.view_mut().into_dyn())
            }
            LayerNormKind::T5 => visitor.visit(&join(prefix, "weight"), self.gamma.view_mut().into_dyn()),
        }
    }
}

/// Bucketed relative position bias, one scalar per head and bucket.
pub struct RelativePositionEmbedding {
    weight: Array2<f32>, // buckets x heads
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
}

impl RelativePositionEmbedding {
    pub fn new<R: Rng + ?Sized>(heads_num: usize, bidirectional: bool, num_buckets: usize, rng: &mut R) -> Self {
        Self {
            weight: random_matrix(num_buckets, heads_num, rng),
            bidirectional,
            num_buckets,
            max_distance: 128,
        }
    }

    /// Bias of shape `[heads, query_len, key_len]`.
    pub fn forward(&self, query_len: usize, key_len: usize) -> Array3<f32> {
        let heads = self.weight.ncols();
        let mut bias = Array3::<f32>::zeros((heads, query_len, key_len));
        for q in 0..query_len {
            for k in 0..key_len {
                let bucket = self.bucket(k as i64 - q as i64);
                for h in 0..heads {
                    bias[[h, q, k]] = self.weight[[bucket, h]];
                }
            }
        }
        bias
    }

    fn bucket(&self, relative_position: i64) -> usize {
        let mut num_buckets = self.num_buckets as i64;
        let mut ret = 0;
        let mut n = -relative_position;
        if self.bidirectional {
            num_buckets /= 2;
            if n < 0 {
                ret += num_buckets;
            }
            n = n.abs();
        } else {
            n = n.max(0);
        }
        let max_exact = num_buckets / 2;
        if n < max_exact {
            return (ret + n) as usize;
        }
        let scaled = (n as f32 / max_exact as f32).ln()
            / (self.max_distance as f32 / max_exact as f32).ln()
            * (num_buckets - max_exact) as f32;
        let large = (max_exact + scaled as i64).min(num_buckets - 1);
        (ret + large) as usize
    }
}

impl Parameters for RelativePositionEmbedding {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        visitor.visit(&join(prefix, "weight"), self.weight.view_mut().into_dyn())
    }
}

/// Multi-head attention layer.
pub struct MultiHeadedAttention {
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    final_linear: Linear,
    heads_num: usize,
    head_dim: usize,
    with_scale: bool,
}

impl MultiHeadedAttention {
    pub fn new<R: Rng + ?Sized>(
        hidden_size: usize,
        heads_num: usize,
        has_bias: bool,
        with_scale: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            linear_q: Linear::new(hidden_size, hidden_size, has_bias, rng),
            linear_k: Linear::new(hidden_size, hidden_size, has_bias, rng),
            linear_v: Linear::new(hidden_size, hidden_size, has_bias, rng),
            final_linear: Linear::new(hidden_size, hidden_size, has_bias, rng),
            heads_num,
            head_dim: hidden_size / heads_num,
            with_scale,
        }
    }

    /// `mask` is additive with shape `[query_len, key_len]`; `position_bias`
    /// has shape `[heads, query_len, key_len]`.
    pub fn forward(
        &self,
        key: &Array2<f32>,
        value: &Array2<f32>,
        query: &Array2<f32>,
        mask: &Array2<f32>,
        position_bias: Option<&Array3<f32>>,
    ) -> Array2<f32> {
        let q = self.linear_q.forward(query);
        let k = self.linear_k.forward(key);
        let v = self.linear_v.forward(value);
        let scale = if self.with_scale {
            (self.head_dim as f32).sqrt()
        } else {
            1.0
        };

        let mut out = Array2::<f32>::zeros((query.nrows(), self.heads_num * self.head_dim));
        for h in 0..self.heads_num {
            let cols = h * self.head_dim..(h + 1) * self.head_dim;
            let qh = q.slice(s![.., cols.clone()]);
            let kh = k.slice(s![.., cols.clone()]);
            let vh = v.slice(s![.., cols.clone()]);

            let mut scores = qh.dot(&kh.t()) / scale + mask;
            if let Some(bias) = position_bias {
                scores += &bias.index_axis(Axis(0), h);
            }
            softmax_rows(&mut scores);
            out.slice_mut(s![.., cols]).assign(&scores.dot(&vh));
        }
        self.final_linear.forward(&out)
    }
}

impl Parameters for MultiHeadedAttention {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        self.linear_q.visit_params(&join(prefix, "linear_q"), visitor)?;
        self.linear_k.visit_params(&join(prefix, "linear_k"), visitor)?;
        self.linear_v.visit_params(&join(prefix, "linear_v"), visitor)?;
        self.final_linear.visit_params(&join(prefix, "final_linear"), visitor)
    }
}

impl Activation {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Gelu => 0.5 * x * (1.0 + erf(x / std::f32::consts::SQRT_2)),
            Activation::GeluFast => {
                let c = (2.0 / std::f32::consts::PI).sqrt();
                0.5 * x * (1.0 + (c * (x + 0.044715 * x * x * x)).tanh())
            }
            Activation::Relu => x.max(0.0),
            Activation::Silu => x * (1.0 / (1.0 + (-x).exp())),
        }
    }
}

// Abramowitz and Stegun 7.1.26, max error 1.5e-7.
fn erf(x: f32) -> f32 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = ((((1.061_405_4 * t - 1.453_152_1) * t + 1.421_413_8) * t - 0.284_496_74) * t
        + 0.254_829_6)
        * t;
    sign * (1.0 - poly * (-x * x).exp())
}

/// Position-wise feed-forward network, plain or gated.
pub struct FeedForward {
    linear_gate: Option<Linear>,
    linear_1: Linear,
    linear_2: Linear,
    act: Activation,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(
        kind: FeedForwardKind,
        hidden_size: usize,
        feedforward_size: usize,
        act: Activation,
        has_bias: bool,
        rng: &mut R,
    ) -> Self {
        let linear_gate = match kind {
            FeedForwardKind::Dense => None,
            FeedForwardKind::Gated => Some(Linear::new(hidden_size, feedforward_size, has_bias, rng)),
        };
        Self {
            linear_gate,
            linear_1: Linear::new(hidden_size, feedforward_size, has_bias, rng),
            linear_2: Linear::new(feedforward_size, hidden_size, has_bias, rng),
            act,
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let act = self.act;
        let inter = match &self.linear_gate {
            None => self.linear_1.forward(x).mapv(|v| act.apply(v)),
            Some(gate) => gate.forward(x).mapv(|v| act.apply(v)) * self.linear_1.forward(x),
        };
        self.linear_2.forward(&inter)
    }
}

impl Parameters for FeedForward {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor) -> Result<()> {
        if let Some(gate) = &mut self.linear_gate {
            gate.visit_params(&join(prefix, "linear_gate"), visitor)?;
        }
        self.linear_1.visit_params(&join(prefix, "linear_1"), visitor)?;
        self.linear_2.visit_params(&join(prefix, "linear_2"), visitor)
    }
}
