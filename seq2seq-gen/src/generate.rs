//! Autoregressive decoding of a target sentence from one source line.

use std::fs;
use std::path::Path;

use ndarray::{aview1, Array1, Array2, Array3, ArrayView2, Axis};
use rand::Rng;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::GenerateSeq2seq;
use crate::sampling::SamplingConfig;
use crate::tokenizer::{Tokenizer, CLS_TOKEN, SEP_TOKEN};

/// Anything producing `[batch, tgt_len, vocab]` logits from source, segment
/// and target id matrices.
pub trait Seq2seqModel {
    fn logits(&self, src: ArrayView2<usize>, seg: ArrayView2<usize>, tgt: ArrayView2<usize>) -> Array3<f32>;
}

impl Seq2seqModel for GenerateSeq2seq {
    fn logits(&self, src: ArrayView2<usize>, seg: ArrayView2<usize>, tgt: ArrayView2<usize>) -> Array3<f32> {
        self.forward(src, seg, tgt)
    }
}

/// Source ids and segment labels for a batch of one.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceInput {
    pub src: Array2<usize>,
    pub seg: Array2<usize>,
}

impl SourceInput {
    /// `[CLS] tokens [SEP]`, truncated to `seq_length`, all segment labels 1.
    pub fn encode(tokenizer: &dyn Tokenizer, line: &str, seq_length: usize) -> Result<Self> {
        let mut tokens = vec![CLS_TOKEN.to_string()];
        tokens.extend(tokenizer.tokenize(line)?);
        tokens.push(SEP_TOKEN.to_string());
        let mut src = tokenizer.convert_tokens_to_ids(&tokens);
        src.truncate(seq_length);
        let seg = vec![1; src.len()];
        Ok(Self {
            src: Array1::from(src).insert_axis(Axis(0)),
            seg: Array1::from(seg).insert_axis(Axis(0)),
        })
    }
}

/// Result of decoding one line.
#[derive(Clone, Debug, PartialEq)]
pub struct Generation {
    /// Target ids including the leading `[CLS]`.
    pub tokens: Vec<usize>,
    /// Target tokens concatenated without separators.
    pub text: String,
}

/// Drives the sampling loop for one source line.
pub struct Generator<'a, M: Seq2seqModel + ?Sized> {
    model: &'a M,
    tokenizer: &'a dyn Tokenizer,
    tgt_tokenizer: &'a dyn Tokenizer,
    seq_length: usize,
    tgt_seq_length: usize,
    sampling: SamplingConfig,
}

impl<'a, M: Seq2seqModel + ?Sized> Generator<'a, M> {
    pub fn new(
        model: &'a M,
        tokenizer: &'a dyn Tokenizer,
        tgt_tokenizer: &'a dyn Tokenizer,
        seq_length: usize,
        tgt_seq_length: usize,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            model,
            tokenizer,
            tgt_tokenizer,
            seq_length,
            tgt_seq_length,
            sampling,
        }
    }

    /// Decode exactly `tgt_seq_length - 1` tokens after `[CLS]`. There is no
    /// end-of-sequence stop.
    pub fn generate<R: Rng + ?Sized>(&self, line: &str, rng: &mut R) -> Result<Generation> {
        let source = SourceInput::encode(self.tokenizer, line, self.seq_length)?;
        // The start token always comes from the source vocabulary.
        let mut tgt = self.tokenizer.convert_tokens_to_ids(&[CLS_TOKEN.to_string()]);
        info!(
            "decoding {} target tokens from {} source tokens",
            self.tgt_seq_length.saturating_sub(1),
            source.src.ncols()
        );

        for step in 0..self.tgt_seq_length.saturating_sub(1) {
            let tgt_view = aview1(&tgt).insert_axis(Axis(0));
            let logits = self.model.logits(source.src.view(), source.seg.view(), tgt_view);
            let last = logits.index_axis(Axis(0), 0);
            let next_token_logits = last.row(last.nrows() - 1);
            let next = self.sampling.sample(next_token_logits, rng)?;
            debug!(step, next, "sampled token");
            tgt.push(next);
        }

        let text = self.tgt_tokenizer.convert_ids_to_tokens(&tgt).concat();
        Ok(Generation { tokens: tgt, text })
    }
}

/// Read the first line of `path`, trimmed.
pub fn read_source_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let text = fs::read_to_string(path)?;
    Ok(text.lines().next().unwrap_or("").trim().to_string())
}

/// Write the source line followed by the generated text.
pub fn write_prediction<P: AsRef<Path>>(path: P, line: &str, generation: &Generation) -> Result<()> {
    fs::write(path, format!("{}\n{}", line, generation.text))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{SpaceTokenizer, Vocab};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Always prefers `favourite`, and checks its inputs have batch size one.
    struct FixedModel {
        vocab: usize,
        favourite: usize,
    }

    impl Seq2seqModel for FixedModel {
        fn logits(&self, src: ArrayView2<usize>, seg: ArrayView2<usize>, tgt: ArrayView2<usize>) -> Array3<f32> {
            assert_eq!(src.dim(), seg.dim());
            assert_eq!(tgt.nrows(), 1);
            let mut out = Array3::zeros((1, tgt.ncols(), self.vocab));
            out[[0, tgt.ncols() - 1, self.favourite]] = 100.0;
            out
        }
    }

    fn tokenizer() -> SpaceTokenizer {
        let tokens = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "hello", "world", "!"];
        SpaceTokenizer::new(Vocab::new(tokens.iter().map(|t| t.to_string()).collect()).unwrap())
    }

    #[test]
    fn source_is_wrapped_in_cls_and_sep() {
        let tok = tokenizer();
        let input = SourceInput::encode(&tok, "hello world", 128).unwrap();
        assert_eq!(input.src.row(0).to_vec(), vec![2, 4, 5, 3]);
        assert_eq!(input.seg.row(0).to_vec(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn long_source_is_truncated_with_segments() {
        let tok = tokenizer();
        let input = SourceInput::encode(&tok, "hello world hello world", 3).unwrap();
        assert_eq!(input.src.row(0).to_vec(), vec![2, 4, 5]);
        assert_eq!(input.seg.ncols(), 3);
    }

    #[test]
    fn generates_exactly_tgt_seq_length_tokens() {
        let tok = tokenizer();
        let model = FixedModel { vocab: 7, favourite: 6 };
        let generator = Generator::new(&model, &tok, &tok, 128, 5, SamplingConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        let out = generator.generate("hello world", &mut rng).unwrap();
        assert_eq!(out.tokens.len(), 5);
        assert_eq!(out.tokens[0], 2);
        assert_eq!(out.text, "[CLS]!!!!");
    }

    #[test]
    fn end_token_does_not_stop_decoding() {
        let tok = tokenizer();
        let model = FixedModel { vocab: 7, favourite: 3 };
        let generator = Generator::new(&model, &tok, &tok, 128, 4, SamplingConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        let out = generator.generate("hello", &mut rng).unwrap();
        assert_eq!(out.tokens, vec![2, 3, 3, 3]);
    }

    #[test]
    fn single_token_target_runs_no_steps() {
        let tok = tokenizer();
        let model = FixedModel { vocab: 7, favourite: 4 };
        let generator = Generator::new(&model, &tok, &tok, 128, 1, SamplingConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(generator.generate("hello", &mut rng).unwrap().tokens, vec![2]);
    }

    #[test]
    fn prediction_file_holds_line_and_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pred.txt");
        let generation = Generation {
            tokens: vec![2, 4],
            text: "[CLS]hello".to_string(),
        };
        write_prediction(&path, "hello world", &generation).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello world\n[CLS]hello");
    }

    #[test]
    fn only_first_line_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.txt");
        fs::write(&path, "first line  \nsecond line\n").unwrap();
        assert_eq!(read_source_line(&path).unwrap(), "first line");
    }
}
