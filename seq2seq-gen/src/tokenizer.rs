//! Vocabulary files and the three tokenizers selectable on the command line.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use tokenizers::decoders::DecoderWrapper;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::bert::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::processors::PostProcessorWrapper;
use tokenizers::{TokenizerBuilder, TokenizerImpl};

use crate::config::TargetKind;
use crate::error::{Error, Result};

pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";
pub const UNK_TOKEN: &str = "[UNK]";

/// Longest word WordPiece will attempt to split.
const MAX_INPUT_CHARS_PER_WORD: usize = 100;

/// Bidirectional mapping between token strings and ids.
#[derive(Clone, Debug)]
pub struct Vocab {
    token_to_id: HashMap<String, usize>,
    id_to_token: Vec<String>,
    unk_id: usize,
}

impl Vocab {
    /// Build a vocabulary from an ordered token list. The first occurrence of
    /// a duplicated token owns the id.
    pub fn new(tokens: Vec<String>) -> std::result::Result<Self, String> {
        let mut token_to_id = HashMap::with_capacity(tokens.len());
        for (i, tok) in tokens.iter().enumerate() {
            token_to_id.entry(tok.clone()).or_insert(i);
        }
        let unk_id = *token_to_id
            .get(UNK_TOKEN)
            .ok_or_else(|| format!("missing {} token", UNK_TOKEN))?;
        Ok(Self {
            token_to_id,
            id_to_token: tokens,
            unk_id,
        })
    }

    /// Load a vocabulary file with one token per line.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let tokens = text
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect();
        Self::new(tokens).map_err(|reason| Error::Vocab {
            path: PathBuf::from(path),
            reason,
        })
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn get(&self, token: &str) -> Option<usize> {
        self.token_to_id.get(token).copied()
    }

    /// Every distinct token with the id it resolves to.
    pub fn entries(&self) -> impl Iterator<Item = (&str, usize)> {
        self.token_to_id.iter().map(|(tok, &id)| (tok.as_str(), id))
    }

    pub fn token(&self, id: usize) -> Option<&str> {
        self.id_to_token.get(id).map(String::as_str)
    }

    pub fn unk_id(&self) -> usize {
        self.unk_id
    }
}

/// String to id conversion shared by the generation loop.
pub trait Tokenizer {
    fn vocab(&self) -> &Vocab;

    /// Split raw text into vocabulary tokens.
    fn tokenize(&self, text: &str) -> Result<Vec<String>>;

    /// Map tokens to ids; unknown tokens map to `[UNK]`.
    fn convert_tokens_to_ids(&self, tokens: &[String]) -> Vec<usize> {
        let vocab = self.vocab();
        tokens
            .iter()
            .map(|t| vocab.get(t).unwrap_or(vocab.unk_id()))
            .collect()
    }

    /// Map ids back to tokens; ids outside the vocabulary render as `[UNK]`.
    fn convert_ids_to_tokens(&self, ids: &[usize]) -> Vec<String> {
        let vocab = self.vocab();
        ids.iter()
            .map(|&id| vocab.token(id).unwrap_or(UNK_TOKEN).to_string())
            .collect()
    }
}

/// Tokenizer selectable by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TokenizerKind {
    Bert,
    Char,
    Space,
}

impl TokenizerKind {
    pub fn build(self, vocab: Vocab) -> Result<Box<dyn Tokenizer>> {
        Ok(match self {
            TokenizerKind::Bert => Box::new(BertTokenizer::new(vocab)?),
            TokenizerKind::Char => Box::new(CharTokenizer::new(vocab)),
            TokenizerKind::Space => Box::new(SpaceTokenizer::new(vocab)),
        })
    }
}

/// Source and target tokenizers for one run. The `t5` target decodes into
/// the source vocabulary; `seq2seq` has its own vocabulary and tokenizer.
pub struct TokenizerPair {
    source: Box<dyn Tokenizer>,
    target: Option<Box<dyn Tokenizer>>,
}

impl TokenizerPair {
    pub fn load(
        target: TargetKind,
        kind: TokenizerKind,
        vocab_path: &Path,
        tgt_kind: TokenizerKind,
        tgt_vocab_path: Option<&Path>,
    ) -> Result<Self> {
        let source = kind.build(Vocab::load(vocab_path)?)?;
        let target = match target {
            TargetKind::Seq2seq => {
                let path = tgt_vocab_path.ok_or_else(|| {
                    Error::Config("tgt_vocab_path is required with the seq2seq target".to_string())
                })?;
                Some(tgt_kind.build(Vocab::load(path)?)?)
            }
            TargetKind::T5 => None,
        };
        Ok(Self { source, target })
    }

    pub fn source(&self) -> &dyn Tokenizer {
        &*self.source
    }

    pub fn target(&self) -> &dyn Tokenizer {
        self.target.as_deref().unwrap_or(&*self.source)
    }
}

/// Splits text into single characters.
pub struct CharTokenizer {
    vocab: Vocab,
}

impl CharTokenizer {
    pub fn new(vocab: Vocab) -> Self {
        Self { vocab }
    }
}

impl Tokenizer for CharTokenizer {
    fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        Ok(text.trim().chars().map(String::from).collect())
    }
}

/// Splits text on single spaces.
pub struct SpaceTokenizer {
    vocab: Vocab,
}

impl SpaceTokenizer {
    pub fn new(vocab: Vocab) -> Self {
        Self { vocab }
    }
}

impl Tokenizer for SpaceTokenizer {
    fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        Ok(text.trim().split(' ').map(String::from).collect())
    }
}

type BertPipeline =
    TokenizerImpl<WordPiece, BertNormalizer, BertPreTokenizer, PostProcessorWrapper, DecoderWrapper>;

/// BERT basic tokenization (control characters dropped, CJK ideographs and
/// punctuation split off, accents stripped, lowercased) followed by greedy
/// WordPiece with `##` continuation pieces.
pub struct BertTokenizer {
    vocab: Vocab,
    pipeline: BertPipeline,
}

impl BertTokenizer {
    pub fn new(vocab: Vocab) -> Result<Self> {
        let wordpiece = WordPiece::builder()
            .vocab(vocab.entries().map(|(tok, id)| (tok.to_string(), id as u32)).collect())
            .unk_token(UNK_TOKEN.to_string())
            .continuing_subword_prefix("##".to_string())
            .max_input_chars_per_word(MAX_INPUT_CHARS_PER_WORD)
            .build()
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        let pipeline = TokenizerBuilder::new()
            .with_model(wordpiece)
            .with_normalizer(Some(BertNormalizer::new(true, true, Some(true), true)))
            .with_pre_tokenizer(Some(BertPreTokenizer))
            .build()
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(Self { vocab, pipeline })
    }
}

impl Tokenizer for BertTokenizer {
    fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self
            .pipeline
            .encode(text, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_tokens().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(tokens: &[&str]) -> Vocab {
        Vocab::new(tokens.iter().map(|t| t.to_string()).collect()).unwrap()
    }

    #[test]
    fn vocab_requires_unk() {
        let err = Vocab::new(vec!["[PAD]".to_string(), "a".to_string()]).unwrap_err();
        assert!(err.contains(UNK_TOKEN));
    }

    #[test]
    fn duplicate_tokens_keep_first_id() {
        let v = vocab(&["[PAD]", "[UNK]", "a", "a"]);
        assert_eq!(v.get("a"), Some(2));
        assert_eq!(v.len(), 4);
    }

    #[test]
    fn char_tokenizer_splits_characters() {
        let t = CharTokenizer::new(vocab(&["[PAD]", "[UNK]", "你", "好"]));
        let tokens = t.tokenize(" 你好 ").unwrap();
        assert_eq!(tokens, vec!["你", "好"]);
        assert_eq!(t.convert_tokens_to_ids(&tokens), vec![2, 3]);
    }

    #[test]
    fn space_tokenizer_maps_unknown_to_unk() {
        let t = SpaceTokenizer::new(vocab(&["[PAD]", "[UNK]", "hello"]));
        let tokens = t.tokenize("hello world").unwrap();
        assert_eq!(t.convert_tokens_to_ids(&tokens), vec![2, 1]);
    }

    fn bert(tokens: &[&str]) -> BertTokenizer {
        BertTokenizer::new(vocab(tokens)).unwrap()
    }

    #[test]
    fn bert_tokenizer_splits_punctuation_and_wordpieces() {
        let t = bert(&["[PAD]", "[UNK]", "hello", "play", "##ing", ",", "中", "国"]);
        assert_eq!(
            t.tokenize("Hello, Playing 中国").unwrap(),
            vec!["hello", ",", "play", "##ing", "中", "国"]
        );
    }

    #[test]
    fn bert_tokenizer_unmatchable_word_is_unk() {
        let t = bert(&["[PAD]", "[UNK]", "play"]);
        assert_eq!(t.tokenize("playxyz").unwrap(), vec![UNK_TOKEN]);
    }

    #[test]
    fn bert_tokenizer_strips_accents() {
        let t = bert(&["[PAD]", "[UNK]", "cafe"]);
        assert_eq!(t.tokenize("Café").unwrap(), vec!["cafe"]);
    }

    #[test]
    fn bert_tokenizer_drops_format_characters() {
        let t = bert(&["[PAD]", "[UNK]", "coop"]);
        assert_eq!(t.tokenize("co\u{AD}op").unwrap(), vec!["coop"]);
        assert_eq!(t.tokenize("co\u{200D}op").unwrap(), vec!["coop"]);
    }

    #[test]
    fn bert_tokenizer_overlong_word_is_unk() {
        let t = bert(&["[PAD]", "[UNK]", "a", "##a"]);
        assert_eq!(t.tokenize(&"a".repeat(101)).unwrap(), vec![UNK_TOKEN]);
        assert_eq!(t.tokenize(&"a".repeat(3)).unwrap(), vec!["a", "##a", "##a"]);
    }

    #[test]
    fn out_of_range_id_renders_unk() {
        let t = CharTokenizer::new(vocab(&["[PAD]", "[UNK]", "a"]));
        assert_eq!(t.convert_ids_to_tokens(&[2, 99]), vec!["a", UNK_TOKEN]);
    }

    fn write_vocab(dir: &Path, name: &str, tokens: &[&str]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, tokens.join("\n")).unwrap();
        path
    }

    #[test]
    fn t5_target_shares_source_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_vocab(dir.path(), "src.txt", &["[PAD]", "[UNK]", "[CLS]", "hello"]);
        let tgt = write_vocab(dir.path(), "tgt.txt", &["[PAD]", "[UNK]"]);
        let pair = TokenizerPair::load(TargetKind::T5, TokenizerKind::Space, &src, TokenizerKind::Char, Some(&tgt))
            .unwrap();
        assert_eq!(pair.target().vocab().len(), 4);
        assert_eq!(pair.target().tokenize("hello").unwrap(), vec!["hello"]);
    }

    #[test]
    fn seq2seq_target_uses_its_own_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_vocab(dir.path(), "src.txt", &["[PAD]", "[UNK]", "[CLS]", "hello"]);
        let tgt = write_vocab(dir.path(), "tgt.txt", &["[PAD]", "[UNK]", "h", "i"]);
        let pair =
            TokenizerPair::load(TargetKind::Seq2seq, TokenizerKind::Space, &src, TokenizerKind::Char, Some(&tgt))
                .unwrap();
        assert_eq!(pair.source().vocab().len(), 4);
        assert_eq!(pair.target().tokenize("hi").unwrap(), vec!["h", "i"]);
        assert_eq!(pair.target().convert_ids_to_tokens(&[3]), vec!["i"]);
    }

    #[test]
    fn seq2seq_target_requires_target_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_vocab(dir.path(), "src.txt", &["[PAD]", "[UNK]"]);
        let result = TokenizerPair::load(TargetKind::Seq2seq, TokenizerKind::Bert, &src, TokenizerKind::Bert, None);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
