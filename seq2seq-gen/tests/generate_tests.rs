use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use seq2seq_gen::checkpoint::{self, Checkpoint};
use seq2seq_gen::config::{HyperParams, TargetKind};
use seq2seq_gen::generate::{read_source_line, write_prediction, Generator};
use seq2seq_gen::model::GenerateSeq2seq;
use seq2seq_gen::sampling::SamplingConfig;
use seq2seq_gen::tokenizer::{Tokenizer, TokenizerKind, Vocab};

const VOCAB: &str = "[PAD]\n[UNK]\n[CLS]\n[SEP]\n[MASK]\nhello\nworld\nfoo\nbar\n";

fn write_vocab(dir: &Path, name: &str, contents: &str) -> Vocab {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    Vocab::load(&path).unwrap()
}

fn tiny_args(target: TargetKind) -> HyperParams {
    HyperParams {
        emb_size: 8,
        hidden_size: 8,
        feedforward_size: 16,
        heads_num: 2,
        layers_num: 1,
        max_seq_length: 32,
        target,
        ..HyperParams::default()
    }
}

#[test]
fn hello_world_generates_four_tokens_after_start() {
    let dir = tempfile::tempdir().unwrap();
    let tokenizer = TokenizerKind::Space.build(write_vocab(dir.path(), "vocab.txt", VOCAB)).unwrap();
    let vocab_size = tokenizer.vocab().len();

    let ckpt_path = dir.path().join("model.s2sg");
    let mut trained = GenerateSeq2seq::new(tiny_args(TargetKind::T5), vocab_size, vocab_size, &mut StdRng::seed_from_u64(3));
    Checkpoint::from_model(&mut trained).unwrap().save(&ckpt_path).unwrap();

    let mut model = GenerateSeq2seq::new(tiny_args(TargetKind::T5), vocab_size, vocab_size, &mut StdRng::seed_from_u64(4));
    checkpoint::load_model(&mut model, &ckpt_path).unwrap();

    let generator = Generator::new(&model, &*tokenizer, &*tokenizer, 128, 5, SamplingConfig::default());
    let out = generator.generate("hello world", &mut StdRng::seed_from_u64(5)).unwrap();
    assert_eq!(out.tokens.len(), 5);
    assert_eq!(out.tokens[0], 2);
    assert!(out.tokens.iter().all(|&t| t < vocab_size));
    assert!(out.text.starts_with("[CLS]"));
}

#[test]
fn same_seed_gives_same_generation() {
    let dir = tempfile::tempdir().unwrap();
    let tokenizer = TokenizerKind::Bert.build(write_vocab(dir.path(), "vocab.txt", VOCAB)).unwrap();
    let n = tokenizer.vocab().len();
    let model = GenerateSeq2seq::new(tiny_args(TargetKind::T5), n, n, &mut StdRng::seed_from_u64(8));
    let sampling = SamplingConfig {
        top_k: 3,
        top_p: 0.9,
        temperature: 0.7,
    };
    let generator = Generator::new(&model, &*tokenizer, &*tokenizer, 16, 6, sampling);
    let a = generator.generate("Hello foo", &mut StdRng::seed_from_u64(9)).unwrap();
    let b = generator.generate("Hello foo", &mut StdRng::seed_from_u64(9)).unwrap();
    assert_eq!(a, b);
}

#[test]
fn seq2seq_target_renders_with_target_vocabulary() {
    let dir = tempfile::tempdir().unwrap();
    let src_tok = TokenizerKind::Space.build(write_vocab(dir.path(), "src.txt", VOCAB)).unwrap();
    let tgt_tok = TokenizerKind::Char.build(write_vocab(
        dir.path(),
        "tgt.txt",
        "[PAD]\n[UNK]\n[CLS]\n[SEP]\n你\n好\n",
    ))
    .unwrap();
    let model = GenerateSeq2seq::new(
        tiny_args(TargetKind::Seq2seq),
        src_tok.vocab().len(),
        tgt_tok.vocab().len(),
        &mut StdRng::seed_from_u64(10),
    );
    let generator = Generator::new(&model, &*src_tok, &*tgt_tok, 128, 4, SamplingConfig::default());
    let out = generator.generate("hello bar", &mut StdRng::seed_from_u64(11)).unwrap();
    assert_eq!(out.tokens.len(), 4);
    assert!(out.tokens.iter().all(|&t| t < tgt_tok.vocab().len()));
    let expected: String = tgt_tok.convert_ids_to_tokens(&out.tokens).concat();
    assert_eq!(out.text, expected);
}

#[test]
fn prediction_round_trip_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let tokenizer = TokenizerKind::Space.build(write_vocab(dir.path(), "vocab.txt", VOCAB)).unwrap();
    let n = tokenizer.vocab().len();
    let model = GenerateSeq2seq::new(tiny_args(TargetKind::T5), n, n, &mut StdRng::seed_from_u64(12));

    let test_path = dir.path().join("test.txt");
    fs::write(&test_path, "hello world\nignored second line\n").unwrap();
    let line = read_source_line(&test_path).unwrap();

    let generator = Generator::new(&model, &*tokenizer, &*tokenizer, 128, 3, SamplingConfig::default());
    let out = generator.generate(&line, &mut StdRng::seed_from_u64(13)).unwrap();
    let pred_path = dir.path().join("pred.txt");
    write_prediction(&pred_path, &line, &out).unwrap();

    let written = fs::read_to_string(&pred_path).unwrap();
    let (first, second) = written.split_once('\n').unwrap();
    assert_eq!(first, "hello world");
    assert_eq!(second, out.text);
}
