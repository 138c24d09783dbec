use ndarray::{arr2, ArrayD};
use rand::rngs::StdRng;
use rand::SeedableRng;
use seq2seq_gen::checkpoint::{self, Checkpoint};
use seq2seq_gen::config::{EmbeddingKind, FeedForwardKind, HyperParams, TargetKind};
use seq2seq_gen::model::GenerateSeq2seq;
use seq2seq_gen::Error;
use tempfile::NamedTempFile;

fn small_args() -> HyperParams {
    HyperParams {
        emb_size: 16,
        hidden_size: 16,
        feedforward_size: 32,
        heads_num: 4,
        layers_num: 2,
        max_seq_length: 64,
        ..HyperParams::default()
    }
}

#[test]
fn test_forward_shapes() {
    let mut rng = StdRng::seed_from_u64(0);
    let model = GenerateSeq2seq::new(small_args(), 30, 25, &mut rng);
    let src = arr2(&[[2usize, 7, 8, 9, 3]]);
    let seg = arr2(&[[1usize, 1, 1, 1, 1]]);
    let tgt = arr2(&[[2usize, 11, 12]]);
    let logits = model.forward(src.view(), seg.view(), tgt.view());
    assert_eq!(logits.shape(), &[1, 3, 25]);
}

#[test]
fn test_checkpoint_restores_outputs() -> Result<(), Error> {
    let args = HyperParams {
        target: TargetKind::Seq2seq,
        embedding: EmbeddingKind::WordSinusoidalpos,
        feed_forward: FeedForwardKind::Gated,
        has_lmtarget_bias: true,
        ..small_args()
    };
    let mut trained = GenerateSeq2seq::new(args.clone(), 30, 30, &mut StdRng::seed_from_u64(1));
    let file = NamedTempFile::new()?;
    Checkpoint::from_model(&mut trained)?.save(file.path())?;

    let mut fresh = GenerateSeq2seq::new(args, 30, 30, &mut StdRng::seed_from_u64(2));
    checkpoint::load_model(&mut fresh, file.path())?;

    let src = arr2(&[[2usize, 5, 6, 3]]);
    let seg = arr2(&[[1usize, 1, 1, 1]]);
    let tgt = arr2(&[[2usize, 4]]);
    assert_eq!(
        trained.forward(src.view(), seg.view(), tgt.view()),
        fresh.forward(src.view(), seg.view(), tgt.view())
    );
    Ok(())
}

#[test]
fn test_missing_tensor_is_reported() {
    let mut model = GenerateSeq2seq::new(small_args(), 30, 30, &mut StdRng::seed_from_u64(1));
    let mut ckpt = Checkpoint::from_model(&mut model).unwrap();
    let mut partial = Checkpoint::default();
    partial.insert(
        "embedding.word.weight",
        ckpt.get("embedding.word.weight").unwrap().clone(),
    );
    let err = partial.apply(&mut model).unwrap_err();
    assert!(matches!(err, Error::MissingTensor(_)));

    // Unused extra tensors are tolerated.
    ckpt.insert("unused.weight", ArrayD::zeros(vec![2, 2]));
    ckpt.apply(&mut model).unwrap();
}

#[test]
fn test_shape_mismatch_is_reported() {
    let mut small_vocab = GenerateSeq2seq::new(small_args(), 30, 30, &mut StdRng::seed_from_u64(1));
    let ckpt = Checkpoint::from_model(&mut small_vocab).unwrap();
    let mut large_vocab = GenerateSeq2seq::new(small_args(), 40, 30, &mut StdRng::seed_from_u64(1));
    match ckpt.apply(&mut large_vocab) {
        Err(Error::ShapeMismatch { name, expected, found }) => {
            assert_eq!(name, "embedding.word.weight");
            assert_eq!(expected, vec![40, 16]);
            assert_eq!(found, vec![30, 16]);
        }
        other => panic!("expected shape mismatch, got {:?}", other.err()),
    }
}
