use super::common::{init_logger, random_tensor, tiny_engine, FixedProjection};
use crate::config::T5Config;
use crate::dtype::DType;
use crate::error::Error;
use crate::nn::block::BlockInput;
use crate::nn::gated_linear::{GatedProjection, ProjectionKind, ProjectionSite};
use crate::nn::{RunContext, Seq2SeqEngine};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn only_layer_zero_owns_a_bias_table() {
    let engine = tiny_engine(0);
    for stack in [&engine.encoder, &engine.decoder] {
        assert!(stack.blocks[0].has_relative_bias());
        assert!(!stack.blocks[1].has_relative_bias());
    }
    let table = |s: &crate::nn::Stack| {
        s.blocks[0]
            .self_attn
            .attention
            .relative_bias
            .as_ref()
            .map(|rb| rb.bidirectional)
    };
    assert_eq!(table(&engine.encoder), Some(true));
    assert_eq!(table(&engine.decoder), Some(false));
}

#[test]
fn later_layers_share_the_first_position_bias() {
    let engine = tiny_engine(1);
    let ctx = RunContext::eval(DType::F32);
    let x = random_tensor(&[1, 4, 8], 2);

    let first = engine.encoder.blocks[0]
        .forward(BlockInput::new(&x), &ctx)
        .unwrap();
    let bias = first.position_bias.clone().expect("layer 0 bias");
    assert_eq!(bias.shape(), vec![1, 2, 4, 4]);

    let second = engine.encoder.blocks[1]
        .forward(
            BlockInput {
                position_bias: Some(&bias),
                ..BlockInput::new(&first.hidden_states)
            },
            &ctx,
        )
        .unwrap();
    assert!(second.position_bias.as_ref() == Some(&bias));
}

#[test]
fn three_state_cache_is_rejected() {
    init_logger();
    let engine = tiny_engine(3);
    let ctx = RunContext::eval(DType::F32);
    let x = random_tensor(&[1, 1, 8], 4);
    let enc = random_tensor(&[1, 3, 8], 5);
    let past: Vec<Tensor> = (0..3).map(|i| random_tensor(&[1, 2, 2, 4], 10 + i)).collect();

    let err = engine.decoder.blocks[0]
        .forward(
            BlockInput {
                encoder_hidden_states: Some(&enc),
                past: Some(&past),
                use_cache: true,
                ..BlockInput::new(&x)
            },
            &ctx,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidCacheState {
            expected: 4,
            found: 3
        }
    ));
}

#[test]
fn encoder_block_rejects_cached_states() {
    let engine = tiny_engine(4);
    let x = random_tensor(&[1, 1, 8], 6);
    let past: Vec<Tensor> = (0..2).map(|i| random_tensor(&[1, 2, 2, 4], i)).collect();
    let err = engine.encoder.blocks[0]
        .forward(
            BlockInput {
                past: Some(&past),
                ..BlockInput::new(&x)
            },
            &RunContext::eval(DType::F32),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
}

#[test]
fn decoder_present_carries_cross_states_only_with_encoder() {
    let engine = tiny_engine(5);
    let ctx = RunContext::eval(DType::F32);
    let x = random_tensor(&[1, 2, 8], 7);
    let enc = random_tensor(&[1, 3, 8], 8);
    let block = &engine.decoder.blocks[0];

    let with_enc = block
        .forward(
            BlockInput {
                encoder_hidden_states: Some(&enc),
                use_cache: true,
                ..BlockInput::new(&x)
            },
            &ctx,
        )
        .unwrap();
    let states = with_enc.present.expect("present").to_states();
    assert_eq!(states.len(), 4);
    assert_eq!(states[0].shape(), vec![1, 2, 2, 4]);
    assert_eq!(states[2].shape(), vec![1, 2, 3, 4]);
    assert!(with_enc.cross_position_bias.is_some());

    let alone = block
        .forward(
            BlockInput {
                use_cache: true,
                ..BlockInput::new(&x)
            },
            &ctx,
        )
        .unwrap();
    assert_eq!(alone.present.expect("present").to_states().len(), 2);
    assert!(alone.cross_position_bias.is_none());
}

#[test]
fn half_precision_overflow_is_clamped() {
    init_logger();
    // Attention contributes nothing; the feed-forward output overflows f16.
    let mut factory = |site: ProjectionSite, fan_in: usize, fan_out: usize| -> Box<dyn GatedProjection> {
        match site.kind {
            ProjectionKind::FfIn => FixedProjection::filled(fan_in, fan_out, 1.0),
            ProjectionKind::FfOut => FixedProjection::filled(fan_in, fan_out, 1.0e4),
            _ => FixedProjection::filled(fan_in, fan_out, 0.0),
        }
    };
    let mut rng = StdRng::seed_from_u64(6);
    let config = T5Config {
        dtype: DType::F16,
        ..T5Config::tiny(10)
    };
    let engine = Seq2SeqEngine::with_projections(config, &mut rng, &mut factory).unwrap();

    let x = Tensor::new(ArrayD::ones(IxDyn(&[1, 2, 8])), false);
    let out = engine.encoder.blocks[0]
        .forward(BlockInput::new(&x), &RunContext::eval(DType::F16))
        .unwrap();

    let limit = DType::F16.max_finite() - 1000.0;
    let h = out.hidden_states;
    assert!(!h.has_inf());
    assert_eq!(h.dtype(), DType::F16);
    // The clamped value is itself stored at f16 resolution (spacing 32 here).
    assert!(h.array().iter().all(|&v| (v - limit).abs() <= 32.0));

    // Full precision leaves the same values unclamped.
    let wide = engine.encoder.blocks[0]
        .forward(BlockInput::new(&x), &RunContext::eval(DType::F32))
        .unwrap();
    assert!(wide.hidden_states.array().iter().all(|&v| v > limit));
}
