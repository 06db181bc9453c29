use super::common::{assert_close, init_logger, random_tensor, tiny_engine};
use crate::device::{Device, DeviceMap};
use crate::dtype::DType;
use crate::error::Error;
use crate::nn::kv_cache::LayerPast;
use crate::nn::{Module, RunContext, StackInput};
use ndarray::{array, s};

#[test]
fn ids_and_embeddings_are_mutually_exclusive() {
    let engine = tiny_engine(0);
    let ctx = RunContext::eval(DType::F32);
    let ids = array![[1usize, 2, 3]];
    let embeds = random_tensor(&[1, 3, 8], 1);

    let both = engine
        .encoder
        .forward(
            StackInput {
                input_ids: Some(&ids),
                inputs_embeds: Some(&embeds),
                ..StackInput::empty()
            },
            &engine.shared,
            &ctx,
        )
        .unwrap_err();
    assert!(matches!(both, Error::AmbiguousInputBoth { side: "" }));

    let neither = engine
        .decoder
        .forward(StackInput::empty(), &engine.shared, &ctx)
        .unwrap_err();
    assert!(matches!(
        neither,
        Error::AmbiguousInputNeither { side: "decoder_" }
    ));
    assert!(neither.is_ambiguous_input());
    assert!(neither.to_string().contains("decoder_input_ids"));
}

#[test]
fn encoder_refuses_use_cache() {
    let engine = tiny_engine(1);
    let ids = array![[1usize, 2]];
    let err = engine
        .encoder
        .forward(
            StackInput {
                use_cache: true,
                ..StackInput::ids(&ids)
            },
            &engine.shared,
            &RunContext::eval(DType::F32),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
}

#[test]
fn cache_must_cover_every_layer() {
    let engine = tiny_engine(2);
    let ids = array![[4usize]];
    let enc = random_tensor(&[1, 3, 8], 3);
    let one_layer: Vec<LayerPast> = vec![Vec::new()];
    let err = engine
        .decoder
        .forward(
            StackInput {
                encoder_hidden_states: Some(&enc),
                past_key_values: Some(&one_layer),
                use_cache: true,
                ..StackInput::ids(&ids)
            },
            &engine.shared,
            &RunContext::eval(DType::F32),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidCacheState {
            expected: 2,
            found: 1
        }
    ));
}

#[test]
fn incremental_decode_matches_full_pass() {
    init_logger();
    let engine = tiny_engine(4);
    let ctx = RunContext::eval(DType::F32);
    let enc = random_tensor(&[1, 3, 8], 5);
    let ids = array![[0usize, 4, 7, 2]];

    let full = engine
        .decoder
        .forward(
            StackInput {
                encoder_hidden_states: Some(&enc),
                ..StackInput::ids(&ids)
            },
            &engine.shared,
            &ctx,
        )
        .unwrap()
        .last_hidden_state
        .array();

    let mut past: Option<Vec<LayerPast>> = None;
    for t in 0..ids.ncols() {
        let step = ids.slice(s![.., t..t + 1]).to_owned();
        let out = engine
            .decoder
            .forward(
                StackInput {
                    encoder_hidden_states: Some(&enc),
                    past_key_values: past.as_deref(),
                    use_cache: true,
                    ..StackInput::ids(&step)
                },
                &engine.shared,
                &ctx,
            )
            .unwrap();
        let row = out.last_hidden_state.array();
        assert_eq!(row.shape(), &[1, 1, 8]);
        let expected = full.slice(s![.., t..t + 1, ..]).to_owned().into_dyn();
        assert_close(&row, &expected, 1e-4);

        let presents = out.past_key_values.expect("decoder cache");
        assert_eq!(presents.len(), 2);
        assert!(presents.iter().all(|layer| layer.len() == 4));
        assert_eq!(presents[0][0].shape()[2], t + 1);
        past = Some(presents);
    }
}

#[test]
fn collected_outputs_have_expected_lengths() {
    let engine = tiny_engine(6);
    let ctx = RunContext::eval(DType::F32);
    let ids = array![[1usize, 2, 3]];
    let enc_out = engine
        .encoder
        .forward(
            StackInput {
                output_hidden_states: true,
                output_attentions: true,
                ..StackInput::ids(&ids)
            },
            &engine.shared,
            &ctx,
        )
        .unwrap();
    let hidden = enc_out.hidden_states.unwrap();
    assert_eq!(hidden.len(), 3);
    assert!(hidden[2] == enc_out.last_hidden_state);
    assert_eq!(enc_out.attentions.unwrap().len(), 2);
    assert!(enc_out.cross_attentions.is_none());
    assert!(enc_out.past_key_values.is_none());

    let dec_ids = array![[0usize, 5]];
    let dec_out = engine
        .decoder
        .forward(
            StackInput {
                encoder_hidden_states: Some(&enc_out.last_hidden_state),
                output_attentions: true,
                ..StackInput::ids(&dec_ids)
            },
            &engine.shared,
            &ctx,
        )
        .unwrap();
    let cross = dec_out.cross_attentions.unwrap();
    assert_eq!(cross.len(), 2);
    assert_eq!(cross[0].shape(), vec![1, 2, 2, 3]);
    assert_eq!(dec_out.attentions.unwrap()[1].shape(), vec![1, 2, 2, 2]);
}

#[test]
fn head_mask_shape_is_checked() {
    let engine = tiny_engine(7);
    let ids = array![[1usize, 2]];
    let bad = random_tensor(&[3, 2], 8);
    let err = engine
        .encoder
        .forward(
            StackInput {
                head_mask: Some(&bad),
                ..StackInput::ids(&ids)
            },
            &engine.shared,
            &RunContext::eval(DType::F32),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Shape(_)));
}

#[test]
fn checkpointing_reproduces_values_and_gradients() {
    init_logger();
    let mut engine = tiny_engine(9);
    // Dropout is on: both runs must draw the same masks.
    let ctx = RunContext {
        training: true,
        dropout_rate: 0.2,
        dtype: DType::F32,
        seed: 11,
    };
    let ids = array![[1usize, 5, 3, 8]];
    let params = engine.encoder.parameters();

    let run = |engine: &crate::nn::Seq2SeqEngine| {
        let out = engine
            .encoder
            .forward(StackInput::ids(&ids), &engine.shared, &ctx)
            .unwrap()
            .last_hidden_state;
        out.sum().backward();
        out.array()
    };

    let direct = run(&engine);
    let direct_grads: Vec<_> = params.iter().map(|p| p.grad()).collect();
    let direct_table = engine.shared.weight.grad().unwrap();
    for p in &params {
        p.zero_grad();
    }
    engine.shared.weight.zero_grad();

    engine.set_gradient_checkpointing(true);
    let replayed = run(&engine);
    assert_close(&replayed, &direct, 1e-5);
    for (p, g) in params.iter().zip(&direct_grads) {
        match (p.grad(), g) {
            (Some(a), Some(b)) => assert_close(&a, b, 1e-4),
            (a, b) => assert_eq!(a.is_some(), b.is_some()),
        }
    }
    assert_close(&engine.shared.weight.grad().unwrap(), &direct_table, 1e-4);
}

#[test]
fn checkpointing_disables_the_cache() {
    let mut engine = tiny_engine(10);
    engine.set_gradient_checkpointing(true);
    let ctx = RunContext {
        training: true,
        ..RunContext::eval(DType::F32)
    };
    let ids = array![[0usize, 3]];
    let enc = random_tensor(&[1, 2, 8], 12);
    let out = engine
        .decoder
        .forward(
            StackInput {
                encoder_hidden_states: Some(&enc),
                use_cache: true,
                output_attentions: true,
                ..StackInput::ids(&ids)
            },
            &engine.shared,
            &ctx,
        )
        .unwrap();
    assert!(out.past_key_values.is_none());
    assert!(out.attentions.unwrap().is_empty());
}

#[test]
fn parallelized_stack_matches_single_device() {
    let mut engine = tiny_engine(13);
    let ctx = RunContext::eval(DType::F32);
    let ids = array![[2usize, 4, 6]];
    let single = engine
        .encoder
        .forward(StackInput::ids(&ids), &engine.shared, &ctx)
        .unwrap()
        .last_hidden_state;
    assert_eq!(single.device(), Device::Cpu);

    let map = DeviceMap::balanced(&[Device::Accel(0), Device::Accel(1)], 2).unwrap();
    engine.encoder.parallelize(map);
    assert_eq!(
        engine.encoder.blocks[1].parameters()[0].device(),
        Device::Accel(1)
    );
    let split = engine
        .encoder
        .forward(StackInput::ids(&ids), &engine.shared, &ctx)
        .unwrap()
        .last_hidden_state;
    assert_eq!(split.device(), Device::Accel(1));
    assert_close(&split.array(), &single.array(), 1e-6);

    engine.encoder.deparallelize();
    assert!(engine.encoder.device_map().is_none());
    assert!(engine
        .encoder
        .parameters()
        .iter()
        .all(|p| p.device() == Device::Cpu));
}
