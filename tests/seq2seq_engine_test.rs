use gated_t5::nn::seq2seq::shift_right;
use gated_t5::nn::gated_linear::{GatedLinear, GatedProjection, ProjectionSite};
use gated_t5::nn::{
    Adam, GateBundle, LayerGates, Module, Optimizer, Seq2SeqEngine, Seq2SeqInput, SGD,
};
use gated_t5::tensor::Tensor;
use gated_t5::{Error, ForwardFlags, T5Config};
use ndarray::{array, Array2, ArrayD, Ix2, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};

fn engine(config: T5Config, seed: u64) -> Seq2SeqEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = StdRng::seed_from_u64(seed);
    Seq2SeqEngine::new(config, &mut rng).expect("engine")
}

fn approx_eq(a: &[f32], b: &[f32], tol: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tol)
}

fn flat(t: &Tensor) -> Vec<f32> {
    t.array().iter().copied().collect()
}

#[test]
fn one_training_step_lowers_the_loss() {
    let mut model = engine(T5Config::tiny(10), 0);
    model.train();
    let ids = array![[1usize, 2, 3, 4]];
    let labels = array![[2i64, 3, 4, 5]];
    let input = Seq2SeqInput {
        input_ids: Some(&ids),
        labels: Some(&labels),
        ..Default::default()
    };

    let out = model.forward(input).unwrap();
    assert_eq!(out.logits.shape(), vec![1, 4, 10]);
    let loss = out.loss.expect("labels give a loss");
    let before = loss.array().sum();
    assert!(before.is_finite() && before > 0.0);

    let params = model.parameters();
    loss.backward();
    assert!(model.shared.weight.grad().is_some());
    let mut opt = SGD::new(0.05, 0.0);
    opt.step(&params);
    opt.zero_grad(&params);

    let after = model.forward(input).unwrap().loss.unwrap().array().sum();
    assert!(after < before, "loss went from {} to {}", before, after);
}

#[test]
fn gated_step_on_projection_parameters_lowers_the_loss() {
    let _ = env_logger::builder().is_test(true).try_init();
    let projection_params: Arc<Mutex<Vec<Tensor>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = projection_params.clone();
    let mut proj_rng = StdRng::seed_from_u64(11);
    let mut factory = move |_: ProjectionSite, fan_in: usize, fan_out: usize| {
        let proj = GatedLinear::new(fan_in, fan_out, 2, &mut proj_rng);
        sink.lock().unwrap().extend(GatedProjection::parameters(&proj));
        Box::new(proj) as Box<dyn GatedProjection>
    };
    let mut rng = StdRng::seed_from_u64(10);
    let model =
        Seq2SeqEngine::with_projections(T5Config::tiny(10), &mut rng, &mut factory).unwrap();
    let params = projection_params.lock().unwrap().clone();

    // Two encoder and two decoder layers, each gating (q, k, v, o, w_in, w_out).
    let gates = GateBundle::new(
        (0..4)
            .map(|_| {
                LayerGates::new(
                    (0..6)
                        .map(|_| Tensor::new(ArrayD::from_elem(IxDyn(&[2]), 0.5), true))
                        .collect(),
                )
            })
            .collect(),
    );
    let ids = array![[1usize, 2, 3, 4]];
    let labels = array![[2i64, 3, 4, 5]];
    let input = Seq2SeqInput {
        input_ids: Some(&ids),
        labels: Some(&labels),
        gates: Some(&gates),
        ..Default::default()
    };

    let loss = model.forward(input).unwrap().loss.unwrap();
    let before = loss.array().sum();
    let embedding = model.shared.weight.array();
    loss.backward();
    assert!(params.iter().any(|p| p.grad().is_some()));

    let mut opt = Adam::new(1e-3, 0.9, 0.999, 1e-8);
    opt.step(&params);
    opt.zero_grad(&params);

    assert_eq!(model.shared.weight.array(), embedding);
    let after = model.forward(input).unwrap().loss.unwrap().array().sum();
    assert!(after < before, "loss went from {} to {}", before, after);
}

#[test]
fn tied_head_rescales_before_projecting() {
    let model = engine(T5Config::tiny(10), 1);
    let ids = array![[3usize, 1, 4]];
    let dec = array![[0usize, 5]];
    let out = model
        .forward(Seq2SeqInput {
            input_ids: Some(&ids),
            decoder_input_ids: Some(&dec),
            flags: ForwardFlags {
                output_hidden_states: Some(true),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

    let states = out.decoder_hidden_states.unwrap();
    let last = states.last().unwrap().array();
    let hidden = last.into_shape_with_order((2, 8)).unwrap();
    let table = model.shared.weight.array().into_dimensionality::<Ix2>().unwrap();
    let expected = hidden.dot(&table.t()) * (8.0f32).powf(-0.5);
    assert!(approx_eq(
        &flat(&out.logits),
        &expected.iter().copied().collect::<Vec<_>>(),
        1e-5
    ));
}

#[test]
fn untied_head_uses_its_own_weight() {
    let config = T5Config {
        tie_word_embeddings: false,
        ..T5Config::tiny(10)
    };
    let model = engine(config, 2);
    let head = model.lm_head.as_ref().expect("untied head");
    let ids = array![[3usize, 1]];
    let dec = array![[0usize]];
    let out = model
        .forward(Seq2SeqInput {
            input_ids: Some(&ids),
            decoder_input_ids: Some(&dec),
            flags: ForwardFlags {
                output_hidden_states: Some(true),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
    let last = out.decoder_hidden_states.unwrap().pop().unwrap().array();
    let hidden = last.into_shape_with_order((1, 8)).unwrap();
    let w = head.weight.array().into_dimensionality::<Ix2>().unwrap();
    let expected: Vec<f32> = hidden.dot(&w).iter().copied().collect();
    assert!(approx_eq(&flat(&out.logits), &expected, 1e-5));
    assert!(model
        .named_parameters("")
        .iter()
        .any(|(name, _)| name == "lm_head.weight"));
}

#[test]
fn labels_with_cache_are_rejected() {
    let model = engine(T5Config::tiny(10), 3);
    let ids = array![[1usize, 2]];
    let dec = array![[0usize]];
    let first = model
        .forward(Seq2SeqInput {
            input_ids: Some(&ids),
            decoder_input_ids: Some(&dec),
            ..Default::default()
        })
        .unwrap();
    let past = first.past_key_values.expect("use_cache defaults on");
    let labels = array![[4i64]];
    let err = model
        .forward(Seq2SeqInput {
            input_ids: Some(&ids),
            labels: Some(&labels),
            past_key_values: Some(&past),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCombination(_)));
}

#[test]
fn shift_right_prepends_start_and_pads_ignored() {
    let labels = array![[5i64, -100, 7], [2, 3, -100]];
    let shifted = shift_right(&labels, 9, 0).unwrap();
    assert_eq!(shifted, array![[9usize, 5, 0], [9, 2, 3]]);

    let bad = array![[-3i64, 1]];
    assert!(matches!(
        shift_right(&bad, 0, 0),
        Err(Error::InvalidConfiguration(_))
    ));
}

#[test]
fn ignored_labels_do_not_count() {
    let model = engine(T5Config::tiny(10), 4);
    let ids = array![[1usize, 2, 3]];
    let all_ignored = Array2::from_elem((1, 3), -100i64);
    let out = model
        .forward(Seq2SeqInput {
            input_ids: Some(&ids),
            labels: Some(&all_ignored),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(out.loss.unwrap().array().sum(), 0.0);
}

#[test]
fn encoder_head_mask_is_copied_to_the_decoder() {
    let model = engine(T5Config::tiny(10), 5);
    let ids = array![[1usize, 2, 3]];
    let dec = array![[0usize, 4]];
    let silenced = Tensor::new(ndarray::ArrayD::zeros(ndarray::IxDyn(&[2, 2])), false);
    let out = model
        .forward(Seq2SeqInput {
            input_ids: Some(&ids),
            decoder_input_ids: Some(&dec),
            head_mask: Some(&silenced),
            flags: ForwardFlags {
                output_attentions: Some(true),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
    for w in out.decoder_attentions.unwrap() {
        assert!(w.array().iter().all(|&v| v == 0.0));
    }
    // Cross-attention has its own mask and stays untouched.
    for w in out.cross_attentions.unwrap() {
        assert!(w.array().iter().any(|&v| v > 0.0));
    }
}

#[test]
fn precomputed_encoder_outputs_skip_the_encoder() {
    let model = engine(T5Config::tiny(10), 6);
    let ids = array![[1usize, 2, 3]];
    let dec = array![[0usize, 7]];
    let input = Seq2SeqInput {
        input_ids: Some(&ids),
        decoder_input_ids: Some(&dec),
        ..Default::default()
    };
    let direct = model.forward(input).unwrap();
    let encoded = model.encode(&input).unwrap();
    let reused = model
        .forward(Seq2SeqInput {
            input_ids: None,
            encoder_outputs: Some(&encoded),
            ..input
        })
        .unwrap();
    assert!(approx_eq(&flat(&direct.logits), &flat(&reused.logits), 1e-6));
    assert!(reused.encoder_last_hidden_state == encoded.last_hidden_state);
}

#[test]
fn missing_encoder_input_is_ambiguous() {
    let model = engine(T5Config::tiny(10), 7);
    let dec = array![[0usize]];
    let err = model
        .forward(Seq2SeqInput {
            decoder_input_ids: Some(&dec),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::AmbiguousInputNeither { side: "" }));
}

#[test]
fn checkpointed_training_matches_plain_loss() {
    let mut plain = engine(T5Config::tiny(10), 8);
    let mut ckpt = engine(T5Config::tiny(10), 8);
    plain.train();
    ckpt.train();
    ckpt.set_gradient_checkpointing(true);

    let ids = array![[1usize, 2, 3, 4]];
    let labels = array![[2i64, 3, 4, 5]];
    let input = Seq2SeqInput {
        input_ids: Some(&ids),
        labels: Some(&labels),
        ..Default::default()
    };
    let a = plain.forward(input).unwrap();
    let b = ckpt.forward(input).unwrap();
    assert!(b.past_key_values.is_none());
    assert!((a.loss.as_ref().unwrap().array().sum() - b.loss.as_ref().unwrap().array().sum()).abs() < 1e-5);

    a.loss.unwrap().backward();
    b.loss.unwrap().backward();
    let ga = plain.decoder.blocks[1].parameters()[0].grad().unwrap();
    let gb = ckpt.decoder.blocks[1].parameters()[0].grad().unwrap();
    assert!(approx_eq(
        &ga.iter().copied().collect::<Vec<_>>(),
        &gb.iter().copied().collect::<Vec<_>>(),
        1e-4
    ));
}
