use approx::assert_abs_diff_eq;
use capsnet_em::model::config::{
    ClassInput, CnnBaselineConfig, CnnConvSpec, DecoderStrategy, MarginSchedule,
    ReconstructionConfig, ZeroedBackground,
};
use capsnet_em::model::layers::Padding;
use capsnet_em::model::loss::{reconstruction_loss, CrossEntropyLoss, LossFunction, TotalLoss};
use capsnet_em::{CapsError, CapsNet, CapsNetConfig, ModelBuilder, Network};
use ndarray::{array, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn small_config() -> CapsNetConfig {
    CapsNetConfig {
        relu_conv1_filters: 4,
        primary_caps: 2,
        conv_caps1: 2,
        conv_caps2: 2,
        batch_size: 2,
        seed: 7,
        ..CapsNetConfig::default()
    }
}

fn build(config: CapsNetConfig) -> CapsNet {
    ModelBuilder::new()
        .with_config(config)
        .with_input_shape(16, 16, 1)
        .with_num_classes(3)
        .build()
        .unwrap()
}

fn images(seed: u64) -> Array4<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array4::from_shape_fn((2, 16, 16, 1), |_| rng.gen::<f32>())
}

#[test]
fn forward_is_deterministic_under_fixed_seed() {
    let config = CapsNetConfig {
        dropout: true,
        dropconnect: true,
        ..small_config()
    };
    let input = images(1);
    let labels = array![0usize, 2];

    let mut first = build(config.clone());
    let mut second = build(config);
    let a = first.forward(&input.view(), true, Some(&labels.view())).unwrap();
    let b = second.forward(&input.view(), true, Some(&labels.view())).unwrap();

    assert_eq!(a.scores, b.scores);
    assert_eq!(a.pose_out, b.pose_out);
    assert!(a.scores.iter().all(|&s| (0.0..=1.0).contains(&s)));
    assert!(a.pose_out.iter().all(|v| v.is_finite()));
}

#[test]
fn legacy_masked_decoder_outputs() {
    let config = CapsNetConfig {
        reconstruction: Some(ReconstructionConfig {
            hidden_x: 16,
            hidden_y: 32,
            ..ReconstructionConfig::default()
        }),
        ..small_config()
    };
    let mut model = build(config.clone());
    let input = images(2);
    let labels = array![1usize, 0];

    let output = model.forward(&input.view(), false, Some(&labels.view())).unwrap();
    assert_eq!(output.keys(), vec!["scores", "pose_out", "decoder_out", "input"]);

    let decoder_out = output.decoder_out.as_ref().unwrap();
    assert_eq!(decoder_out.dim(), (2, 256));
    assert!(decoder_out.iter().all(|&v| (0.0..=1.0).contains(&v)));

    let breakdown = TotalLoss::from_config(&config)
        .compute(&output, &labels.view(), &model.regularization_losses(), 0)
        .unwrap();
    let recon = reconstruction_loss(&input.view(), &decoder_out.view()).unwrap();
    assert_abs_diff_eq!(breakdown.reconstruction.unwrap(), recon, epsilon = 1e-6);
    assert!(breakdown.regularization.is_none());
    assert!(breakdown.class_bg_distance.is_none());
}

#[test]
fn legacy_decoder_with_zeroed_background() {
    let config = CapsNetConfig {
        num_bg_classes: 2,
        reconstruction: Some(ReconstructionConfig {
            strategy: DecoderStrategy::WeightedMultiClass,
            hidden_x: 16,
            hidden_y: 0,
            zeroed_background: ZeroedBackground::Redecode,
            ..ReconstructionConfig::default()
        }),
        ..small_config()
    };
    let mut model = build(config);

    let output = model.forward(&images(3).view(), false, None).unwrap();
    assert_eq!(
        output.keys(),
        vec!["scores", "pose_out", "decoder_out", "input", "zeroed_bg_decoder_out"]
    );
}

#[test]
fn class_plus_background_outputs_and_loss() {
    let config = CapsNetConfig {
        num_bg_classes: 1,
        weight_reg: true,
        margin: MarginSchedule::constant(0.2),
        reconstruction: Some(ReconstructionConfig {
            strategy: DecoderStrategy::ClassPlusBackground { class_input: ClassInput::Weighted },
            hidden_x: 16,
            hidden_y: 0,
            diff_lambda: 0.5,
            zeroed_background: ZeroedBackground::AliasClassOutput,
            ..ReconstructionConfig::default()
        }),
        ..small_config()
    };
    let mut model = build(config.clone());
    let labels = array![2usize, 1];

    let output = model.forward(&images(4).view(), true, Some(&labels.view())).unwrap();
    assert_eq!(
        output.keys(),
        vec![
            "scores",
            "pose_out",
            "decoder_out",
            "input",
            "zeroed_bg_decoder_out",
            "class_out",
            "bg_out"
        ]
    );
    assert_eq!(output.zeroed_bg_decoder_out, output.class_out);

    let breakdown = TotalLoss::from_config(&config)
        .compute(&output, &labels.view(), &model.regularization_losses(), 10)
        .unwrap();
    assert!(breakdown.regularization.unwrap() > 0.0);
    assert!(breakdown.class_bg_distance.unwrap() <= 0.0);
    let expected = breakdown.classification
        + breakdown.regularization.unwrap()
        + breakdown.reconstruction.unwrap()
        + breakdown.class_bg_distance.unwrap();
    assert_abs_diff_eq!(breakdown.total, expected, epsilon = 1e-6);
}

#[test]
fn invalid_zeroed_background_fails_at_build() {
    let config = CapsNetConfig {
        reconstruction: Some(ReconstructionConfig {
            zeroed_background: ZeroedBackground::Redecode,
            ..ReconstructionConfig::default()
        }),
        ..small_config()
    };
    let result = ModelBuilder::new()
        .with_config(config)
        .with_input_shape(16, 16, 1)
        .with_num_classes(3)
        .build();

    assert!(matches!(result, Err(CapsError::Config(_))));
}

#[test]
fn json_config_builds_network() {
    let json = r#"{ "A": 4, "B": 2, "C": 2, "D": 2, "batch_size": 4, "num_gpus": 2 }"#;
    let config = CapsNetConfig::from_json_str(json).unwrap();
    let mut model = build(config);

    let output = model.forward(&images(5).view(), false, None).unwrap();
    assert_eq!(output.scores.dim(), (2, 3));
}

#[test]
fn cnn_baseline_outputs_and_cross_entropy_loss() {
    let config = CapsNetConfig {
        batch_size: 2,
        seed: 11,
        weight_reg: true,
        cnn: Some(CnnBaselineConfig {
            conv: vec![
                CnnConvSpec::new(4, 5, 2, Padding::Valid, false),
                CnnConvSpec::new(4, 3, 1, Padding::Same, true),
            ],
            hidden: 16,
            ..CnnBaselineConfig::default()
        }),
        reconstruction: Some(ReconstructionConfig {
            hidden_x: 16,
            hidden_y: 0,
            ..ReconstructionConfig::default()
        }),
        ..CapsNetConfig::default()
    };
    let mut model: Box<dyn Network> = Box::new(
        ModelBuilder::new()
            .with_config(config.clone())
            .with_input_shape(16, 16, 1)
            .with_num_classes(3)
            .build_baseline()
            .unwrap(),
    );
    let labels = array![0usize, 1];
    let input = images(6);

    let output = model.forward(&input.view(), true, Some(&labels.view())).unwrap();
    assert_eq!(output.keys(), vec!["scores", "pose_out", "decoder_out", "input"]);
    assert_eq!(output.scores.dim(), (2, 3));
    assert_eq!(output.pose_out.dim(), (2, 3, 16));
    assert_eq!(output.decoder_out.as_ref().unwrap().dim(), (2, 256));

    let breakdown = TotalLoss::from_config(&config)
        .compute(&output, &labels.view(), &model.regularization_losses(), 0)
        .unwrap();
    let cross_entropy = CrossEntropyLoss.compute(&output.scores.view(), &labels.view(), 0).unwrap();
    assert_abs_diff_eq!(breakdown.classification, cross_entropy, epsilon = 1e-6);
    assert!(breakdown.regularization.unwrap() > 0.0);
    assert!(breakdown.reconstruction.is_some());
    assert!(model.num_parameters() > 0);
}
