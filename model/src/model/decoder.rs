use ndarray::{concatenate, s, Array2, ArrayView1, Axis};
use rand::Rng;
use tracing::{debug, info};

use super::capsule::ClassCapsules;
use super::config::{Activation, ClassInput, DecoderStrategy, ReconstructionConfig, ZeroedBackground};
use super::error::{ensure_shape, CapsError, Result};
use super::layers::{Dense, Regularized};
use super::votes::POSE_DIM;

/// Perceptron X -> Y (optionnel) -> H*W*C, sortie sigmoïde
pub struct Mlp {
    pub layers: Vec<Dense>,
}

impl Mlp {
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        recon: &ReconstructionConfig,
        out_features: usize,
        l2_lambda: f32,
        rng: &mut R,
    ) -> Self {
        let hidden = recon.hidden_activation();
        let mut layers = vec![Dense::new(in_features, recon.hidden_x, hidden, l2_lambda, rng)];
        let mut width = recon.hidden_x;

        if recon.hidden_y > 0 {
            layers.push(Dense::new(width, recon.hidden_y, hidden, l2_lambda, rng));
            width = recon.hidden_y;
        }
        layers.push(Dense::new(width, out_features, Activation::Sigmoid, l2_lambda, rng));

        Self { layers }
    }

    pub fn in_features(&self) -> usize {
        self.layers.first().map_or(0, Dense::in_features)
    }

    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        self.layers
            .iter()
            .fold(input.clone(), |x, layer| layer.forward(&x.view()))
    }
}

impl Regularized for Mlp {
    fn l2_penalty(&self) -> Option<f32> {
        let penalties: Vec<f32> = self.layers.iter().filter_map(Dense::l2_penalty).collect();
        (!penalties.is_empty()).then(|| penalties.iter().sum())
    }
}

/// Sorties du décodeur, [B, H*W*C]
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    pub decoder_out: Array2<f32>,
    pub zeroed_bg_decoder_out: Option<Array2<f32>>,
    pub class_out: Option<Array2<f32>>,
    pub bg_out: Option<Array2<f32>>,
}

/// Décodeur de reconstruction, stratégie fixée à la construction
pub struct ReconstructionDecoder {
    pub strategy: DecoderStrategy,
    pub zeroed_background: ZeroedBackground,
    pub num_classes: usize,
    pub num_bg_classes: usize,
    /// Décodeur unique (legacy) ou décodeur de classe
    pub main: Mlp,
    /// Décodeur de fond de l'architecture séparée
    pub background: Option<Mlp>,
}

impl ReconstructionDecoder {
    pub fn new<R: Rng + ?Sized>(
        recon: &ReconstructionConfig,
        num_classes: usize,
        num_bg_classes: usize,
        output_size: usize,
        l2_lambda: f32,
        rng: &mut R,
    ) -> Result<Self> {
        if output_size == 0 || num_classes == 0 {
            return Err(CapsError::Config(
                "décodeur: taille de sortie et nombre de classes doivent être > 0".to_string(),
            ));
        }

        let bg_prefix = num_bg_classes * POSE_DIM;
        let (main_in, background) = match recon.strategy {
            DecoderStrategy::MaskedClassOnly => (bg_prefix + POSE_DIM, None),
            DecoderStrategy::WeightedMultiClass => (bg_prefix + num_classes * POSE_DIM, None),
            DecoderStrategy::ClassPlusBackground { class_input } => {
                let class_in = match class_input {
                    ClassInput::Masked => POSE_DIM,
                    ClassInput::Weighted => num_classes * (POSE_DIM + 1),
                };
                let background = (num_bg_classes > 0).then(|| {
                    Mlp::new(num_bg_classes * (POSE_DIM + 1), recon, output_size, l2_lambda, rng)
                });
                (class_in, background)
            }
        };
        let main = Mlp::new(main_in, recon, output_size, l2_lambda, rng);

        info!(
            strategy = ?recon.strategy,
            input = main_in,
            background_input = background.as_ref().map(Mlp::in_features),
            output = output_size,
            "décodeur de reconstruction"
        );

        Ok(Self {
            strategy: recon.strategy,
            zeroed_background: recon.zeroed_background,
            num_classes,
            num_bg_classes,
            main,
            background,
        })
    }

    /// Classe décodée par exemple: label si fourni, sinon arg-max des scores
    pub fn selected_classes(
        &self,
        scores: &Array2<f32>,
        labels: Option<&ArrayView1<usize>>,
    ) -> Result<Vec<usize>> {
        match labels {
            Some(labels) => labels
                .iter()
                .map(|&label| {
                    if label < self.num_classes {
                        Ok(label)
                    } else {
                        Err(CapsError::LabelOutOfRange { label, num_classes: self.num_classes })
                    }
                })
                .collect(),
            None => Ok(scores.outer_iter().map(|row| argmax(&row)).collect()),
        }
    }

    pub fn forward(
        &self,
        class: &ClassCapsules,
        background: Option<&ClassCapsules>,
        labels: Option<&ArrayView1<usize>>,
    ) -> Result<DecoderOutput> {
        let batch_size = class.pose.dim().0;
        ensure_shape("decoder", &[batch_size, self.num_classes, POSE_DIM], class.pose.shape())?;
        let background = match (self.num_bg_classes, background) {
            (0, _) => None,
            (nbg, Some(bg)) => {
                ensure_shape("decoder/background", &[batch_size, nbg, POSE_DIM], bg.pose.shape())?;
                Some(bg)
            }
            (_, None) => return Err(CapsError::MissingOutput("background_caps")),
        };

        let selected = self.selected_classes(&class.activation, labels)?;

        let output = match self.strategy {
            DecoderStrategy::MaskedClassOnly | DecoderStrategy::WeightedMultiClass => {
                let class_input = if self.strategy == DecoderStrategy::MaskedClassOnly {
                    masked_pose(class, &selected)
                } else {
                    weighted_poses(class)
                };
                let input = match background {
                    Some(bg) => concatenate![Axis(1), weighted_poses(bg), class_input],
                    None => class_input.clone(),
                };
                let decoder_out = self.main.forward(&input);

                let zeroed_bg_decoder_out = match (self.zeroed_background, background) {
                    (ZeroedBackground::Redecode, Some(bg)) => {
                        let zeros = Array2::zeros((batch_size, bg.pose.dim().1 * POSE_DIM));
                        Some(self.main.forward(&concatenate![Axis(1), zeros, class_input]))
                    }
                    _ => None,
                };

                DecoderOutput {
                    decoder_out,
                    zeroed_bg_decoder_out,
                    class_out: None,
                    bg_out: None,
                }
            }
            DecoderStrategy::ClassPlusBackground { class_input } => {
                let input = match class_input {
                    ClassInput::Masked => masked_pose(class, &selected),
                    ClassInput::Weighted => activations_and_poses(class),
                };
                let class_out = self.main.forward(&input);

                let bg_out = match (&self.background, background) {
                    (Some(decoder), Some(bg)) => Some(decoder.forward(&activations_and_poses(bg))),
                    _ => None,
                };
                // class_out et bg_out ne sont exposés qu'avec des capsules de fond
                match bg_out {
                    Some(bg_out) => DecoderOutput {
                        decoder_out: &class_out + &bg_out,
                        zeroed_bg_decoder_out: (self.zeroed_background
                            == ZeroedBackground::AliasClassOutput)
                            .then(|| class_out.clone()),
                        class_out: Some(class_out),
                        bg_out: Some(bg_out),
                    },
                    None => DecoderOutput {
                        decoder_out: class_out,
                        zeroed_bg_decoder_out: None,
                        class_out: None,
                        bg_out: None,
                    },
                }
            }
        };

        debug!(
            decoder_out = ?output.decoder_out.shape(),
            zeroed = output.zeroed_bg_decoder_out.is_some(),
            "reconstruction"
        );
        Ok(output)
    }
}

impl Regularized for ReconstructionDecoder {
    fn l2_penalty(&self) -> Option<f32> {
        match (self.main.l2_penalty(), self.background.as_ref().and_then(Mlp::l2_penalty)) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        }
    }
}

fn argmax(row: &ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max { (i, v) } else { (best, max) }
        })
        .0
}

/// Pose de la classe sélectionnée, [B, 16]
fn masked_pose(caps: &ClassCapsules, selected: &[usize]) -> Array2<f32> {
    let mut out = Array2::zeros((selected.len(), POSE_DIM));
    for (b, &class) in selected.iter().enumerate() {
        out.row_mut(b).assign(&caps.pose.slice(s![b, class, ..]));
    }
    out
}

/// Poses pondérées par leur activation, aplaties [B, C*16]
fn weighted_poses(caps: &ClassCapsules) -> Array2<f32> {
    let (batch_size, num_caps, _) = caps.pose.dim();
    let weighted = &caps.pose * &caps.activation.view().insert_axis(Axis(2));
    Array2::from_shape_fn((batch_size, num_caps * POSE_DIM), |(b, k)| {
        weighted[[b, k / POSE_DIM, k % POSE_DIM]]
    })
}

/// [activations, poses] concaténés sur l'axe des caractéristiques, [B, C*17]
fn activations_and_poses(caps: &ClassCapsules) -> Array2<f32> {
    let (batch_size, num_caps, _) = caps.pose.dim();
    let poses = Array2::from_shape_fn((batch_size, num_caps * POSE_DIM), |(b, k)| {
        caps.pose[[b, k / POSE_DIM, k % POSE_DIM]]
    });
    concatenate![Axis(1), caps.activation, poses]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn caps(batch: usize, n: usize, seed: u64) -> ClassCapsules {
        let mut rng = StdRng::seed_from_u64(seed);
        ClassCapsules {
            pose: Array3::from_shape_fn((batch, n, POSE_DIM), |_| rng.gen::<f32>() - 0.5),
            activation: Array2::from_shape_fn((batch, n), |_| rng.gen::<f32>()),
        }
    }

    fn recon(strategy: DecoderStrategy, zeroed: ZeroedBackground) -> ReconstructionConfig {
        ReconstructionConfig {
            strategy,
            hidden_x: 8,
            hidden_y: 6,
            zeroed_background: zeroed,
            ..ReconstructionConfig::default()
        }
    }

    #[test]
    fn test_masked_decoder_uses_label_then_argmax() {
        let mut rng = StdRng::seed_from_u64(30);
        let config = recon(DecoderStrategy::MaskedClassOnly, ZeroedBackground::Disabled);
        let decoder = ReconstructionDecoder::new(&config, 3, 0, 12, 0.0, &mut rng).unwrap();
        let class = caps(2, 3, 1);

        let labels = array![2usize, 0];
        assert_eq!(decoder.selected_classes(&class.activation, Some(&labels.view())).unwrap(), vec![2, 0]);

        let scores = array![[0.1, 0.7, 0.2], [0.9, 0.05, 0.05]];
        assert_eq!(decoder.selected_classes(&scores, None).unwrap(), vec![1, 0]);

        let output = decoder.forward(&class, None, Some(&labels.view())).unwrap();
        assert_eq!(output.decoder_out.dim(), (2, 12));
        assert!(output.decoder_out.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(output.zeroed_bg_decoder_out.is_none());
        assert!(output.class_out.is_none());
    }

    #[test]
    fn test_label_out_of_range() {
        let mut rng = StdRng::seed_from_u64(31);
        let config = recon(DecoderStrategy::MaskedClassOnly, ZeroedBackground::Disabled);
        let decoder = ReconstructionDecoder::new(&config, 3, 0, 4, 0.0, &mut rng).unwrap();
        let labels = array![5usize, 0];

        assert!(matches!(
            decoder.forward(&caps(2, 3, 2), None, Some(&labels.view())),
            Err(CapsError::LabelOutOfRange { label: 5, num_classes: 3 })
        ));
    }

    #[test]
    fn test_weighted_legacy_with_background_redecode() {
        let mut rng = StdRng::seed_from_u64(32);
        let config = recon(DecoderStrategy::WeightedMultiClass, ZeroedBackground::Redecode);
        let decoder = ReconstructionDecoder::new(&config, 3, 2, 10, 0.0, &mut rng).unwrap();
        assert_eq!(decoder.main.in_features(), 2 * POSE_DIM + 3 * POSE_DIM);

        let output = decoder.forward(&caps(2, 3, 3), Some(&caps(2, 2, 4)), None).unwrap();
        let zeroed = output.zeroed_bg_decoder_out.unwrap();
        assert_eq!(zeroed.dim(), (2, 10));
        assert_ne!(zeroed, output.decoder_out);
    }

    #[test]
    fn test_class_plus_background_sums_outputs() {
        let mut rng = StdRng::seed_from_u64(33);
        let strategy = DecoderStrategy::ClassPlusBackground { class_input: ClassInput::Weighted };
        let config = recon(strategy, ZeroedBackground::AliasClassOutput);
        let decoder = ReconstructionDecoder::new(&config, 4, 2, 9, 0.0, &mut rng).unwrap();
        assert_eq!(decoder.main.in_features(), 4 * 17);
        assert_eq!(decoder.background.as_ref().unwrap().in_features(), 2 * 17);

        let output = decoder.forward(&caps(3, 4, 5), Some(&caps(3, 2, 6)), None).unwrap();
        let class_out = output.class_out.unwrap();
        let bg_out = output.bg_out.unwrap();

        for ((&total, &c), &bg) in output.decoder_out.iter().zip(class_out.iter()).zip(bg_out.iter()) {
            assert_abs_diff_eq!(total, c + bg, epsilon = 1e-6);
        }
        assert_eq!(output.zeroed_bg_decoder_out.unwrap(), class_out);
    }

    #[test]
    fn test_class_plus_background_without_background_capsules() {
        let mut rng = StdRng::seed_from_u64(36);
        let strategy = DecoderStrategy::ClassPlusBackground { class_input: ClassInput::Masked };
        let decoder =
            ReconstructionDecoder::new(&recon(strategy, ZeroedBackground::Disabled), 3, 0, 6, 0.0, &mut rng)
                .unwrap();
        assert!(decoder.background.is_none());

        let labels = array![1usize, 2];
        let output = decoder.forward(&caps(2, 3, 9), None, Some(&labels.view())).unwrap();

        assert_eq!(output.decoder_out.dim(), (2, 6));
        assert!(output.class_out.is_none());
        assert!(output.bg_out.is_none());
        assert!(output.zeroed_bg_decoder_out.is_none());
    }

    #[test]
    fn test_missing_background_capsules() {
        let mut rng = StdRng::seed_from_u64(34);
        let config = recon(DecoderStrategy::MaskedClassOnly, ZeroedBackground::Disabled);
        let decoder = ReconstructionDecoder::new(&config, 3, 2, 4, 0.0, &mut rng).unwrap();

        assert!(matches!(
            decoder.forward(&caps(1, 3, 7), None, None),
            Err(CapsError::MissingOutput("background_caps"))
        ));
    }

    #[test]
    fn test_activations_and_poses_layout() {
        let class = caps(1, 2, 8);
        let input = activations_and_poses(&class);

        assert_eq!(input.dim(), (1, 34));
        assert_abs_diff_eq!(input[[0, 1]], class.activation[[0, 1]]);
        assert_abs_diff_eq!(input[[0, 2 + POSE_DIM + 3]], class.pose[[0, 1, 3]]);
    }

    #[test]
    fn test_single_hidden_layer_when_y_is_zero() {
        let mut rng = StdRng::seed_from_u64(35);
        let mut config = recon(DecoderStrategy::MaskedClassOnly, ZeroedBackground::Disabled);
        config.hidden_y = 0;
        let decoder = ReconstructionDecoder::new(&config, 2, 0, 5, 0.3, &mut rng).unwrap();

        assert_eq!(decoder.main.layers.len(), 2);
        assert!(decoder.l2_penalty().unwrap() > 0.0);
    }
}
