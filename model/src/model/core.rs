use ndarray::{Array2, Array3, Array4, ArrayView1, ArrayView4};
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use super::{
    capsule::{CapsLayer, ClassCapsLayer, DropContext, PrimaryCapsLayer},
    config::CapsNetConfig,
    decoder::ReconstructionDecoder,
    error::{ensure_shape, CapsError, Result},
    layers::{BatchNorm, ConvLayer, Regularized},
};

/// Dictionnaire de sorties d'une passe avant
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Activations des capsules de classe, [B, classes]
    pub scores: Array2<f32>,
    /// Poses des capsules de classe, [B, classes, 16]
    pub pose_out: Array3<f32>,
    pub decoder_out: Option<Array2<f32>>,
    /// Image d'entrée, présente avec le décodeur
    pub input: Option<Array4<f32>>,
    pub zeroed_bg_decoder_out: Option<Array2<f32>>,
    pub class_out: Option<Array2<f32>>,
    pub bg_out: Option<Array2<f32>>,
}

impl ModelOutput {
    /// Noms des sorties présentes
    pub fn keys(&self) -> Vec<&'static str> {
        let optional = [
            ("decoder_out", self.decoder_out.is_some()),
            ("input", self.input.is_some()),
            ("zeroed_bg_decoder_out", self.zeroed_bg_decoder_out.is_some()),
            ("class_out", self.class_out.is_some()),
            ("bg_out", self.bg_out.is_some()),
        ];

        ["scores", "pose_out"]
            .into_iter()
            .chain(optional.into_iter().filter(|&(_, present)| present).map(|(key, _)| key))
            .collect()
    }

    /// Classe prédite par exemple (arg-max des scores)
    pub fn predictions(&self) -> Vec<usize> {
        self.scores
            .outer_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
                        if v > max { (i, v) } else { (best, max) }
                    })
                    .0
            })
            .collect()
    }
}

/// Réseau évalué par le module de pertes: capsules ou ligne de base CNN
pub trait Network {
    fn forward(
        &mut self,
        input: &ArrayView4<f32>,
        is_train: bool,
        labels: Option<&ArrayView1<usize>>,
    ) -> Result<ModelOutput>;

    /// Pénalités L2 enregistrées par les couches (λ > 0)
    fn regularization_losses(&self) -> Vec<f32>;

    fn num_parameters(&self) -> usize;
}

/// Forme du lot et plage des labels
pub(crate) fn check_batch(
    input: &ArrayView4<f32>,
    labels: Option<&ArrayView1<usize>>,
    expected: [usize; 4],
    num_classes: usize,
) -> Result<()> {
    ensure_shape("input", &expected, input.shape())?;
    if let Some(labels) = labels {
        ensure_shape("labels", &[expected[0]], labels.shape())?;
        if let Some(&label) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(CapsError::LabelOutOfRange { label, num_classes });
        }
    }
    Ok(())
}

/// Réseau de capsules matricielles avec routage EM
pub struct CapsNet {
    pub config: CapsNetConfig,
    /// (hauteur, largeur, canaux)
    pub input_shape: (usize, usize, usize),
    pub num_classes: usize,
    pub batch_norm: BatchNorm,
    pub relu_conv1: ConvLayer,
    pub primary_caps: PrimaryCapsLayer,
    pub conv_caps: Vec<CapsLayer>,
    pub class_caps: ClassCapsLayer,
    pub background_caps: Option<ClassCapsLayer>,
    pub decoder: Option<ReconstructionDecoder>,
    pub rng: StdRng,
}

impl CapsNet {
    /// Passe avant
    ///
    /// `labels` sélectionne la classe reconstruite; sans labels, l'arg-max
    /// des scores est utilisé.
    pub fn forward(
        &mut self,
        input: &ArrayView4<f32>,
        is_train: bool,
        labels: Option<&ArrayView1<usize>>,
    ) -> Result<ModelOutput> {
        let (height, width, channels) = self.input_shape;
        let batch_size = self.config.device_batch_size();
        check_batch(input, labels, [batch_size, height, width, channels], self.num_classes)?;

        let normalized = self.batch_norm.forward(input, is_train);

        let features = self.relu_conv1.forward(&normalized.view());
        let (_, conv_h, conv_w, _) = features.dim();
        ensure_shape(
            "relu_conv1",
            &[batch_size, conv_h, conv_w, self.config.relu_conv1_filters],
            features.shape(),
        )?;
        debug!(shape = ?features.shape(), "relu_conv1");

        let mut grid = self.primary_caps.forward(&features.view())?;

        let rate = self.config.drop_rate;
        let mut drop = (is_train && rate > 0.0).then(|| DropContext { rate, rng: &mut self.rng });

        for layer in &self.conv_caps {
            grid = layer.forward(&grid, drop.as_mut())?;
        }

        let class = self.class_caps.forward(&grid, drop.as_mut())?;
        ensure_shape("class_caps", &[batch_size, self.num_classes], class.activation.shape())?;

        let background = match &self.background_caps {
            Some(layer) => Some(layer.forward(&grid, drop.as_mut())?),
            None => None,
        };

        let mut output = ModelOutput {
            scores: class.activation.clone(),
            pose_out: class.pose.clone(),
            decoder_out: None,
            input: None,
            zeroed_bg_decoder_out: None,
            class_out: None,
            bg_out: None,
        };

        if let Some(decoder) = &self.decoder {
            let decoded = decoder.forward(&class, background.as_ref(), labels)?;
            ensure_shape(
                "decoder_out",
                &[batch_size, height * width * channels],
                decoded.decoder_out.shape(),
            )?;
            output.decoder_out = Some(decoded.decoder_out);
            output.input = Some(input.to_owned());
            output.zeroed_bg_decoder_out = decoded.zeroed_bg_decoder_out;
            output.class_out = decoded.class_out;
            output.bg_out = decoded.bg_out;
        }

        debug!(keys = ?output.keys(), is_train, "passe avant terminée");
        Ok(output)
    }

    /// Pénalités L2 enregistrées par les couches (λ > 0)
    pub fn regularization_losses(&self) -> Vec<f32> {
        let mut layers: Vec<&dyn Regularized> = vec![&self.relu_conv1 as &dyn Regularized, &self.primary_caps];
        layers.extend(self.conv_caps.iter().map(|l| l as &dyn Regularized));
        layers.push(&self.class_caps);
        if let Some(bg) = &self.background_caps {
            layers.push(bg);
        }
        if let Some(decoder) = &self.decoder {
            layers.push(decoder);
        }

        layers.iter().filter_map(|l| l.l2_penalty()).collect()
    }

    /// Nombre de paramètres appris
    pub fn num_parameters(&self) -> usize {
        let conv = |c: &ConvLayer| c.weights.len() + c.biases.len();
        let caps = |l: &CapsLayer| l.transforms.degrees_of_freedom() + 2 * l.ncaps_out();

        let mut total = conv(&self.relu_conv1)
            + conv(&self.primary_caps.pose_conv)
            + conv(&self.primary_caps.activation_conv);
        total += self.conv_caps.iter().map(caps).sum::<usize>();
        total += caps(&self.class_caps.inner);
        total += self.background_caps.as_ref().map_or(0, |l| caps(&l.inner));
        if let Some(decoder) = &self.decoder {
            total += decoder
                .main
                .layers
                .iter()
                .chain(decoder.background.iter().flat_map(|mlp| mlp.layers.iter()))
                .map(|d| d.weights.len() + d.biases.len())
                .sum::<usize>();
        }
        total
    }

    /// Diagnostic rapide: passe avant d'inférence sur une entrée nulle
    pub fn diagnostic(&mut self) -> Result<()> {
        let (height, width, channels) = self.input_shape;
        info!(
            input = ?[self.config.device_batch_size(), height, width, channels],
            conv_caps = self.conv_caps.len(),
            classes = self.num_classes,
            background = self.background_caps.is_some(),
            decoder = ?self.decoder.as_ref().map(|d| d.strategy),
            parameters = self.num_parameters(),
            "diagnostic"
        );

        let zeros = Array4::zeros((self.config.device_batch_size(), height, width, channels));
        let output = self.forward(&zeros.view(), false, None)?;
        info!(keys = ?output.keys(), scores = ?output.scores.shape(), "modèle opérationnel");

        if self.config.weight_reg && self.regularization_losses().is_empty() {
            warn!("weight_reg actif sans couche régularisée");
        }
        Ok(())
    }
}

impl Network for CapsNet {
    fn forward(
        &mut self,
        input: &ArrayView4<f32>,
        is_train: bool,
        labels: Option<&ArrayView1<usize>>,
    ) -> Result<ModelOutput> {
        CapsNet::forward(self, input, is_train, labels)
    }

    fn regularization_losses(&self) -> Vec<f32> {
        CapsNet::regularization_losses(self)
    }

    fn num_parameters(&self) -> usize {
        CapsNet::num_parameters(self)
    }
}
