use ndarray::{Array2, Array3, Array4, ArrayView1, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info};

use super::{
    capsule::ClassCapsules,
    config::{Activation, CapsNetConfig, CnnBaselineConfig, CnnConvSpec},
    core::{check_batch, ModelOutput, Network},
    decoder::ReconstructionDecoder,
    error::{ensure_shape, CapsError, Result},
    layers::{ConvLayer, Dense, MaxPool, Padding, Regularized},
    votes::POSE_DIM,
};

/// Convolution ReLU suivie d'un max-pooling optionnel
pub struct CnnStage {
    pub conv: ConvLayer,
    pub pool: Option<MaxPool>,
}

impl CnnStage {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        spec: &CnnConvSpec,
        cnn: &CnnBaselineConfig,
        rng: &mut R,
    ) -> Self {
        Self {
            conv: ConvLayer::new(
                in_channels,
                spec.filters,
                spec.kernel,
                spec.stride,
                spec.padding,
                Activation::ReLU,
                cnn.weight_decay,
                rng,
            ),
            pool: spec
                .pool
                .then(|| MaxPool::new(cnn.pool_kernel, cnn.pool_stride, Padding::Valid)),
        }
    }

    pub fn output_hw(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let (h, w) = self.conv.output_hw(height, width)?;
        match &self.pool {
            Some(pool) => pool.output_hw(h, w),
            None => Some((h, w)),
        }
    }

    pub fn forward(&self, input: &ArrayView4<f32>) -> Array4<f32> {
        let features = self.conv.forward(input);
        match &self.pool {
            Some(pool) => pool.forward(&features.view()),
            None => features,
        }
    }
}

/// Tête d'une classe: vecteur de classe (16, ReLU) puis logit
pub struct ClassHead {
    pub vector: Dense,
    pub logit: Dense,
}

/// Ligne de base CNN: mêmes sorties que le réseau de capsules, avec des
/// logits pour `scores` et les vecteurs de classe pour `pose_out`
pub struct CnnBaseline {
    pub config: CapsNetConfig,
    pub input_shape: (usize, usize, usize),
    pub num_classes: usize,
    pub stages: Vec<CnnStage>,
    pub fc6: Dense,
    pub fc7: Dense,
    pub heads: Vec<ClassHead>,
    pub drop_rate: f32,
    pub decoder: Option<ReconstructionDecoder>,
    pub rng: StdRng,
}

impl CnnBaseline {
    /// Construit les couches pour une entrée H x W x C
    pub fn new(
        config: CapsNetConfig,
        input_shape: (usize, usize, usize),
        num_classes: usize,
        mut rng: StdRng,
    ) -> Result<Self> {
        let cnn = config
            .cnn
            .clone()
            .ok_or_else(|| CapsError::Config("configuration cnn absente".to_string()))?;
        let (height, width, channels) = input_shape;

        let (mut h, mut w, mut c) = (height, width, channels);
        let mut stages = Vec::with_capacity(cnn.conv.len());
        for (i, spec) in cnn.conv.iter().enumerate() {
            let stage = CnnStage::new(c, spec, &cnn, &mut rng);
            (h, w) = stage.output_hw(h, w).ok_or_else(|| CapsError::Shape {
                context: format!("cnn conv{}: grille spatiale réduite sous 1x1", i + 1),
                expected: vec![spec.kernel, spec.kernel],
                actual: vec![h, w],
            })?;
            c = spec.filters;
            info!(shape = ?[h, w, c], pool = spec.pool, "cnn conv{}", i + 1);
            stages.push(stage);
        }

        let flat = h * w * c;
        let fc6 = Dense::new(flat, cnn.hidden, Activation::ReLU, cnn.weight_decay, &mut rng);
        let fc7 = Dense::new(cnn.hidden, cnn.hidden, Activation::ReLU, cnn.weight_decay, &mut rng);
        let heads = (0..num_classes)
            .map(|_| ClassHead {
                vector: Dense::new(cnn.hidden, POSE_DIM, Activation::ReLU, cnn.weight_decay, &mut rng),
                logit: Dense::new(POSE_DIM, 1, Activation::None, cnn.weight_decay, &mut rng),
            })
            .collect();

        // décodeur hors régularisation
        let decoder = config
            .reconstruction
            .as_ref()
            .map(|recon| {
                ReconstructionDecoder::new(recon, num_classes, 0, height * width * channels, 0.0, &mut rng)
            })
            .transpose()?;

        info!(flat, hidden = cnn.hidden, classes = num_classes, "ligne de base CNN");

        Ok(Self {
            config,
            input_shape,
            num_classes,
            stages,
            fc6,
            fc7,
            heads,
            drop_rate: cnn.drop_rate,
            decoder,
            rng,
        })
    }

    pub fn forward(
        &mut self,
        input: &ArrayView4<f32>,
        is_train: bool,
        labels: Option<&ArrayView1<usize>>,
    ) -> Result<ModelOutput> {
        let (height, width, channels) = self.input_shape;
        let batch_size = self.config.device_batch_size();
        check_batch(input, labels, [batch_size, height, width, channels], self.num_classes)?;

        let mut features = input.to_owned();
        for (i, stage) in self.stages.iter().enumerate() {
            features = stage.forward(&features.view());
            debug!(shape = ?features.shape(), "cnn conv{}", i + 1);
        }

        let flat = features.len() / batch_size.max(1);
        let flat = features
            .into_shape_with_order((batch_size, flat))
            .map_err(|e| CapsError::Config(format!("cnn: aplatissement impossible: {e}")))?;
        ensure_shape("cnn flatten", &[batch_size, self.fc6.in_features()], flat.shape())?;

        let rate = if is_train { self.drop_rate } else { 0.0 };
        let mut hidden = self.fc6.forward(&flat.view());
        dropout(&mut hidden, rate, &mut self.rng);
        hidden = self.fc7.forward(&hidden.view());
        dropout(&mut hidden, rate, &mut self.rng);

        let mut vectors = Array3::zeros((batch_size, self.num_classes, POSE_DIM));
        let mut logits = Array2::zeros((batch_size, self.num_classes));
        for (k, head) in self.heads.iter().enumerate() {
            let vector = head.vector.forward(&hidden.view());
            let logit = head.logit.forward(&vector.view());
            vectors.index_axis_mut(Axis(1), k).assign(&vector);
            logits.column_mut(k).assign(&logit.column(0));
        }

        let mut output = ModelOutput {
            scores: logits,
            pose_out: vectors,
            decoder_out: None,
            input: None,
            zeroed_bg_decoder_out: None,
            class_out: None,
            bg_out: None,
        };

        if let Some(decoder) = &self.decoder {
            // la sélection par arg-max porte sur les logits
            let class = ClassCapsules {
                pose: output.pose_out.clone(),
                activation: output.scores.clone(),
            };
            let decoded = decoder.forward(&class, None, labels)?;
            ensure_shape(
                "decoder_out",
                &[batch_size, height * width * channels],
                decoded.decoder_out.shape(),
            )?;
            output.decoder_out = Some(decoded.decoder_out);
            output.input = Some(input.to_owned());
        }

        debug!(keys = ?output.keys(), is_train, "passe avant CNN terminée");
        Ok(output)
    }

    pub fn regularization_losses(&self) -> Vec<f32> {
        let mut layers: Vec<&dyn Regularized> =
            self.stages.iter().map(|s| &s.conv as &dyn Regularized).collect();
        layers.push(&self.fc6);
        layers.push(&self.fc7);
        for head in &self.heads {
            layers.push(&head.vector);
            layers.push(&head.logit);
        }
        if let Some(decoder) = &self.decoder {
            layers.push(decoder);
        }

        layers.iter().filter_map(|l| l.l2_penalty()).collect()
    }

    pub fn num_parameters(&self) -> usize {
        let dense = |d: &Dense| d.weights.len() + d.biases.len();

        let mut total = self
            .stages
            .iter()
            .map(|s| s.conv.weights.len() + s.conv.biases.len())
            .sum::<usize>();
        total += dense(&self.fc6) + dense(&self.fc7);
        total += self.heads.iter().map(|h| dense(&h.vector) + dense(&h.logit)).sum::<usize>();
        if let Some(decoder) = &self.decoder {
            total += decoder.main.layers.iter().map(dense).sum::<usize>();
        }
        total
    }
}

impl Network for CnnBaseline {
    fn forward(
        &mut self,
        input: &ArrayView4<f32>,
        is_train: bool,
        labels: Option<&ArrayView1<usize>>,
    ) -> Result<ModelOutput> {
        CnnBaseline::forward(self, input, is_train, labels)
    }

    fn regularization_losses(&self) -> Vec<f32> {
        CnnBaseline::regularization_losses(self)
    }

    fn num_parameters(&self) -> usize {
        CnnBaseline::num_parameters(self)
    }
}

/// Dropout inversé: les unités gardées sont divisées par (1 - rate)
fn dropout<R: Rng + ?Sized>(values: &mut Array2<f32>, rate: f32, rng: &mut R) {
    if rate <= 0.0 {
        return;
    }
    let keep = 1.0 - rate;
    for v in values.iter_mut() {
        *v = if rng.gen::<f32>() < rate { 0.0 } else { *v / keep };
    }
}
