use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use super::{
    baseline::CnnBaseline,
    capsule::{CapsLayer, CapsLayerConfig, CapsLayerKind, ClassCapsLayer, PrimaryCapsLayer},
    config::{Activation, CapsNetConfig},
    core::CapsNet,
    decoder::ReconstructionDecoder,
    error::{CapsError, Result},
    layers::{BatchNorm, ConvLayer, Padding},
    routing::EmRouting,
    votes::KernelSharing,
};

/// Constructeur de modèle
pub struct ModelBuilder {
    config: Option<CapsNetConfig>,
    input_shape: Option<(usize, usize, usize)>,
    num_classes: Option<usize>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            input_shape: None,
            num_classes: None,
        }
    }

    pub fn with_config(mut self, config: CapsNetConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// (hauteur, largeur, canaux)
    pub fn with_input_shape(mut self, height: usize, width: usize, channels: usize) -> Self {
        self.input_shape = Some((height, width, channels));
        self
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }

    /// Configuration validée, forme d'entrée et nombre de classes
    fn resolve(self) -> Result<(CapsNetConfig, (usize, usize, usize), usize)> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let (height, width, channels) = self
            .input_shape
            .ok_or_else(|| CapsError::Config("forme d'entrée requise".to_string()))?;
        if height == 0 || width == 0 || channels == 0 {
            return Err(CapsError::Config(format!(
                "forme d'entrée invalide: {height}x{width}x{channels}"
            )));
        }
        let num_classes = self
            .num_classes
            .ok_or_else(|| CapsError::Config("nombre de classes requis".to_string()))?;
        if num_classes < 2 {
            return Err(CapsError::Config("au moins deux classes sont requises".to_string()));
        }

        Ok((config, (height, width, channels), num_classes))
    }

    /// Ligne de base CNN, exige `config.cnn`
    pub fn build_baseline(self) -> Result<CnnBaseline> {
        let (config, input_shape, num_classes) = self.resolve()?;
        if config.cnn.is_none() {
            return Err(CapsError::Config(
                "build_baseline exige une configuration cnn".to_string(),
            ));
        }
        let rng = StdRng::seed_from_u64(config.seed);
        CnnBaseline::new(config, input_shape, num_classes, rng)
    }

    pub fn build(self) -> Result<CapsNet> {
        let (config, (height, width, channels), num_classes) = self.resolve()?;
        if config.cnn.is_some() {
            return Err(CapsError::Config(
                "configuration cnn: utiliser build_baseline".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let routing = EmRouting::from_config(&config.routing);
        let nn_lambda = config.nn_weight_reg_lambda;
        let caps_lambda = config.capsule_weight_reg_lambda;

        let batch_norm = BatchNorm::new(channels);
        let relu_conv1 = ConvLayer::new(
            channels,
            config.relu_conv1_filters,
            5,
            2,
            Padding::Same,
            Activation::ReLU,
            nn_lambda,
            &mut rng,
        );
        let (mut h, mut w) = relu_conv1
            .output_hw(height, width)
            .ok_or_else(|| collapsed("relu_conv1", 5, height, width))?;
        info!(shape = ?[h, w, config.relu_conv1_filters], "relu_conv1");

        let primary_caps = PrimaryCapsLayer::new(
            config.relu_conv1_filters,
            config.primary_caps,
            nn_lambda,
            &mut rng,
        );
        info!(shape = ?[h, w, config.primary_caps], "primary_caps");

        let mut c_in = config.primary_caps;
        let mut conv_caps = Vec::new();
        for layer_config in Self::conv_caps_configs(&config) {
            let layer = CapsLayer::conv(&layer_config, h, w, c_in, routing, caps_lambda, &mut rng)?;
            (h, w) = layer
                .output_hw(h, w)
                .ok_or_else(|| collapsed(&layer_config.name, layer.generator.kernel.0, h, w))?;
            c_in = layer_config.ncaps_out;
            info!(shape = ?[h, w, c_in], "{}", layer_config.name);
            conv_caps.push(layer);
        }

        let class_caps = ClassCapsLayer::new(
            &Self::class_caps_config(&config, "class_caps", num_classes),
            h,
            w,
            c_in,
            config.coordinate_addition,
            routing,
            caps_lambda,
            &mut rng,
        )?;

        let background_caps = config
            .has_background()
            .then(|| {
                ClassCapsLayer::new(
                    &Self::class_caps_config(&config, "background_caps", config.num_bg_classes),
                    h,
                    w,
                    c_in,
                    config.coordinate_addition,
                    routing,
                    caps_lambda,
                    &mut rng,
                )
            })
            .transpose()?;

        let num_bg = if config.has_background() { config.num_bg_classes } else { 0 };
        let decoder = config
            .reconstruction
            .as_ref()
            .map(|recon| {
                ReconstructionDecoder::new(
                    recon,
                    num_classes,
                    num_bg,
                    height * width * channels,
                    nn_lambda,
                    &mut rng,
                )
            })
            .transpose()?;

        Ok(CapsNet {
            config,
            input_shape: (height, width, channels),
            num_classes,
            batch_norm,
            relu_conv1,
            primary_caps,
            conv_caps,
            class_caps,
            background_caps,
            decoder,
            rng,
        })
    }

    /// Couches convolutives de capsules: C, D, puis E et F si non nulles
    fn conv_caps_configs(config: &CapsNetConfig) -> Vec<CapsLayerConfig> {
        let mut layers = vec![
            CapsLayerConfig {
                dropout: config.dropout_extra,
                affine_voting: config.affine_voting,
                ..CapsLayerConfig::conv("conv_caps1", config.conv_caps1, 3, 2)
            },
            CapsLayerConfig {
                dropout: config.dropout,
                dropconnect: config.dropconnect,
                affine_voting: config.affine_voting,
                ..CapsLayerConfig::conv("conv_caps2", config.conv_caps2, 3, 1)
            },
        ];

        if config.conv_caps3 > 0 {
            layers.push(CapsLayerConfig {
                dropout: config.dropout_extra,
                affine_voting: config.affine_voting,
                ..CapsLayerConfig::conv("conv_caps3", config.conv_caps3, 3, 1)
            });
        }
        // conv_caps4 ne partage pas ses transformations entre positions de sortie
        if config.conv_caps4 > 0 {
            layers.push(CapsLayerConfig {
                dropout: config.dropout,
                affine_voting: config.affine_voting,
                ..CapsLayerConfig::conv("conv_caps4", config.conv_caps4, 3, 1)
                    .with_sharing(KernelSharing::Unshared)
            });
        }

        layers
    }

    fn class_caps_config(config: &CapsNetConfig, name: &str, ncaps_out: usize) -> CapsLayerConfig {
        CapsLayerConfig {
            dropconnect: config.dropconnect,
            affine_voting: config.affine_voting,
            ..CapsLayerConfig::fully_connected(name, ncaps_out)
        }
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn collapsed(layer: &str, kernel: usize, height: usize, width: usize) -> CapsError {
    CapsError::Shape {
        context: format!("{layer}: grille spatiale réduite sous 1x1"),
        expected: vec![kernel, kernel],
        actual: vec![height, width],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{ClassInput, DecoderStrategy, ReconstructionConfig};

    fn small_config() -> CapsNetConfig {
        CapsNetConfig {
            relu_conv1_filters: 4,
            primary_caps: 2,
            conv_caps1: 2,
            conv_caps2: 2,
            batch_size: 2,
            ..CapsNetConfig::default()
        }
    }

    #[test]
    fn test_build_small_network() {
        let model = ModelBuilder::new()
            .with_config(small_config())
            .with_input_shape(16, 16, 1)
            .with_num_classes(3)
            .build()
            .unwrap();

        assert_eq!(model.conv_caps.len(), 2);
        assert!(model.background_caps.is_none());
        assert!(model.decoder.is_none());
        // 16 -> 8 (conv1) -> 3 (k3 s2) -> 1 (k3 s1)
        assert_eq!(model.class_caps.inner.generator.kernel, (1, 1));
    }

    #[test]
    fn test_optional_layers_and_sharing() {
        let config = CapsNetConfig {
            conv_caps3: 2,
            conv_caps4: 2,
            ..small_config()
        };
        let layers = ModelBuilder::conv_caps_configs(&config);

        assert_eq!(layers.len(), 4);
        let sharing = |config: &CapsLayerConfig| match config.kind {
            CapsLayerKind::Conv { sharing, .. } => Some(sharing),
            CapsLayerKind::FullyConnected => None,
        };
        assert_eq!(sharing(&layers[0]), Some(KernelSharing::PerPosition));
        assert_eq!(sharing(&layers[2]), Some(KernelSharing::PerPosition));
        assert_eq!(sharing(&layers[3]), Some(KernelSharing::Unshared));
        assert_eq!(
            layers[0].kind,
            CapsLayerKind::Conv { kernel: 3, stride: 2, sharing: KernelSharing::PerPosition }
        );

        let class = ModelBuilder::class_caps_config(&config, "class_caps", 3);
        assert_eq!(class.kind, CapsLayerKind::FullyConnected);
    }

    #[test]
    fn test_spatial_collapse_is_shape_error() {
        let result = ModelBuilder::new()
            .with_config(small_config())
            .with_input_shape(8, 8, 1)
            .with_num_classes(3)
            .build();

        assert!(matches!(result, Err(CapsError::Shape { .. })));
    }

    #[test]
    fn test_architecture_must_match_build_method() {
        let baseline = CapsNetConfig {
            cnn: Some(crate::model::config::CnnBaselineConfig::default()),
            ..small_config()
        };
        let result = ModelBuilder::new()
            .with_config(baseline)
            .with_input_shape(16, 16, 1)
            .with_num_classes(3)
            .build();
        assert!(matches!(result, Err(CapsError::Config(_))));

        let result = ModelBuilder::new()
            .with_config(small_config())
            .with_input_shape(16, 16, 1)
            .with_num_classes(3)
            .build_baseline();
        assert!(matches!(result, Err(CapsError::Config(_))));
    }

    #[test]
    fn test_missing_input_shape() {
        let result = ModelBuilder::new().with_config(small_config()).with_num_classes(3).build();
        assert!(matches!(result, Err(CapsError::Config(_))));
    }

    #[test]
    fn test_background_decoder_built_with_reconstruction() {
        let config = CapsNetConfig {
            num_bg_classes: 2,
            reconstruction: Some(ReconstructionConfig {
                strategy: DecoderStrategy::ClassPlusBackground { class_input: ClassInput::Weighted },
                hidden_x: 8,
                hidden_y: 0,
                ..ReconstructionConfig::default()
            }),
            ..small_config()
        };
        let model = ModelBuilder::new()
            .with_config(config)
            .with_input_shape(16, 16, 1)
            .with_num_classes(3)
            .build()
            .unwrap();

        assert!(model.background_caps.is_some());
        let decoder = model.decoder.as_ref().unwrap();
        assert!(decoder.background.is_some());
        assert_eq!(decoder.main.in_features(), 3 * 17);
    }

    #[test]
    fn test_background_ignored_without_reconstruction() {
        let config = CapsNetConfig {
            num_bg_classes: 2,
            ..small_config()
        };
        let model = ModelBuilder::new()
            .with_config(config)
            .with_input_shape(16, 16, 1)
            .with_num_classes(3)
            .build()
            .unwrap();

        assert!(model.background_caps.is_none());
    }
}
