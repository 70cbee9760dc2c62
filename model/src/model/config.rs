use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{CapsError, Result};
use super::layers::Padding;

/// Fonction d'activation des couches classiques
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    LeakyReLU(f32),
    Sigmoid,
    Tanh,
    None,
}

impl Activation {
    pub fn apply(&self, v: f32) -> f32 {
        match *self {
            Activation::ReLU => v.max(0.0),
            Activation::LeakyReLU(alpha) => if v > 0.0 { v } else { alpha * v },
            Activation::Sigmoid => sigmoid(v),
            Activation::Tanh => v.tanh(),
            Activation::None => v,
        }
    }
}

pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Planning de la température inverse du routage EM
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InverseTemperature {
    /// λ_t = final_lambda * (1 - 0.95^(t+1)), strictement croissant
    Annealed { final_lambda: f32 },
    Constant(f32),
}

impl InverseTemperature {
    pub fn at(&self, iteration: usize) -> f32 {
        match *self {
            InverseTemperature::Annealed { final_lambda } => {
                final_lambda * (1.0 - 0.95f32.powi(iteration as i32 + 1))
            }
            InverseTemperature::Constant(lambda) => lambda,
        }
    }
}

/// Initialisation des affectations R avant la première M-step
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingInit {
    /// Chaque ligne vaut 1 / (sorties autorisées)
    #[default]
    Uniform,
    /// Chaque ligne somme à `activation` au lieu de 1
    Activation(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    #[serde(alias = "iter_routing")]
    pub iterations: usize,
    pub inverse_temperature: InverseTemperature,
    pub init: RoutingInit,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            iterations: 3,
            inverse_temperature: InverseTemperature::Annealed { final_lambda: 0.01 },
            init: RoutingInit::Uniform,
        }
    }
}

/// Marge de la spread loss en fonction du pas d'entraînement global
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarginSchedule {
    pub m_min: f32,
    pub m_delta: f32,
    pub step_scale: f32,
    pub offset: f32,
    pub cap: f32,
}

impl MarginSchedule {
    /// Marge fixe, indépendante du pas
    pub fn constant(margin: f32) -> Self {
        Self {
            m_min: margin,
            m_delta: 0.0,
            ..Self::default()
        }
    }

    /// m = m_min + m_delta * sigmoid(min(cap, step / step_scale - offset))
    pub fn margin(&self, step: u64) -> f32 {
        let x = (step as f32 / self.step_scale - self.offset).min(self.cap);
        self.m_min + self.m_delta * sigmoid(x)
    }
}

impl Default for MarginSchedule {
    fn default() -> Self {
        Self {
            m_min: 0.2,
            m_delta: 0.79,
            step_scale: 50_000.0,
            offset: 4.0,
            cap: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationLoss {
    Spread,
    /// Ligne de base CNN
    CrossEntropy,
}

/// Entrée du décodeur de classe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassInput {
    /// Pose de la classe sélectionnée (label ou arg-max)
    Masked,
    /// Activations et poses de toutes les classes
    Weighted,
}

/// Stratégie de reconstruction, choisie une fois pour toutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderStrategy {
    MaskedClassOnly,
    WeightedMultiClass,
    /// Décodeurs séparés pour les classes et le fond, sorties additionnées
    ClassPlusBackground { class_input: ClassInput },
}

impl DecoderStrategy {
    pub fn is_legacy(&self) -> bool {
        !matches!(self, DecoderStrategy::ClassPlusBackground { .. })
    }
}

/// Sortie `zeroed_bg_decoder_out`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroedBackground {
    Disabled,
    /// Même décodeur, préfixe de fond mis à zéro
    Redecode,
    /// Copie de `class_out`
    AliasClassOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    pub strategy: DecoderStrategy,
    #[serde(alias = "X")]
    pub hidden_x: usize,
    /// 0 désactive la seconde couche cachée
    #[serde(alias = "Y")]
    pub hidden_y: usize,
    pub relu_recon: bool,
    #[serde(alias = "recon_loss_lambda")]
    pub loss_lambda: f32,
    #[serde(alias = "recon_diff_lambda")]
    pub diff_lambda: f32,
    #[serde(alias = "zeroed_bg_reconstruction")]
    pub zeroed_background: ZeroedBackground,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            strategy: DecoderStrategy::MaskedClassOnly,
            hidden_x: 512,
            hidden_y: 1024,
            relu_recon: true,
            loss_lambda: 1.0,
            diff_lambda: 0.0,
            zeroed_background: ZeroedBackground::Disabled,
        }
    }
}

impl ReconstructionConfig {
    pub fn hidden_activation(&self) -> Activation {
        if self.relu_recon {
            Activation::ReLU
        } else {
            Activation::Tanh
        }
    }
}

/// Convolution de la ligne de base CNN, suivie ou non d'un max-pooling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CnnConvSpec {
    pub filters: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: Padding,
    pub pool: bool,
}

impl CnnConvSpec {
    pub fn new(filters: usize, kernel: usize, stride: usize, padding: Padding, pool: bool) -> Self {
        Self {
            filters,
            kernel,
            stride,
            padding,
            pool,
        }
    }
}

/// Ligne de base CNN de type AlexNet (vecteurs de classe et logits)
///
/// L'entrée est prise à sa taille native; un redimensionnement éventuel
/// revient à l'appelant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnnBaselineConfig {
    pub conv: Vec<CnnConvSpec>,
    pub pool_kernel: usize,
    pub pool_stride: usize,
    /// Largeur des deux couches denses fc6 et fc7
    pub hidden: usize,
    /// Dropout après fc6 et fc7, avec remise à l'échelle
    pub drop_rate: f32,
    pub weight_decay: f32,
}

impl Default for CnnBaselineConfig {
    fn default() -> Self {
        Self {
            conv: vec![
                CnnConvSpec::new(64, 11, 4, Padding::Valid, true),
                CnnConvSpec::new(192, 5, 1, Padding::Same, true),
                CnnConvSpec::new(384, 3, 1, Padding::Same, false),
                CnnConvSpec::new(384, 3, 1, Padding::Same, false),
                CnnConvSpec::new(256, 3, 1, Padding::Same, true),
            ],
            pool_kernel: 3,
            pool_stride: 2,
            hidden: 4096,
            drop_rate: 0.5,
            weight_decay: 0.0005,
        }
    }
}

/// Configuration complète du réseau, immuable pendant la passe avant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsNetConfig {
    #[serde(alias = "A")]
    pub relu_conv1_filters: usize,
    #[serde(alias = "B")]
    pub primary_caps: usize,
    #[serde(alias = "C")]
    pub conv_caps1: usize,
    #[serde(alias = "D")]
    pub conv_caps2: usize,
    /// 0 désactive la couche
    #[serde(alias = "E")]
    pub conv_caps3: usize,
    /// 0 désactive la couche
    #[serde(alias = "F")]
    pub conv_caps4: usize,

    pub batch_size: usize,
    pub num_gpus: usize,

    pub drop_rate: f32,
    pub dropout: bool,
    pub dropout_extra: bool,
    pub dropconnect: bool,

    pub weight_reg: bool,
    pub nn_weight_reg_lambda: f32,
    pub capsule_weight_reg_lambda: f32,

    pub affine_voting: bool,
    pub coordinate_addition: bool,
    pub routing: RoutingConfig,

    pub classification_loss: ClassificationLoss,
    pub margin: MarginSchedule,
    pub adv_conf_thres: f32,

    pub num_bg_classes: usize,
    /// None désactive le décodeur et la perte de reconstruction
    pub reconstruction: Option<ReconstructionConfig>,

    /// Some remplace le réseau de capsules par la ligne de base CNN
    pub cnn: Option<CnnBaselineConfig>,

    pub seed: u64,
}

impl Default for CapsNetConfig {
    fn default() -> Self {
        Self {
            relu_conv1_filters: 64,
            primary_caps: 8,
            conv_caps1: 16,
            conv_caps2: 16,
            conv_caps3: 0,
            conv_caps4: 0,
            batch_size: 64,
            num_gpus: 1,
            drop_rate: 0.5,
            dropout: false,
            dropout_extra: false,
            dropconnect: false,
            weight_reg: false,
            nn_weight_reg_lambda: 2e-7,
            capsule_weight_reg_lambda: 2e-7,
            affine_voting: false,
            coordinate_addition: true,
            routing: RoutingConfig::default(),
            classification_loss: ClassificationLoss::Spread,
            margin: MarginSchedule::default(),
            adv_conf_thres: 0.0,
            num_bg_classes: 0,
            reconstruction: None,
            cnn: None,
            seed: 42,
        }
    }
}

impl CapsNetConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Perte de classification effective: la ligne de base CNN produit des
    /// logits et utilise toujours l'entropie croisée
    pub fn classification(&self) -> ClassificationLoss {
        if self.cnn.is_some() {
            ClassificationLoss::CrossEntropy
        } else {
            self.classification_loss
        }
    }

    /// Taille de batch vue par un réplica
    pub fn device_batch_size(&self) -> usize {
        self.batch_size / self.num_gpus.max(1)
    }

    /// Les capsules de fond n'existent qu'avec le décodeur
    pub fn has_background(&self) -> bool {
        self.num_bg_classes > 0 && self.reconstruction.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("relu_conv1_filters", self.relu_conv1_filters),
            ("primary_caps", self.primary_caps),
            ("conv_caps1", self.conv_caps1),
            ("conv_caps2", self.conv_caps2),
            ("batch_size", self.batch_size),
            ("num_gpus", self.num_gpus),
        ];
        for (name, value) in required {
            if value == 0 {
                return Err(CapsError::Config(format!("{name} doit être > 0")));
            }
        }

        if self.batch_size % self.num_gpus != 0 {
            return Err(CapsError::Config(format!(
                "batch_size {} non divisible par num_gpus {}",
                self.batch_size, self.num_gpus
            )));
        }

        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(CapsError::Config(format!(
                "drop_rate {} hors de [0, 1)",
                self.drop_rate
            )));
        }

        if self.nn_weight_reg_lambda < 0.0 || self.capsule_weight_reg_lambda < 0.0 {
            return Err(CapsError::Config(
                "les coefficients de régularisation doivent être >= 0".to_string(),
            ));
        }

        if self.routing.iterations == 0 {
            return Err(CapsError::Config("routing.iterations doit être > 0".to_string()));
        }
        let lambda_ok = match self.routing.inverse_temperature {
            InverseTemperature::Annealed { final_lambda } => final_lambda > 0.0,
            InverseTemperature::Constant(lambda) => lambda > 0.0,
        };
        if !lambda_ok {
            return Err(CapsError::Config(
                "la température inverse doit être > 0".to_string(),
            ));
        }
        if let RoutingInit::Activation(value) = self.routing.init {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CapsError::Config(format!(
                    "routing.init: activation initiale {value} hors de (0, 1]"
                )));
            }
        }

        if self.margin.step_scale <= 0.0 || self.margin.m_delta < 0.0 {
            return Err(CapsError::Config("planning de marge invalide".to_string()));
        }

        if self.adv_conf_thres < 0.0 {
            return Err(CapsError::Config("adv_conf_thres doit être >= 0".to_string()));
        }

        if let Some(recon) = &self.reconstruction {
            self.validate_reconstruction(recon)?;
        }

        if let Some(cnn) = &self.cnn {
            self.validate_baseline(cnn)?;
        }

        Ok(())
    }

    fn validate_baseline(&self, cnn: &CnnBaselineConfig) -> Result<()> {
        if cnn.conv.is_empty() || cnn.hidden == 0 {
            return Err(CapsError::Config(
                "cnn: au moins une convolution et hidden > 0 sont requis".to_string(),
            ));
        }
        if let Some(spec) = cnn.conv.iter().find(|c| c.filters == 0 || c.kernel == 0 || c.stride == 0) {
            return Err(CapsError::Config(format!("cnn: convolution invalide {spec:?}")));
        }
        if cnn.pool_kernel == 0 || cnn.pool_stride == 0 {
            return Err(CapsError::Config("cnn: pooling invalide".to_string()));
        }
        if !(0.0..1.0).contains(&cnn.drop_rate) || cnn.weight_decay < 0.0 {
            return Err(CapsError::Config(
                "cnn: drop_rate hors de [0, 1) ou weight_decay négatif".to_string(),
            ));
        }

        // la ligne de base ne décode que le vecteur de la classe sélectionnée
        if let Some(recon) = &self.reconstruction {
            if recon.strategy != DecoderStrategy::MaskedClassOnly
                || recon.zeroed_background != ZeroedBackground::Disabled
            {
                return Err(CapsError::Config(
                    "cnn: seule la stratégie masked_class_only est disponible".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn validate_reconstruction(&self, recon: &ReconstructionConfig) -> Result<()> {
        if recon.hidden_x == 0 {
            return Err(CapsError::Config("hidden_x (X) doit être > 0".to_string()));
        }
        if recon.loss_lambda < 0.0 {
            return Err(CapsError::Config("loss_lambda doit être >= 0".to_string()));
        }

        let with_bg = self.num_bg_classes > 0;
        let split = !recon.strategy.is_legacy();

        if recon.diff_lambda != 0.0 && !(split && with_bg) {
            return Err(CapsError::Config(
                "diff_lambda exige la stratégie class_plus_background avec des capsules de fond"
                    .to_string(),
            ));
        }

        match recon.zeroed_background {
            ZeroedBackground::Disabled => {}
            ZeroedBackground::Redecode if split || !with_bg => {
                return Err(CapsError::Config(
                    "zeroed_background=redecode exige un décodeur unique et des capsules de fond"
                        .to_string(),
                ));
            }
            ZeroedBackground::AliasClassOutput if !split || !with_bg => {
                return Err(CapsError::Config(
                    "zeroed_background=alias_class_output exige class_plus_background et des capsules de fond"
                        .to_string(),
                ));
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CapsNetConfig::default().validate().is_ok());
    }

    #[test]
    fn test_json_aliases() {
        let json = r#"{
            "A": 32, "B": 4, "C": 8, "D": 8, "E": 4,
            "batch_size": 8, "num_gpus": 2,
            "num_bg_classes": 2,
            "reconstruction": {
                "strategy": { "class_plus_background": { "class_input": "weighted" } },
                "X": 64, "Y": 0,
                "recon_diff_lambda": 0.1,
                "zeroed_bg_reconstruction": "alias_class_output"
            }
        }"#;
        let config = CapsNetConfig::from_json_str(json).unwrap();

        assert_eq!(config.relu_conv1_filters, 32);
        assert_eq!(config.conv_caps3, 4);
        assert_eq!(config.conv_caps4, 0);
        assert_eq!(config.device_batch_size(), 4);
        assert!(config.has_background());

        let recon = config.reconstruction.unwrap();
        assert_eq!(recon.hidden_x, 64);
        assert_eq!(recon.hidden_y, 0);
        assert_eq!(
            recon.strategy,
            DecoderStrategy::ClassPlusBackground { class_input: ClassInput::Weighted }
        );
    }

    #[test]
    fn test_json_round_trip() {
        let config = CapsNetConfig {
            reconstruction: Some(ReconstructionConfig::default()),
            ..CapsNetConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(CapsNetConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_zeroed_background_requires_background_caps() {
        let config = CapsNetConfig {
            reconstruction: Some(ReconstructionConfig {
                zeroed_background: ZeroedBackground::Redecode,
                ..ReconstructionConfig::default()
            }),
            ..CapsNetConfig::default()
        };
        assert!(matches!(config.validate(), Err(CapsError::Config(_))));

        let config = CapsNetConfig { num_bg_classes: 3, ..config };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_alias_class_output_requires_split_decoder() {
        let config = CapsNetConfig {
            num_bg_classes: 2,
            reconstruction: Some(ReconstructionConfig {
                zeroed_background: ZeroedBackground::AliasClassOutput,
                ..ReconstructionConfig::default()
            }),
            ..CapsNetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_diff_lambda_requires_split_decoder() {
        let config = CapsNetConfig {
            num_bg_classes: 2,
            reconstruction: Some(ReconstructionConfig {
                diff_lambda: 0.5,
                ..ReconstructionConfig::default()
            }),
            ..CapsNetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_drop_rate() {
        let config = CapsNetConfig { drop_rate: 1.0, ..CapsNetConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_routing_init_from_json_and_range() {
        let json = r#"{ "routing": { "iter_routing": 2, "init": { "activation": 0.5 } } }"#;
        let config = CapsNetConfig::from_json_str(json).unwrap();
        assert_eq!(config.routing.iterations, 2);
        assert_eq!(config.routing.init, RoutingInit::Activation(0.5));
        assert!(config.validate().is_ok());

        assert_eq!(CapsNetConfig::default().routing.init, RoutingInit::Uniform);

        let config = CapsNetConfig {
            routing: RoutingConfig { init: RoutingInit::Activation(0.0), ..RoutingConfig::default() },
            ..CapsNetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cnn_baseline_config() {
        let json = r#"{
            "cnn": { "conv": [ { "filters": 8, "kernel": 3, "stride": 1, "padding": "same", "pool": true } ], "hidden": 32 },
            "reconstruction": { "X": 16, "Y": 0 }
        }"#;
        let config = CapsNetConfig::from_json_str(json).unwrap();
        let cnn = config.cnn.as_ref().unwrap();

        assert_eq!(cnn.conv, vec![CnnConvSpec::new(8, 3, 1, Padding::Same, true)]);
        assert_eq!((cnn.pool_kernel, cnn.pool_stride, cnn.hidden), (3, 2, 32));
        assert_eq!(config.classification(), ClassificationLoss::CrossEntropy);
        assert_eq!(CapsNetConfig::default().classification(), ClassificationLoss::Spread);

        let default = CnnBaselineConfig::default();
        assert_eq!(default.conv.len(), 5);
        assert_eq!(default.conv[0], CnnConvSpec::new(64, 11, 4, Padding::Valid, true));

        let weighted = CapsNetConfig {
            cnn: Some(CnnBaselineConfig::default()),
            reconstruction: Some(ReconstructionConfig {
                strategy: DecoderStrategy::WeightedMultiClass,
                ..ReconstructionConfig::default()
            }),
            ..CapsNetConfig::default()
        };
        assert!(weighted.validate().is_err());

        let empty = CapsNetConfig {
            cnn: Some(CnnBaselineConfig { conv: vec![], ..CnnBaselineConfig::default() }),
            ..CapsNetConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_margin_schedule() {
        let schedule = MarginSchedule::default();

        // pas 0: 0.2 + 0.79 * sigmoid(-4)
        assert_abs_diff_eq!(schedule.margin(0), 0.2 + 0.79 * sigmoid(-4.0), epsilon = 1e-6);
        assert_abs_diff_eq!(schedule.margin(200_000), 0.2 + 0.79 * 0.5, epsilon = 1e-6);

        // saturation: l'argument est plafonné à 10
        let late = schedule.margin(10_000_000);
        assert_abs_diff_eq!(late, 0.2 + 0.79 * sigmoid(10.0), epsilon = 1e-6);
        assert!(late < 0.99 + 1e-6);
        // 250000 / 50000 - 4 = 1
        assert_abs_diff_eq!(schedule.margin(250_000), 0.2 + 0.79 * sigmoid(1.0), epsilon = 1e-6);
        assert!(schedule.margin(250_000) < late);

        assert_abs_diff_eq!(MarginSchedule::constant(0.2).margin(123_456), 0.2);
    }

    #[test]
    fn test_inverse_temperature_increases() {
        let schedule = InverseTemperature::Annealed { final_lambda: 0.01 };
        let values: Vec<f32> = (0..5).map(|t| schedule.at(t)).collect();
        assert!(values.windows(2).all(|w| w[1] > w[0]));
        assert!(values.iter().all(|&v| v > 0.0 && v < 0.01));
    }
}
