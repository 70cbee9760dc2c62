use ndarray::{Array1, ArrayView1, ArrayView2, ArrayView4};
use tracing::{debug, warn};

use super::config::{CapsNetConfig, ClassificationLoss, MarginSchedule};
use super::core::ModelOutput;
use super::error::{ensure_shape, CapsError, Result};

/// Perte de classification sur des scores [B, classes] et des labels entiers [B]
pub trait LossFunction: Send + Sync {
    fn compute(&self, scores: &ArrayView2<f32>, labels: &ArrayView1<usize>, step: u64) -> Result<f32>;

    fn name(&self) -> &'static str;
}

fn check_labels(context: &str, scores: &ArrayView2<f32>, labels: &ArrayView1<usize>) -> Result<()> {
    let (batch_size, num_classes) = scores.dim();
    ensure_shape(context, &[batch_size], labels.shape())?;
    match labels.iter().find(|&&label| label >= num_classes) {
        Some(&label) => Err(CapsError::LabelOutOfRange { label, num_classes }),
        None => Ok(()),
    }
}

/// Spread loss (Hinton et al. 2018, éq. 3)
pub struct SpreadLoss {
    pub schedule: MarginSchedule,
}

impl SpreadLoss {
    pub fn new(schedule: MarginSchedule) -> Self {
        Self { schedule }
    }
}

impl LossFunction for SpreadLoss {
    fn compute(&self, scores: &ArrayView2<f32>, labels: &ArrayView1<usize>, step: u64) -> Result<f32> {
        check_labels("spread_loss", scores, labels)?;
        let margin = self.schedule.margin(step);

        let total: f32 = scores
            .outer_iter()
            .zip(labels.iter())
            .map(|(row, &target)| {
                let a_t = row[target];
                row.iter()
                    .enumerate()
                    .filter(|&(i, _)| i != target)
                    .map(|(_, &a_i)| (margin - (a_t - a_i)).max(0.0).powi(2))
                    .sum::<f32>()
            })
            .sum();

        Ok(total / scores.nrows().max(1) as f32)
    }

    fn name(&self) -> &'static str {
        "spread_loss"
    }
}

/// Entropie croisée softmax avec labels entiers
pub struct CrossEntropyLoss;

impl LossFunction for CrossEntropyLoss {
    fn compute(&self, scores: &ArrayView2<f32>, labels: &ArrayView1<usize>, _step: u64) -> Result<f32> {
        check_labels("cross_entropy", scores, labels)?;

        let total: f32 = scores
            .outer_iter()
            .zip(labels.iter())
            .map(|(row, &target)| {
                let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                let log_sum_exp = max + row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
                log_sum_exp - row[target]
            })
            .sum();

        Ok(total / scores.nrows().max(1) as f32)
    }

    fn name(&self) -> &'static str {
        "cross_entropy"
    }
}

/// Erreur quadratique par exemple entre image aplatie et reconstruction, [B]
pub fn reconstruction_loss_per_example(
    input: &ArrayView4<f32>,
    decoder_out: &ArrayView2<f32>,
) -> Result<Array1<f32>> {
    let (batch_size, height, width, channels) = input.dim();
    let output_size = height * width * channels;
    ensure_shape("reconstruction_loss", &[batch_size, output_size], decoder_out.shape())?;

    Ok(input
        .outer_iter()
        .zip(decoder_out.outer_iter())
        .map(|(image, recon)| {
            // NHWC aplati en ordre ligne
            image
                .iter()
                .zip(recon.iter())
                .map(|(x, r)| (x - r).powi(2))
                .sum::<f32>()
                / output_size.max(1) as f32
        })
        .collect())
}

/// Erreur quadratique moyenne sur le batch et les pixels
pub fn reconstruction_loss(input: &ArrayView4<f32>, decoder_out: &ArrayView2<f32>) -> Result<f32> {
    let per_example = reconstruction_loss_per_example(input, decoder_out)?;
    Ok(per_example.mean().unwrap_or(0.0))
}

/// Détail des termes de la perte totale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    pub classification: f32,
    pub regularization: Option<f32>,
    /// Déjà pondérée par loss_lambda
    pub reconstruction: Option<f32>,
    /// -diff_lambda * mean((class_out - bg_out)²)
    pub class_bg_distance: Option<f32>,
    pub total: f32,
}

/// Perte totale d'entraînement
pub struct TotalLoss {
    pub classification: Box<dyn LossFunction>,
    pub weight_reg: bool,
    pub recon_lambda: Option<f32>,
    pub diff_lambda: f32,
}

impl TotalLoss {
    pub fn from_config(config: &CapsNetConfig) -> Self {
        let classification: Box<dyn LossFunction> = match config.classification() {
            ClassificationLoss::Spread => Box::new(SpreadLoss::new(config.margin)),
            ClassificationLoss::CrossEntropy => Box::new(CrossEntropyLoss),
        };

        Self {
            classification,
            weight_reg: config.weight_reg,
            recon_lambda: config.reconstruction.as_ref().map(|r| r.loss_lambda),
            diff_lambda: config.reconstruction.as_ref().map_or(0.0, |r| r.diff_lambda),
        }
    }

    /// `regularization`: pénalités L2 enregistrées par les couches
    pub fn compute(
        &self,
        output: &ModelOutput,
        labels: &ArrayView1<usize>,
        regularization: &[f32],
        step: u64,
    ) -> Result<LossBreakdown> {
        let classification = self.classification.compute(&output.scores.view(), labels, step)?;
        let mut total = classification;

        let regularization = self.weight_reg.then(|| {
            if regularization.is_empty() {
                warn!("aucune variable régularisée dans le réseau");
            }
            regularization.iter().sum::<f32>()
        });
        total += regularization.unwrap_or(0.0);

        let reconstruction = match self.recon_lambda {
            Some(lambda) => Some(lambda * output_reconstruction_loss(output)?),
            None => None,
        };
        total += reconstruction.unwrap_or(0.0);

        let class_bg_distance = match (&output.class_out, &output.bg_out) {
            (Some(class_out), Some(bg_out)) if self.recon_lambda.is_some() => {
                let distance = (class_out - bg_out).mapv(|d| d * d).mean().unwrap_or(0.0);
                Some(-self.diff_lambda * distance)
            }
            _ => None,
        };
        total += class_bg_distance.unwrap_or(0.0);

        debug!(
            loss = self.classification.name(),
            classification,
            ?regularization,
            ?reconstruction,
            ?class_bg_distance,
            total,
            step,
            "perte totale"
        );

        Ok(LossBreakdown {
            classification,
            regularization,
            reconstruction,
            class_bg_distance,
            total,
        })
    }
}

fn output_reconstruction_loss(output: &ModelOutput) -> Result<f32> {
    let input = output.input.as_ref().ok_or(CapsError::MissingOutput("input"))?;
    let decoder_out = output
        .decoder_out
        .as_ref()
        .ok_or(CapsError::MissingOutput("decoder_out"))?;
    reconstruction_loss(&input.view(), &decoder_out.view())
}

/// Perte de Carlini-Wagner pour l'évaluation adversariale
pub struct CarliniWagnerLoss {
    pub confidence_threshold: f32,
    pub recon_lambda: Option<f32>,
}

impl CarliniWagnerLoss {
    pub fn from_config(config: &CapsNetConfig) -> Self {
        Self {
            confidence_threshold: config.adv_conf_thres,
            recon_lambda: config.reconstruction.as_ref().map(|r| r.loss_lambda),
        }
    }

    /// mean_b max(max_{i≠t} s_i − s_t, −seuil)
    pub fn adversarial_confidence(&self, scores: &ArrayView2<f32>, labels: &ArrayView1<usize>) -> Result<f32> {
        check_labels("carlini_wagner_loss", scores, labels)?;
        if scores.ncols() < 2 {
            return Err(CapsError::Config(
                "carlini_wagner_loss exige au moins deux classes".to_string(),
            ));
        }

        let per_example = scores.outer_iter().zip(labels.iter()).map(|(row, &target)| {
            let max_other = row
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != target)
                .fold(f32::NEG_INFINITY, |m, (_, &v)| m.max(v));
            (max_other - row[target]).max(-self.confidence_threshold)
        });

        Ok(per_example.sum::<f32>() / scores.nrows().max(1) as f32)
    }

    pub fn compute(&self, output: &ModelOutput, labels: &ArrayView1<usize>) -> Result<f32> {
        let mut total = self.adversarial_confidence(&output.scores.view(), labels)?;
        if let Some(lambda) = self.recon_lambda {
            total += lambda * output_reconstruction_loss(output)?;
        }
        debug!(total, "carlini_wagner_loss");
        Ok(total)
    }
}
