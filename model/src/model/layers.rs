use ndarray::{s, Array, Array1, Array2, Array4, ArrayView2, ArrayView4, Axis, Dimension, ShapeBuilder};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::config::Activation;

/// Couche qui enregistre une pénalité L2 sur ses poids
pub trait Regularized {
    /// λ * Σw² / 2, ou None si la couche n'est pas régularisée (λ = 0)
    fn l2_penalty(&self) -> Option<f32>;
}

pub(crate) fn l2_of<D: Dimension>(lambda: f32, weights: &Array<f32, D>) -> Option<f32> {
    if lambda > 0.0 {
        Some(lambda * weights.iter().map(|w| w * w).sum::<f32>() / 2.0)
    } else {
        None
    }
}

/// Tirage N(0, std²)
pub(crate) fn init_normal<Sh, D, R>(shape: Sh, std: f32, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    let normal = Normal::new(0.0, std).expect("écart-type fini et positif");
    Array::random_using(shape, normal, rng)
}

/// Initialisation He uniforme
fn init_he<Sh, D, R>(shape: Sh, fan_in: usize, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    let scale = (2.0 / fan_in.max(1) as f32).sqrt();
    Array::random_using(shape, Uniform::new(-scale, scale), rng)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    Same,
    Valid,
}

impl Padding {
    /// (taille de sortie, padding avant) pour une dimension spatiale
    pub fn output_size(&self, input: usize, kernel: usize, stride: usize) -> Option<(usize, usize)> {
        match self {
            Padding::Same => {
                let out = input.div_ceil(stride);
                let total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(input);
                Some((out, total / 2))
            }
            Padding::Valid => {
                if input < kernel {
                    None
                } else {
                    Some(((input - kernel) / stride + 1, 0))
                }
            }
        }
    }
}

/// Normalisation par lot sans centre ni échelle appris (NHWC)
pub struct BatchNorm {
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub decay: f32,
    pub epsilon: f32,
}

impl BatchNorm {
    pub fn new(channels: usize) -> Self {
        Self {
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            decay: 0.999,
            epsilon: 0.001,
        }
    }

    /// Statistiques du lot en entraînement, statistiques glissantes sinon
    pub fn forward(&mut self, input: &ArrayView4<f32>, is_train: bool) -> Array4<f32> {
        let channels = input.dim().3;
        let (mean, var) = if is_train {
            let mean = channel_mean(&input.view());
            let centered = input - &mean;
            let var = channel_mean(&centered.mapv(|v| v * v).view());

            self.running_mean = &self.running_mean * self.decay + &mean * (1.0 - self.decay);
            self.running_var = &self.running_var * self.decay + &var * (1.0 - self.decay);
            (mean, var)
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };
        debug_assert_eq!(mean.len(), channels);

        let inv_std = var.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        (input - &mean) * &inv_std
    }
}

/// Moyenne par canal sur les axes batch, hauteur et largeur
fn channel_mean(input: &ArrayView4<f32>) -> Array1<f32> {
    let channels = input.dim().3;
    let count = (input.len() / channels.max(1)).max(1) as f32;
    let mut sums = Array1::zeros(channels);
    for lane in input.lanes(Axis(3)) {
        sums += &lane;
    }
    sums / count
}

/// Convolution 2D (NHWC, poids HWIO)
pub struct ConvLayer {
    pub weights: Array4<f32>,
    pub biases: Array1<f32>,
    pub stride: usize,
    pub padding: Padding,
    pub activation: Activation,
    pub l2_lambda: f32,
}

impl ConvLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        activation: Activation,
        l2_lambda: f32,
        rng: &mut R,
    ) -> Self {
        let weights = init_he(
            (kernel_size, kernel_size, in_channels, out_channels),
            in_channels * kernel_size * kernel_size,
            rng,
        );
        let biases = init_normal(out_channels, 0.01, rng);

        Self {
            weights,
            biases,
            stride,
            padding,
            activation,
            l2_lambda,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weights.dim().3
    }

    pub fn kernel_size(&self) -> usize {
        self.weights.dim().0
    }

    /// Taille spatiale de sortie, None si le noyau ne tient pas dans l'entrée
    pub fn output_hw(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let k = self.kernel_size();
        let (oh, _) = self.padding.output_size(height, k, self.stride)?;
        let (ow, _) = self.padding.output_size(width, k, self.stride)?;
        Some((oh, ow))
    }

    pub fn forward(&self, input: &ArrayView4<f32>) -> Array4<f32> {
        let (batch_size, in_height, in_width, in_channels) = input.dim();
        let (kernel_size, _, _, out_channels) = self.weights.dim();

        let (out_height, pad_top) = self
            .padding
            .output_size(in_height, kernel_size, self.stride)
            .unwrap_or((0, 0));
        let (out_width, pad_left) = self
            .padding
            .output_size(in_width, kernel_size, self.stride)
            .unwrap_or((0, 0));

        let padded = self.pad_input(input, out_height, out_width, pad_top, pad_left);
        let mut output = Array4::zeros((batch_size, out_height, out_width, out_channels));

        // Convolution parallélisée par batch
        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                let input_batch = padded.index_axis(Axis(0), b);

                for oh in 0..out_height {
                    for ow in 0..out_width {
                        let ih_start = oh * self.stride;
                        let iw_start = ow * self.stride;

                        for oc in 0..out_channels {
                            let mut sum = self.biases[oc];

                            for kh in 0..kernel_size {
                                for kw in 0..kernel_size {
                                    for ic in 0..in_channels {
                                        sum += input_batch[[ih_start + kh, iw_start + kw, ic]]
                                            * self.weights[[kh, kw, ic, oc]];
                                    }
                                }
                            }

                            out_batch[[oh, ow, oc]] = self.activation.apply(sum);
                        }
                    }
                }
            });

        output
    }

    fn pad_input(
        &self,
        input: &ArrayView4<f32>,
        out_height: usize,
        out_width: usize,
        pad_top: usize,
        pad_left: usize,
    ) -> Array4<f32> {
        let (batch_size, height, width, channels) = input.dim();
        let k = self.kernel_size();

        let padded_h = ((out_height.saturating_sub(1)) * self.stride + k).max(height + pad_top);
        let padded_w = ((out_width.saturating_sub(1)) * self.stride + k).max(width + pad_left);

        if padded_h == height && padded_w == width {
            return input.to_owned();
        }

        let mut padded = Array4::zeros((batch_size, padded_h, padded_w, channels));
        padded
            .slice_mut(s![.., pad_top..pad_top + height, pad_left..pad_left + width, ..])
            .assign(input);
        padded
    }
}

impl Regularized for ConvLayer {
    fn l2_penalty(&self) -> Option<f32> {
        l2_of(self.l2_lambda, &self.weights)
    }
}

/// Max-pooling 2D par canal (NHWC)
#[derive(Debug, Clone, Copy)]
pub struct MaxPool {
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: Padding,
}

impl MaxPool {
    pub fn new(kernel_size: usize, stride: usize, padding: Padding) -> Self {
        Self {
            kernel_size,
            stride,
            padding,
        }
    }

    pub fn output_hw(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let (oh, _) = self.padding.output_size(height, self.kernel_size, self.stride)?;
        let (ow, _) = self.padding.output_size(width, self.kernel_size, self.stride)?;
        Some((oh, ow))
    }

    /// Les positions de padding sont ignorées, jamais comptées comme zéro
    pub fn forward(&self, input: &ArrayView4<f32>) -> Array4<f32> {
        let (batch_size, height, width, channels) = input.dim();
        let k = self.kernel_size;
        let (out_height, pad_top) = self
            .padding
            .output_size(height, k, self.stride)
            .unwrap_or((0, 0));
        let (out_width, pad_left) = self
            .padding
            .output_size(width, k, self.stride)
            .unwrap_or((0, 0));

        let mut output = Array4::zeros((batch_size, out_height, out_width, channels));
        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                for oh in 0..out_height {
                    for ow in 0..out_width {
                        let rows = (oh * self.stride).saturating_sub(pad_top)
                            ..(oh * self.stride + k).saturating_sub(pad_top).min(height);
                        let cols = (ow * self.stride).saturating_sub(pad_left)
                            ..(ow * self.stride + k).saturating_sub(pad_left).min(width);

                        for c in 0..channels {
                            let mut max = f32::NEG_INFINITY;
                            for h in rows.clone() {
                                for w in cols.clone() {
                                    max = max.max(input[[b, h, w, c]]);
                                }
                            }
                            out_batch[[oh, ow, c]] = max;
                        }
                    }
                }
            });

        output
    }
}

/// Couche entièrement connectée
pub struct Dense {
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,
    pub l2_lambda: f32,
}

impl Dense {
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        l2_lambda: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            weights: init_he((in_features, out_features), in_features, rng),
            biases: init_normal(out_features, 0.01, rng),
            activation,
            l2_lambda,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weights.dim().0
    }

    pub fn out_features(&self) -> usize {
        self.weights.dim().1
    }

    pub fn forward(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let activation = self.activation;
        (input.dot(&self.weights) + &self.biases).mapv_into(|v| activation.apply(v))
    }
}

impl Regularized for Dense {
    fn l2_penalty(&self) -> Option<f32> {
        l2_of(self.l2_lambda, &self.weights)
    }
}
