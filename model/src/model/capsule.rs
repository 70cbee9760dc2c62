use ndarray::{s, Array2, Array3, Array4, Array5, ArrayView4, Axis};
use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, info};

use super::config::Activation;
use super::error::{ensure_shape, CapsError, Result};
use super::layers::{ConvLayer, Padding, Regularized};
use super::routing::{EmRouting, RoutingParams};
use super::votes::{KernelSharing, TransformWeights, VoteGenerator, POSE_DIM};

/// Poses [B, H, W, C, 16] et activations [B, H, W, C]
#[derive(Debug, Clone)]
pub struct CapsuleGrid {
    pub pose: Array5<f32>,
    pub activation: Array4<f32>,
}

impl CapsuleGrid {
    /// Pose et activation partagent batch, espace et nombre de capsules
    pub fn check(&self, context: &str) -> Result<()> {
        let (b, h, w, c, d) = self.pose.dim();
        ensure_shape(context, &[b, h, w, c, POSE_DIM], &[b, h, w, c, d])?;
        ensure_shape(context, &[b, h, w, c], self.activation.shape())
    }

    pub fn dims(&self) -> (usize, usize, usize, usize) {
        let (b, h, w, c, _) = self.pose.dim();
        (b, h, w, c)
    }
}

/// Capsules de classe: poses [B, C, 16] et activations [B, C]
#[derive(Debug, Clone)]
pub struct ClassCapsules {
    pub pose: Array3<f32>,
    pub activation: Array2<f32>,
}

/// Régularisation stochastique, uniquement en entraînement
pub struct DropContext<'a, R: Rng + ?Sized> {
    pub rate: f32,
    pub rng: &'a mut R,
}

/// Capsules primaires: deux convolutions 1x1 (pose linéaire, activation sigmoïde)
pub struct PrimaryCapsLayer {
    pub pose_conv: ConvLayer,
    pub activation_conv: ConvLayer,
    pub num_capsules: usize,
}

impl PrimaryCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        num_capsules: usize,
        l2_lambda: f32,
        rng: &mut R,
    ) -> Self {
        let pose_conv = ConvLayer::new(
            in_channels,
            num_capsules * POSE_DIM,
            1,
            1,
            Padding::Valid,
            Activation::None,
            l2_lambda,
            rng,
        );
        let activation_conv = ConvLayer::new(
            in_channels,
            num_capsules,
            1,
            1,
            Padding::Valid,
            Activation::Sigmoid,
            l2_lambda,
            rng,
        );

        Self {
            pose_conv,
            activation_conv,
            num_capsules,
        }
    }

    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<CapsuleGrid> {
        let (batch_size, height, width, _) = input.dim();
        let shape_err = |e: ndarray::ShapeError| {
            CapsError::Config(format!("primary_caps: remise en forme impossible: {e}"))
        };

        let pose = self
            .pose_conv
            .forward(input)
            .into_shape_with_order((batch_size, height, width, self.num_capsules, POSE_DIM))
            .map_err(shape_err)?;
        let activation = self.activation_conv.forward(input);

        let grid = CapsuleGrid { pose, activation };
        grid.check("primary_caps")?;
        ensure_shape(
            "primary_caps",
            &[batch_size, height, width, self.num_capsules],
            grid.activation.shape(),
        )?;

        debug!(pose = ?grid.pose.shape(), "primary_caps");
        Ok(grid)
    }
}

impl Regularized for PrimaryCapsLayer {
    fn l2_penalty(&self) -> Option<f32> {
        match (self.pose_conv.l2_penalty(), self.activation_conv.l2_penalty()) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        }
    }
}

/// Forme des connexions d'une couche de capsules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsLayerKind {
    /// Noyau k x k, padding VALID
    Conv {
        kernel: usize,
        stride: usize,
        sharing: KernelSharing,
    },
    /// Noyau couvrant toute la grille restante, sortie 1x1
    FullyConnected,
}

/// Paramètres d'une couche de capsules
#[derive(Debug, Clone)]
pub struct CapsLayerConfig {
    pub name: String,
    pub ncaps_out: usize,
    pub kind: CapsLayerKind,
    pub dropout: bool,
    pub dropconnect: bool,
    pub affine_voting: bool,
}

impl CapsLayerConfig {
    /// Couche convolutive, une transformation par (position du noyau, capsule d'entrée)
    pub fn conv(name: &str, ncaps_out: usize, kernel: usize, stride: usize) -> Self {
        Self::with_kind(
            name,
            ncaps_out,
            CapsLayerKind::Conv {
                kernel,
                stride,
                sharing: KernelSharing::PerPosition,
            },
        )
    }

    /// Couche de classe ou de fond
    pub fn fully_connected(name: &str, ncaps_out: usize) -> Self {
        Self::with_kind(name, ncaps_out, CapsLayerKind::FullyConnected)
    }

    /// Change le partage des transformations d'une couche convolutive
    pub fn with_sharing(mut self, sharing: KernelSharing) -> Self {
        if let CapsLayerKind::Conv { sharing: current, .. } = &mut self.kind {
            *current = sharing;
        }
        self
    }

    fn with_kind(name: &str, ncaps_out: usize, kind: CapsLayerKind) -> Self {
        Self {
            name: name.to_string(),
            ncaps_out,
            kind,
            dropout: false,
            dropconnect: false,
            affine_voting: false,
        }
    }
}

/// Couche de capsules: générateur de votes + routage EM par position de sortie
pub struct CapsLayer {
    pub name: String,
    pub generator: VoteGenerator,
    pub transforms: TransformWeights,
    pub params: RoutingParams,
    pub routing: EmRouting,
    pub dropout: bool,
    pub dropconnect: bool,
}

impl CapsLayer {
    /// Couche convolutive sur une grille d'entrée H x W
    pub fn conv<R: Rng + ?Sized>(
        config: &CapsLayerConfig,
        height: usize,
        width: usize,
        c_in: usize,
        routing: EmRouting,
        l2_lambda: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let CapsLayerKind::Conv { kernel, stride, sharing } = config.kind else {
            return Err(CapsError::Config(format!(
                "{}: configuration convolutive attendue",
                config.name
            )));
        };
        let generator = VoteGenerator::conv(kernel, stride, sharing);
        let grid = generator
            .output_hw(height, width)
            .ok_or_else(|| kernel_too_large(&config.name, &generator, height, width))?;
        Ok(Self::with_generator(config, generator, c_in, grid, routing, l2_lambda, rng))
    }

    /// Couche entièrement connectée sur une grille H x W
    pub fn fully_connected<R: Rng + ?Sized>(
        config: &CapsLayerConfig,
        height: usize,
        width: usize,
        c_in: usize,
        coordinate_addition: bool,
        routing: EmRouting,
        l2_lambda: f32,
        rng: &mut R,
    ) -> Result<Self> {
        if config.kind != CapsLayerKind::FullyConnected {
            return Err(CapsError::Config(format!(
                "{}: configuration entièrement connectée attendue",
                config.name
            )));
        }
        let generator = VoteGenerator::fully_connected(height, width, coordinate_addition);
        Ok(Self::with_generator(config, generator, c_in, (1, 1), routing, l2_lambda, rng))
    }

    fn with_generator<R: Rng + ?Sized>(
        config: &CapsLayerConfig,
        generator: VoteGenerator,
        c_in: usize,
        grid: (usize, usize),
        routing: EmRouting,
        l2_lambda: f32,
        rng: &mut R,
    ) -> Self {
        let transforms = TransformWeights::new(
            generator.n_weights(c_in, grid),
            config.ncaps_out,
            config.affine_voting,
            l2_lambda,
            rng,
        );
        let params = RoutingParams::new(config.ncaps_out, rng);

        info!(
            layer = %config.name,
            kernel = ?generator.kernel,
            stride = generator.stride,
            sharing = ?generator.sharing,
            caps_in = generator.capsules_in_per_location(c_in),
            caps_out = config.ncaps_out,
            transforms = transforms.n_weights(),
            "couche de capsules"
        );

        Self {
            name: config.name.clone(),
            generator,
            transforms,
            params,
            routing,
            dropout: config.dropout,
            dropconnect: config.dropconnect,
        }
    }

    pub fn ncaps_out(&self) -> usize {
        self.params.c_out()
    }

    pub fn output_hw(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        self.generator.output_hw(height, width)
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        input: &CapsuleGrid,
        drop: Option<&mut DropContext<'_, R>>,
    ) -> Result<CapsuleGrid> {
        input.check(&self.name)?;
        let (batch_size, height, width, c_in) = input.dims();
        let (out_h, out_w) = self
            .output_hw(height, width)
            .ok_or_else(|| kernel_too_large(&self.name, &self.generator, height, width))?;
        let c_out = self.ncaps_out();

        // grille ou nombre de capsules différents de ceux vus à la construction
        let expected_weights = self.generator.n_weights(c_in, (out_h, out_w));
        if expected_weights != self.transforms.n_weights() {
            return Err(CapsError::Shape {
                context: format!("{}: transformations", self.name),
                expected: vec![self.transforms.n_weights()],
                actual: vec![expected_weights],
            });
        }

        let (activation_in, mask) = match drop {
            Some(ctx) if ctx.rate > 0.0 => {
                let mut activation = input.activation.clone();
                if self.dropout {
                    for a in activation.iter_mut() {
                        if ctx.rng.gen::<f32>() < ctx.rate {
                            *a = 0.0;
                        }
                    }
                }
                let mask = self.dropconnect.then(|| {
                    let n_in = self.generator.capsules_in_per_location(c_in);
                    Array5::from_shape_fn((batch_size, out_h, out_w, n_in, c_out), |_| {
                        if ctx.rng.gen::<f32>() < ctx.rate { 0.0 } else { 1.0 }
                    })
                });
                (activation, mask)
            }
            _ => (input.activation.clone(), None),
        };

        let votes = self
            .generator
            .generate(&input.pose.view(), &activation_in.view(), &self.transforms);

        let mut pose = Array5::zeros((batch_size, out_h, out_w, c_out, POSE_DIM));
        let mut activation = Array4::zeros((batch_size, out_h, out_w, c_out));

        // Routage indépendant par position, parallélisé par batch
        pose.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(activation.axis_iter_mut(Axis(0)).into_par_iter())
            .enumerate()
            .for_each(|(b, (mut batch_pose, mut batch_act))| {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let group_votes = votes.votes.slice(s![b, oh, ow, .., .., ..]);
                        let group_acts = votes.activations.slice(s![b, oh, ow, ..]);
                        let group_mask = mask.as_ref().map(|m| m.slice(s![b, oh, ow, .., ..]));

                        let (mean, act) = self.routing.route(
                            &group_votes,
                            &group_acts,
                            &self.params,
                            group_mask.as_ref(),
                        );

                        batch_pose.slice_mut(s![oh, ow, .., ..]).assign(&mean);
                        batch_act.slice_mut(s![oh, ow, ..]).assign(&act);
                    }
                }
            });

        let output = CapsuleGrid { pose, activation };
        output.check(&self.name)?;
        ensure_shape(
            &self.name,
            &[batch_size, out_h, out_w, c_out],
            output.activation.shape(),
        )?;

        debug!(layer = %self.name, pose = ?output.pose.shape(), "capsules routées");
        Ok(output)
    }
}

fn kernel_too_large(name: &str, generator: &VoteGenerator, height: usize, width: usize) -> CapsError {
    CapsError::Shape {
        context: format!("{name}: noyau plus grand que l'entrée"),
        expected: vec![generator.kernel.0, generator.kernel.1],
        actual: vec![height, width],
    }
}

impl Regularized for CapsLayer {
    fn l2_penalty(&self) -> Option<f32> {
        self.transforms.l2_penalty()
    }
}

/// Couche de capsules de classe (ou de fond), entièrement connectée
pub struct ClassCapsLayer {
    pub inner: CapsLayer,
}

impl ClassCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        config: &CapsLayerConfig,
        height: usize,
        width: usize,
        c_in: usize,
        coordinate_addition: bool,
        routing: EmRouting,
        l2_lambda: f32,
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self {
            inner: CapsLayer::fully_connected(
                config,
                height,
                width,
                c_in,
                coordinate_addition,
                routing,
                l2_lambda,
                rng,
            )?,
        })
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        input: &CapsuleGrid,
        drop: Option<&mut DropContext<'_, R>>,
    ) -> Result<ClassCapsules> {
        let grid = self.inner.forward(input, drop)?;
        let (batch_size, out_h, out_w, c_out) = grid.dims();
        ensure_shape(&self.inner.name, &[batch_size, 1, 1, c_out], &[batch_size, out_h, out_w, c_out])?;

        let pose = grid.pose.index_axis_move(Axis(1), 0).index_axis_move(Axis(1), 0);
        let activation = grid.activation.index_axis_move(Axis(1), 0).index_axis_move(Axis(1), 0);

        Ok(ClassCapsules { pose, activation })
    }
}

impl Regularized for ClassCapsLayer {
    fn l2_penalty(&self) -> Option<f32> {
        self.inner.l2_penalty()
    }
}
