use ndarray::{Array3, Array4, Array6, ArrayView4, ArrayView5, Axis};
use rand::Rng;
use rayon::prelude::*;

use super::layers::{init_normal, l2_of, Regularized};

pub const POSE_DIM: usize = 16;

/// Partage des transformations entre positions du noyau et positions de sortie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelSharing {
    /// Une transformation par (position du noyau, capsule d'entrée), partagée
    /// entre les positions de sortie comme une convolution
    #[default]
    PerPosition,
    /// Une transformation par type de capsule d'entrée, réutilisée à chaque
    /// position du noyau
    Shared,
    /// Localement connectée: une transformation par (position de sortie,
    /// position du noyau, capsule d'entrée)
    Unshared,
}

/// Matrices de transformation 4x4 apprises, [n_weights, c_out, 16]
#[derive(Debug, Clone)]
pub struct TransformWeights {
    pub weights: Array3<f32>,
    pub affine: bool,
    pub l2_lambda: f32,
}

impl TransformWeights {
    pub fn new<R: Rng + ?Sized>(
        n_weights: usize,
        c_out: usize,
        affine: bool,
        l2_lambda: f32,
        rng: &mut R,
    ) -> Self {
        let mut transforms = Self {
            weights: init_normal((n_weights, c_out, POSE_DIM), 1.0, rng),
            affine,
            l2_lambda,
        };
        if affine {
            transforms.project_affine();
        }
        transforms
    }

    /// Dernière ligne fixée à [0, 0, 0, 1]
    pub fn project_affine(&mut self) {
        for mut matrix in self.weights.lanes_mut(Axis(2)) {
            matrix[12] = 0.0;
            matrix[13] = 0.0;
            matrix[14] = 0.0;
            matrix[15] = 1.0;
        }
    }

    pub fn n_weights(&self) -> usize {
        self.weights.dim().0
    }

    pub fn c_out(&self) -> usize {
        self.weights.dim().1
    }

    /// Nombre de paramètres libres
    pub fn degrees_of_freedom(&self) -> usize {
        let per_matrix = if self.affine { 12 } else { POSE_DIM };
        self.n_weights() * self.c_out() * per_matrix
    }

    #[inline]
    fn entry(&self, w: usize, o: usize, idx: usize) -> f32 {
        if self.affine && idx >= 12 {
            if idx == 15 { 1.0 } else { 0.0 }
        } else {
            self.weights[[w, o, idx]]
        }
    }
}

impl Regularized for TransformWeights {
    fn l2_penalty(&self) -> Option<f32> {
        l2_of(self.l2_lambda, &self.weights)
    }
}

/// Votes d'une couche: [B, Ho, Wo, n_in, c_out, 16] et activations [B, Ho, Wo, n_in]
pub struct Votes {
    pub votes: Array6<f32>,
    pub activations: Array4<f32>,
}

impl Votes {
    pub fn capsules_in_per_location(&self) -> usize {
        self.votes.dim().3
    }

    pub fn votes_per_location(&self) -> usize {
        let (_, _, _, n_in, c_out, _) = self.votes.dim();
        n_in * c_out
    }
}

/// Générateur de votes pour une couche de capsules
#[derive(Debug, Clone, Copy)]
pub struct VoteGenerator {
    pub kernel: (usize, usize),
    pub stride: usize,
    pub sharing: KernelSharing,
    pub coordinate_addition: bool,
}

impl VoteGenerator {
    /// Couche convolutive: noyau k x k, padding VALID
    pub fn conv(kernel: usize, stride: usize, sharing: KernelSharing) -> Self {
        Self {
            kernel: (kernel, kernel),
            stride,
            sharing,
            coordinate_addition: false,
        }
    }

    /// Couche entièrement connectée sur toute l'étendue spatiale restante
    pub fn fully_connected(height: usize, width: usize, coordinate_addition: bool) -> Self {
        Self {
            kernel: (height, width),
            stride: 1,
            sharing: KernelSharing::Shared,
            coordinate_addition,
        }
    }

    pub fn output_hw(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let (kh, kw) = self.kernel;
        if height < kh || width < kw || self.stride == 0 {
            return None;
        }
        Some(((height - kh) / self.stride + 1, (width - kw) / self.stride + 1))
    }

    pub fn capsules_in_per_location(&self, c_in: usize) -> usize {
        self.kernel.0 * self.kernel.1 * c_in
    }

    /// Nombre de matrices de transformation à apprendre pour une grille de
    /// sortie `(out_h, out_w)`
    pub fn n_weights(&self, c_in: usize, (out_h, out_w): (usize, usize)) -> usize {
        let n_in = self.capsules_in_per_location(c_in);
        match self.sharing {
            KernelSharing::PerPosition => n_in,
            KernelSharing::Shared => c_in,
            KernelSharing::Unshared => out_h * out_w * n_in,
        }
    }

    /// pose [B, H, W, c_in, 16], activation [B, H, W, c_in]
    pub fn generate(
        &self,
        pose: &ArrayView5<f32>,
        activation: &ArrayView4<f32>,
        transforms: &TransformWeights,
    ) -> Votes {
        let (batch_size, height, width, c_in, _) = pose.dim();
        let (kh, kw) = self.kernel;
        let (out_h, out_w) = self.output_hw(height, width).unwrap_or((0, 0));
        let n_in = self.capsules_in_per_location(c_in);
        let c_out = transforms.c_out();

        let mut votes = Array6::zeros((batch_size, out_h, out_w, n_in, c_out, POSE_DIM));
        let mut activations = Array4::zeros((batch_size, out_h, out_w, n_in));

        votes
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(activations.axis_iter_mut(Axis(0)).into_par_iter())
            .enumerate()
            .for_each(|(b, (mut batch_votes, mut batch_acts))| {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        for i in 0..kh {
                            for j in 0..kw {
                                let h = oh * self.stride + i;
                                let w = ow * self.stride + j;

                                for c in 0..c_in {
                                    let nin = (i * kw + j) * c_in + c;
                                    let widx = match self.sharing {
                                        KernelSharing::PerPosition => nin,
                                        KernelSharing::Shared => c,
                                        KernelSharing::Unshared => (oh * out_w + ow) * n_in + nin,
                                    };
                                    batch_acts[[oh, ow, nin]] = activation[[b, h, w, c]];

                                    for o in 0..c_out {
                                        // vote = pose (4x4) x transformation (4x4)
                                        for r in 0..4 {
                                            for col in 0..4 {
                                                let mut sum = 0.0;
                                                for k in 0..4 {
                                                    sum += pose[[b, h, w, c, r * 4 + k]]
                                                        * transforms.entry(widx, o, k * 4 + col);
                                                }
                                                batch_votes[[oh, ow, nin, o, r * 4 + col]] = sum;
                                            }
                                        }

                                        if self.coordinate_addition {
                                            batch_votes[[oh, ow, nin, o, 3]] +=
                                                (h as f32 + 0.5) / height as f32;
                                            batch_votes[[oh, ow, nin, o, 7]] +=
                                                (w as f32 + 0.5) / width as f32;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            });

        Votes { votes, activations }
    }
}
