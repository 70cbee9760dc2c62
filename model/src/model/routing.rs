use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3};
use rand::Rng;
use std::f32::consts::PI;

use super::config::{sigmoid, InverseTemperature, RoutingConfig, RoutingInit};
use super::layers::init_normal;
use super::votes::POSE_DIM;

/// Plancher de variance avant log et inverse
pub const VARIANCE_FLOOR: f32 = 1e-6;
/// En dessous de cette masse routée, une capsule de sortie est éteinte
pub const MASS_FLOOR: f32 = 1e-8;
const LOG_FLOOR: f32 = 1e-12;

/// beta_v et beta_a appris, un par capsule de sortie
#[derive(Debug, Clone)]
pub struct RoutingParams {
    pub beta_v: Array1<f32>,
    pub beta_a: Array1<f32>,
}

impl RoutingParams {
    pub fn new<R: Rng + ?Sized>(c_out: usize, rng: &mut R) -> Self {
        Self {
            beta_v: init_normal(c_out, 0.01, rng),
            beta_a: init_normal(c_out, 0.01, rng),
        }
    }

    pub fn c_out(&self) -> usize {
        self.beta_a.len()
    }
}

/// Résultat d'une M-step
#[derive(Debug, Clone)]
pub struct MStep {
    pub mean: Array2<f32>,
    pub variance: Array2<f32>,
    pub activation: Array1<f32>,
    /// Σ_i R_ij * a_i
    pub mass: Array1<f32>,
}

/// État final du routage d'un groupe
#[derive(Debug, Clone)]
pub struct RoutingState {
    /// R [n_in, n_out] utilisé par la dernière M-step
    pub assignments: Array2<f32>,
    pub mean: Array2<f32>,
    pub variance: Array2<f32>,
    pub activation: Array1<f32>,
    /// Activations produites à chaque itération
    pub iteration_activations: Vec<Array1<f32>>,
}

/// Routage EM (mélange de gaussiennes par dimension de pose)
#[derive(Debug, Clone, Copy)]
pub struct EmRouting {
    pub iterations: usize,
    pub inverse_temperature: InverseTemperature,
    pub init: RoutingInit,
}

impl EmRouting {
    pub fn new(iterations: usize, inverse_temperature: InverseTemperature) -> Self {
        Self {
            iterations,
            inverse_temperature,
            init: RoutingInit::Uniform,
        }
    }

    pub fn with_init(mut self, init: RoutingInit) -> Self {
        self.init = init;
        self
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(config.iterations, config.inverse_temperature).with_init(config.init)
    }

    /// R réparti également sur les connexions autorisées, indépendamment des votes.
    /// Chaque ligne somme à 1 (`Uniform`) ou à l'activation initiale
    /// configurée; les lignes entièrement coupées restent à 0.
    pub fn initial_assignments(
        &self,
        n_in: usize,
        n_out: usize,
        mask: Option<&ArrayView2<f32>>,
    ) -> Array2<f32> {
        let mut assignments = Array2::zeros((n_in, n_out));
        for i in 0..n_in {
            let allowed = (0..n_out).filter(|&j| is_allowed(mask, i, j)).count();
            if allowed == 0 {
                continue;
            }
            let row_total = match self.init {
                RoutingInit::Uniform => 1.0,
                RoutingInit::Activation(value) => value,
            };
            let share = row_total / allowed as f32;
            for j in 0..n_out {
                if is_allowed(mask, i, j) {
                    assignments[[i, j]] = share;
                }
            }
        }
        assignments
    }

    /// votes [n_in, n_out, 16], activations d'entrée [n_in]
    pub fn m_step(
        &self,
        assignments: &ArrayView2<f32>,
        votes: &ArrayView3<f32>,
        activations_in: &ArrayView1<f32>,
        params: &RoutingParams,
        inverse_temperature: f32,
    ) -> MStep {
        let (n_in, n_out, dim) = votes.dim();

        let mut weighted = assignments.to_owned();
        for i in 0..n_in {
            let a = activations_in[i];
            for j in 0..n_out {
                weighted[[i, j]] *= a;
            }
        }

        let mut mean = Array2::zeros((n_out, dim));
        let mut variance = Array2::from_elem((n_out, dim), VARIANCE_FLOOR);
        let mut activation = Array1::zeros(n_out);
        let mut mass = Array1::zeros(n_out);

        for j in 0..n_out {
            let total: f32 = (0..n_in).map(|i| weighted[[i, j]]).sum();
            mass[j] = total;

            // capsule sans entrée: activation nulle, pas de NaN
            if total < MASS_FLOOR {
                continue;
            }

            for h in 0..dim {
                let mu = (0..n_in)
                    .map(|i| weighted[[i, j]] * votes[[i, j, h]])
                    .sum::<f32>()
                    / total;
                let var = (0..n_in)
                    .map(|i| {
                        let d = votes[[i, j, h]] - mu;
                        weighted[[i, j]] * d * d
                    })
                    .sum::<f32>()
                    / total;

                mean[[j, h]] = mu;
                variance[[j, h]] = var.max(VARIANCE_FLOOR);
            }

            let cost: f32 = (0..dim)
                .map(|h| (params.beta_v[j] + 0.5 * variance[[j, h]].ln()) * total)
                .sum();
            activation[j] = sigmoid(inverse_temperature * (params.beta_a[j] - cost));
        }

        MStep {
            mean,
            variance,
            activation,
            mass,
        }
    }

    /// Nouvelles affectations, normalisées sur les capsules de sortie autorisées
    pub fn e_step(
        &self,
        votes: &ArrayView3<f32>,
        m: &MStep,
        mask: Option<&ArrayView2<f32>>,
    ) -> Array2<f32> {
        let (n_in, n_out, dim) = votes.dim();

        // termes constants par capsule de sortie
        let log_norm: Vec<f32> = (0..n_out)
            .map(|j| {
                let log_det: f32 = (0..dim)
                    .map(|h| (2.0 * PI * m.variance[[j, h]]).ln())
                    .sum();
                m.activation[j].max(LOG_FLOOR).ln() - 0.5 * log_det
            })
            .collect();

        let mut assignments = Array2::zeros((n_in, n_out));
        let mut logits = vec![f32::NEG_INFINITY; n_out];

        for i in 0..n_in {
            let mut max_logit = f32::NEG_INFINITY;
            for j in 0..n_out {
                logits[j] = if is_allowed(mask, i, j) {
                    let quad: f32 = (0..dim)
                        .map(|h| {
                            let d = votes[[i, j, h]] - m.mean[[j, h]];
                            d * d / (2.0 * m.variance[[j, h]])
                        })
                        .sum();
                    log_norm[j] - quad
                } else {
                    f32::NEG_INFINITY
                };
                max_logit = max_logit.max(logits[j]);
            }

            if max_logit == f32::NEG_INFINITY {
                continue;
            }

            let mut sum = 0.0;
            for j in 0..n_out {
                let e = if logits[j] == f32::NEG_INFINITY {
                    0.0
                } else {
                    (logits[j] - max_logit).exp()
                };
                assignments[[i, j]] = e;
                sum += e;
            }
            for j in 0..n_out {
                assignments[[i, j]] /= sum;
            }
        }

        assignments
    }

    /// Routage complet depuis R uniforme
    pub fn route_with_state(
        &self,
        votes: &ArrayView3<f32>,
        activations_in: &ArrayView1<f32>,
        params: &RoutingParams,
        mask: Option<&ArrayView2<f32>>,
    ) -> RoutingState {
        let (n_in, n_out, _) = votes.dim();
        let initial = self.initial_assignments(n_in, n_out, mask);
        self.route_from(initial, votes, activations_in, params, mask)
    }

    /// Routage depuis des affectations données, sans arrêt anticipé
    pub fn route_from(
        &self,
        initial: Array2<f32>,
        votes: &ArrayView3<f32>,
        activations_in: &ArrayView1<f32>,
        params: &RoutingParams,
        mask: Option<&ArrayView2<f32>>,
    ) -> RoutingState {
        debug_assert_eq!(votes.dim().2, POSE_DIM);
        let mut assignments = initial;
        let mut iteration_activations = Vec::with_capacity(self.iterations);
        let mut last = None;

        for iteration in 0..self.iterations {
            let lambda = self.inverse_temperature.at(iteration);
            let m = self.m_step(&assignments.view(), votes, activations_in, params, lambda);
            iteration_activations.push(m.activation.clone());

            // pas d'E-step après la dernière M-step
            if iteration + 1 < self.iterations {
                assignments = self.e_step(votes, &m, mask);
            }
            last = Some(m);
        }

        let m = last.unwrap_or_else(|| {
            self.m_step(
                &assignments.view(),
                votes,
                activations_in,
                params,
                self.inverse_temperature.at(0),
            )
        });

        RoutingState {
            assignments,
            mean: m.mean,
            variance: m.variance,
            activation: m.activation,
            iteration_activations,
        }
    }

    /// (pose [n_out, 16], activation [n_out])
    pub fn route(
        &self,
        votes: &ArrayView3<f32>,
        activations_in: &ArrayView1<f32>,
        params: &RoutingParams,
        mask: Option<&ArrayView2<f32>>,
    ) -> (Array2<f32>, Array1<f32>) {
        let state = self.route_with_state(votes, activations_in, params, mask);
        (state.mean, state.activation)
    }
}

#[inline]
fn is_allowed(mask: Option<&ArrayView2<f32>>, i: usize, j: usize) -> bool {
    mask.map_or(true, |m| m[[i, j]] > 0.0)
}
