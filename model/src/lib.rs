//! Réseau de capsules matricielles avec routage EM: passe avant et pertes.

pub mod model;

pub use model::{
    CapsError, CapsNet, CapsNetConfig, CnnBaseline, ModelBuilder, ModelOutput, Network, Result,
};
