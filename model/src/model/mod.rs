pub mod config;
pub mod error;
pub mod layers;
pub mod votes;
pub mod routing;
pub mod capsule;
pub mod decoder;
pub mod loss;
pub mod builder;
pub mod core;
pub mod baseline;

// Réexportations principales
pub use builder::ModelBuilder;
pub use config::CapsNetConfig;
pub use baseline::CnnBaseline;
pub use core::{CapsNet, ModelOutput, Network};
pub use error::{CapsError, Result};
pub use loss::{CarliniWagnerLoss, LossBreakdown, LossFunction, TotalLoss};
