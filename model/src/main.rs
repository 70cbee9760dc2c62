use anyhow::Context;
use capsnet_em::model::loss::{CarliniWagnerLoss, TotalLoss};
use capsnet_em::{CapsNetConfig, ModelBuilder, Network};
use ndarray::{Array1, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// smallNORB recadré: 32x32 en niveaux de gris, 5 catégories
const INPUT_SHAPE: (usize, usize, usize) = (32, 32, 1);
const NUM_CLASSES: usize = 5;

fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => CapsNetConfig::from_file(&path)
            .with_context(|| format!("lecture de la configuration {path}"))?,
        None => CapsNetConfig::default(),
    };
    info!(?config, "configuration");

    let (height, width, channels) = INPUT_SHAPE;
    let builder = ModelBuilder::new()
        .with_config(config.clone())
        .with_input_shape(height, width, channels)
        .with_num_classes(NUM_CLASSES);

    let mut model: Box<dyn Network> = if config.cnn.is_some() {
        Box::new(builder.build_baseline().context("construction de la ligne de base CNN")?)
    } else {
        let mut capsnet = builder.build().context("construction du modèle")?;
        capsnet.diagnostic()?;
        Box::new(capsnet)
    };
    info!(parameters = model.num_parameters(), "modèle construit");

    // Lot aléatoire de la taille vue par un réplica
    let batch_size = config.device_batch_size();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let images = Array4::from_shape_fn((batch_size, height, width, channels), |_| rng.gen::<f32>());
    let labels = Array1::from_shape_fn(batch_size, |_| rng.gen_range(0..NUM_CLASSES));

    let output = model.forward(&images.view(), true, Some(&labels.view()))?;
    let breakdown = TotalLoss::from_config(&config).compute(
        &output,
        &labels.view(),
        &model.regularization_losses(),
        0,
    )?;
    let cw = CarliniWagnerLoss::from_config(&config).compute(&output, &labels.view())?;

    println!("Sorties: {:?}", output.keys());
    println!("Perte totale: {:.6}", breakdown.total);
    println!("  classification: {:.6}", breakdown.classification);
    if let Some(reg) = breakdown.regularization {
        println!("  régularisation: {reg:.6}");
    }
    if let Some(recon) = breakdown.reconstruction {
        println!("  reconstruction: {recon:.6}");
    }
    println!("Perte Carlini-Wagner: {cw:.6}");

    Ok(())
}
