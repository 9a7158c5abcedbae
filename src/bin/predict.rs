use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::NdArray;
use clap::Parser;

use ivd_net::data::{DataProvider, FileProvider};
use ivd_net::training::{checkpoint, error_rate, snapshot};

type MyBackend = NdArray;

#[derive(Parser, Debug)]
#[command(author, version, about = "Segment samples with a trained checkpoint", long_about = None)]
struct Args {
    /// Checkpoint directory holding `model.bin` and `checkpoint.json`
    #[arg(short, long, default_value = "runs/unet")]
    checkpoint: PathBuf,

    /// Root directory searched for `*_fat.png` samples
    #[arg(short, long)]
    data: PathBuf,

    /// Output directory for the prediction image
    #[arg(short, long, default_value = "prediction")]
    output: PathBuf,

    /// Number of samples to predict
    #[arg(short, long, default_value_t = 4)]
    batch: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let device = Default::default();

    let (model, manifest) = checkpoint::load::<MyBackend>(&args.checkpoint, &device)
        .with_context(|| format!("loading checkpoint from {}", args.checkpoint.display()))?;
    log::info!(
        "loaded model trained for {} steps ({} parameters)",
        manifest.step,
        manifest.num_params
    );

    let mut provider = FileProvider::new(&args.data, model.n_class())?.without_shuffle();
    let batch = DataProvider::<MyBackend>::next_batch(&mut provider, args.batch, &device)?;

    let probabilities = model.predict(batch.images.clone())?;
    log::info!(
        "prediction error {:.2}%",
        error_rate(probabilities.clone(), batch.labels.clone())
    );

    snapshot::store_prediction(
        batch.images,
        batch.labels,
        probabilities,
        &args.output,
        "prediction",
    )?;
    log::info!("wrote {}", args.output.join("prediction.jpg").display());
    Ok(())
}
