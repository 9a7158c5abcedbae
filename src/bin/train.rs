use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray};
use clap::Parser;

use ivd_net::data::{CircleConfig, FileProvider, SyntheticProvider};
use ivd_net::training::{self, TrainingConfig};

type MyBackend = NdArray;
type MyAutodiffBackend = Autodiff<MyBackend>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train the multi-tower inception U-Net", long_about = None)]
struct Args {
    /// YAML training config; written with defaults when missing
    #[arg(short, long, default_value = "configs/train_config.yaml")]
    config: PathBuf,

    /// Train on generated discs instead of files
    #[arg(long)]
    synthetic: bool,

    /// Root directory searched for `*_fat.png` samples
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Side length of synthetic images
    #[arg(long, default_value_t = 64)]
    size: usize,

    /// Overrides the configured number of epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Continue from the checkpoint in the output path
    #[arg(long)]
    restore: bool,
}

#[derive(Debug, PartialEq)]
enum DataSource<'a> {
    Files(&'a Path),
    /// `fallback` is set when no data source was requested at all.
    Synthetic { fallback: bool },
}

fn data_source(args: &Args) -> DataSource<'_> {
    match (&args.data, args.synthetic) {
        (Some(root), false) => DataSource::Files(root),
        (data, synthetic) => DataSource::Synthetic {
            fallback: data.is_none() && !synthetic,
        },
    }
}

fn load_config(args: &Args) -> Result<TrainingConfig> {
    let mut config = if args.config.exists() {
        log::info!("loading config from {}", args.config.display());
        TrainingConfig::from_yaml(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?
    } else {
        let config = TrainingConfig::default();
        if let Some(parent) = args.config.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(&args.config)?;
        log::info!("created default config at {}", args.config.display());
        config
    };

    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    config.restore |= args.restore;
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(&args)?;

    log::info!(
        "network: {} levels, {} root features, {} classes, {} aux heads",
        config.network.levels,
        config.network.features_root,
        config.network.n_class,
        config.network.aux_heads
    );
    log::info!(
        "loss: {}, epochs: {}, iters/epoch: {}, batch size: {}",
        config.loss.name,
        config.epochs,
        config.training_iters,
        config.batch_size
    );

    let device = Default::default();
    let checkpoint = match data_source(&args) {
        DataSource::Files(root) => {
            let mut provider = FileProvider::new(root, config.network.n_class)?;
            training::train::<MyAutodiffBackend, _>(config, &mut provider, device)?
        }
        DataSource::Synthetic { fallback } => {
            if fallback {
                log::warn!("no --data given, falling back to synthetic images");
            }
            log::info!("training on synthetic {0}x{0} images", args.size);
            let mut provider =
                SyntheticProvider::new(args.size, args.size, CircleConfig::default())?;
            training::train::<MyAutodiffBackend, _>(config, &mut provider, device)?
        }
    };

    log::info!("checkpoint: {}", checkpoint.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_source_selection() {
        let args = Args::parse_from(["train"]);
        assert_eq!(data_source(&args), DataSource::Synthetic { fallback: true });

        let args = Args::parse_from(["train", "--synthetic"]);
        assert_eq!(data_source(&args), DataSource::Synthetic { fallback: false });

        let args = Args::parse_from(["train", "--data", "samples"]);
        assert_eq!(data_source(&args), DataSource::Files(Path::new("samples")));

        let args = Args::parse_from(["train", "--data", "samples", "--synthetic"]);
        assert_eq!(data_source(&args), DataSource::Synthetic { fallback: false });
    }
}
