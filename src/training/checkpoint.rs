//! Parameter snapshots: a burn binary record plus a JSON manifest describing the network.

use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UnetError};
use crate::model::{NetworkConfig, Unet};

pub const FORMAT_VERSION: u32 = 1;
const MODEL_STEM: &str = "model";
const MANIFEST_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub format_version: u32,
    pub network: NetworkConfig,
    pub step: usize,
    pub num_params: usize,
}

/// Path of the parameter file inside a checkpoint directory.
pub fn model_path(dir: &Path) -> PathBuf {
    dir.join(format!("{MODEL_STEM}.bin"))
}

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

/// Writes the parameters and manifest into `dir`, replacing any previous checkpoint.
pub fn save<B: Backend>(model: &Unet<B>, step: usize, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    recorder
        .record(model.clone().into_record(), dir.join(MODEL_STEM))
        .map_err(|e| UnetError::Recorder(format!("{e:?}")))?;

    let manifest = CheckpointManifest {
        format_version: FORMAT_VERSION,
        network: model.config(),
        step,
        num_params: model.num_learnable(),
    };
    fs::write(manifest_path(dir), serde_json::to_string_pretty(&manifest)?)?;

    let path = model_path(dir);
    log::info!("checkpoint saved to {} (step {})", path.display(), step);
    Ok(path)
}

pub fn read_manifest(dir: &Path) -> Result<CheckpointManifest> {
    let path = manifest_path(dir);
    if !path.is_file() {
        return Err(UnetError::CheckpointMismatch(format!(
            "no manifest at {}",
            path.display()
        )));
    }
    let manifest: CheckpointManifest = serde_json::from_str(&fs::read_to_string(&path)?)?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(UnetError::CheckpointMismatch(format!(
            "format version {} is not supported (expected {FORMAT_VERSION})",
            manifest.format_version
        )));
    }
    Ok(manifest)
}

/// Loads saved parameters into `model`. The saved network must match exactly.
pub fn restore<B: Backend>(
    model: Unet<B>,
    dir: &Path,
    device: &B::Device,
) -> Result<(Unet<B>, usize)> {
    let manifest = read_manifest(dir)?;

    let config = model.config();
    if manifest.network != config {
        return Err(UnetError::CheckpointMismatch(format!(
            "checkpoint network {:?} differs from {:?}",
            manifest.network, config
        )));
    }
    let num_params = model.num_learnable();
    if manifest.num_params != num_params {
        return Err(UnetError::CheckpointMismatch(format!(
            "checkpoint has {} parameters, model has {}",
            manifest.num_params, num_params
        )));
    }

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(dir.join(MODEL_STEM), device)
        .map_err(|e| UnetError::Recorder(format!("{e:?}")))?;

    log::info!("restored {} (step {})", model_path(dir).display(), manifest.step);
    Ok((model.load_record(record), manifest.step))
}

/// Builds the network described by the manifest and restores it.
pub fn load<B: Backend>(dir: &Path, device: &B::Device) -> Result<(Unet<B>, CheckpointManifest)> {
    let manifest = read_manifest(dir)?;
    let model = Unet::new(device, &manifest.network)?;
    let (model, _) = restore(model, dir, device)?;
    Ok((model, manifest))
}
