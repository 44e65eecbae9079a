use anyhow::{Context, Result, bail};
use opencv::imgcodecs;
use opencv::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_plslam::config::SystemConfig;
use rust_plslam::lines::{InstanceMasks, LineExtractor};

/// Read a single-channel mask image as one instance of `label`; any
/// non-zero pixel belongs to it.
fn load_instance_mask(path: &str, label: &str) -> Result<InstanceMasks> {
    let mask = imgcodecs::imread(path, imgcodecs::IMREAD_GRAYSCALE)
        .with_context(|| format!("Failed to read mask {}", path))?;
    if mask.empty() {
        bail!("Mask {} is empty or unreadable", path);
    }
    let bytes = mask.data_bytes().context("Mask is not continuous")?;
    let masks = bytes.iter().map(|&v| u8::from(v != 0)).collect();
    Ok(InstanceMasks::new(vec![label.to_string()], masks))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("Usage: {} <config.yaml> <image> [person_mask]", args[0]);
    }

    let config = SystemConfig::load(&args[1])?;
    let image = imgcodecs::imread(&args[2], imgcodecs::IMREAD_COLOR)
        .with_context(|| format!("Failed to read image {}", args[2]))?;
    if image.empty() {
        bail!("Image {} is empty or unreadable", args[2]);
    }

    let instances = match args.get(3) {
        Some(path) => Some(load_instance_mask(path, "person")?),
        None => None,
    };
    if instances.is_some() && !config.line_extractor.dynamic.classes.iter().any(|c| c == "person") {
        warn!("\"person\" is not a dynamic class; the mask will not suppress anything");
    }

    let mut extractor = LineExtractor::new(config.line_extractor.clone())?;
    let features = extractor.extract(&image, &Mat::default(), instances.as_ref())?;

    info!(
        lines = features.len(),
        levels = features.scales.num_levels(),
        detector = ?config.line_extractor.detector,
        "line extraction finished"
    );
    for (i, kl) in features.lines.iter().take(10).enumerate() {
        info!(
            "#{:<3} ({:7.1},{:7.1}) -> ({:7.1},{:7.1})  len {:6.1}  octave {}  response {:.3}",
            i, kl.start.x, kl.start.y, kl.end.x, kl.end.y, kl.length, kl.octave, kl.response
        );
    }
    Ok(())
}
