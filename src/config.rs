//! YAML system configuration.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::lines::LineExtractorConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub line_extractor: LineExtractorConfig,
}

impl SystemConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let config: Self =
            serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.line_extractor
            .validate()
            .context("Invalid line_extractor section")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lines::DetectorKind;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: SystemConfig = serde_yaml::from_str("line_extractor:\n  num_levels: 4\n").unwrap();
        assert_eq!(config.line_extractor.num_levels, 4);
        assert_eq!(config.line_extractor.n_features, 200);
        assert_eq!(config.line_extractor.detector, DetectorKind::Lsd);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_invalid() {
        let path = std::env::temp_dir().join(format!("plslam_config_{}.yaml", std::process::id()));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "line_extractor:\n  num_levels: 0").unwrap();
        drop(file);

        let err = SystemConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("num_levels"));
        std::fs::remove_file(&path).unwrap();

        assert!(SystemConfig::load("/nonexistent/config.yaml").is_err());
    }
}
