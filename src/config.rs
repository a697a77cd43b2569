//! Vision Server Configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub model: ModelConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Which inference backend to load: "onnx" or "candle".
    pub backend: String,
    /// Identifier reported on the readiness line and in health responses.
    pub model_id: String,
    /// Directory holding the model artifacts (graph/safetensors, tokenizer.json).
    pub model_dir: PathBuf,
    /// Intra-op thread count for the ONNX session.
    pub num_threads: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, crate::ServerError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::ServerError::Config {
                message: format!("cannot read {}: {}", path.as_ref().display(), e),
            }
        })?;
        let config: ServerConfig =
            toml::from_str(&content).map_err(|e| crate::ServerError::Config {
                message: format!("cannot parse {}: {}", path.as_ref().display(), e),
            })?;
        Ok(config.with_env_overrides())
    }

    /// Load from the given path, falling back to defaults when the file is absent.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, crate::ServerError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Environment variables take precedence over the file: `MODEL_DIR` for
    /// the artifact directory and `VISION_METRICS_PORT` for the exporter.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("MODEL_DIR") {
            self.model.model_dir = PathBuf::from(dir);
        }
        if let Ok(port) = std::env::var("VISION_METRICS_PORT") {
            if let Ok(port) = port.parse() {
                self.metrics.port = port;
            }
        }
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: "onnx".to_string(),
            model_id: "colqwen2.5-3b-multilingual".to_string(),
            model_dir: PathBuf::from("models/colqwen2.5"),
            num_threads: 4,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.model.backend, "onnx");
        assert_eq!(config.metrics.port, 8300);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_partial_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            [model]
            backend = "candle"
            model_id = "colpali-v1.2"
        "#,
        )
        .unwrap();
        assert_eq!(config.model.backend, "candle");
        assert_eq!(config.model.model_id, "colpali-v1.2");
        // Unspecified sections fall back to defaults
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ServerConfig::load_or_default("does-not-exist.toml").unwrap();
        assert_eq!(config.model.backend, "onnx");
    }
}
