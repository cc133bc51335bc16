// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::model::ModelMetadata;
use crate::pipeline::config::PipelineConfig;

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct AppConfig {
    pub devices: DeviceConfig,
    pub registry: RegistryConfig,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub models: Vec<ModelMetadata>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DeviceConfig {
    pub cpu_memory_mb: u64,
    #[serde(default)]
    pub gpu_memory_mb: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RegistryConfig {
    pub model_dir: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cpu_memory_mb: 16384,
            gpu_memory_mb: Vec::new(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            model_dir: "models".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn model_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.model_dir)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            devices: DeviceConfig::default(),
            registry: RegistryConfig::default(),
            pipeline: PipelineConfig::default(),
            models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_prefix: "INFERBOOST".to_string(),
        }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = config::Config::builder();

        config = config.set_default("devices.cpu_memory_mb", 16384)?;

        config = config.set_default("registry.model_dir", "models")?;

        config = config.set_default("pipeline.max_batch_size", 32)?;
        config = config.set_default("pipeline.max_wait_time_ms", 20)?;
        config = config.set_default("pipeline.max_pending", 1024)?;
        config = config.set_default("pipeline.streams_per_device", 1)?;
        config = config.set_default("pipeline.default_timeout_secs", 30)?;

        if let Some(path) = &self.config_path {
            if path.exists() {
                config =
                    config.add_source(config::File::with_name(path.to_string_lossy().as_ref()));
            }
        } else {
            let default_config = PathBuf::from("config.toml");
            if default_config.exists() {
                config = config.add_source(config::File::with_name("config"));
            }
        }

        config = config.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .ignore_empty(true),
        );

        config.build()?.try_deserialize().map_err(ConfigError::from)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Message(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Message(e.to_string())
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        ConfigLoader::new().load()
    }

    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::new().with_config_path(path).load()
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
