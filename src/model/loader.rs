// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::model::ModelMetadata;
use crate::device::budget::DeviceKind;
use crate::engine::{AnyModel, ForwardPass};
use crate::error::AppError;

#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(
        &self,
        metadata: &ModelMetadata,
        device: DeviceKind,
    ) -> Result<Arc<dyn ForwardPass>, AppError>;

    async fn is_cached(&self, metadata: &ModelMetadata) -> bool;
}

pub struct LocalModelLoader {
    model_dir: PathBuf,
}

impl LocalModelLoader {
    pub fn new(model_dir: PathBuf) -> Self {
        Self { model_dir }
    }

    fn model_path(&self, metadata: &ModelMetadata) -> PathBuf {
        self.model_dir.join(&metadata.id)
    }

    fn weights_path(&self, metadata: &ModelMetadata) -> PathBuf {
        self.model_path(metadata).join(metadata.weights_file_name())
    }

    fn validate_model_card(&self, model_path: &Path) -> Result<(), AppError> {
        let card_path = model_path.join("config.json");
        if !card_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&card_path).map_err(|e| {
            AppError::ModelLoadError(format!(
                "failed to read model card {}: {}",
                card_path.display(),
                e
            ))
        })?;

        serde_json::from_str::<serde_json::Value>(&content).map_err(|e| {
            AppError::ModelLoadError(format!(
                "corrupt model card {}: {}",
                card_path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

#[async_trait]
impl ModelLoader for LocalModelLoader {
    async fn load(
        &self,
        metadata: &ModelMetadata,
        device: DeviceKind,
    ) -> Result<Arc<dyn ForwardPass>, AppError> {
        let weights_path = self.weights_path(metadata);
        if !weights_path.exists() {
            return Err(AppError::ModelLoadError(format!(
                "weights not found at {}",
                weights_path.display()
            )));
        }

        self.validate_model_card(&self.model_path(metadata))?;

        debug!(
            "Loading model {} from {} onto {}",
            metadata.id,
            weights_path.display(),
            device
        );

        let model = AnyModel::resolve(metadata);
        info!("Model {} loaded onto {}", metadata.id, device);

        Ok(Arc::new(model))
    }

    async fn is_cached(&self, metadata: &ModelMetadata) -> bool {
        self.weights_path(metadata).exists()
    }
}
