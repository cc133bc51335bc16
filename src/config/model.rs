// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::device::budget::DevicePreference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Text,
    Vision,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Text => "text",
            ModelKind::Vision => "vision",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub id: String,
    pub kind: ModelKind,
    /// 模型常驻内存占用，在元数据阶段即已知
    pub footprint_bytes: u64,
    #[serde(default)]
    pub device_preference: DevicePreference,
    #[serde(default)]
    pub output_dimension: Option<usize>,
    #[serde(default)]
    pub weights_file: Option<String>,
}

const DEFAULT_WEIGHTS_FILE: &str = "model.safetensors";

impl ModelMetadata {
    pub fn new(id: impl Into<String>, kind: ModelKind, footprint_bytes: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            footprint_bytes,
            device_preference: DevicePreference::default(),
            output_dimension: None,
            weights_file: None,
        }
    }

    pub fn with_preference(mut self, preference: DevicePreference) -> Self {
        self.device_preference = preference;
        self
    }

    pub fn with_output_dimension(mut self, dimension: usize) -> Self {
        self.output_dimension = Some(dimension);
        self
    }

    pub fn weights_file_name(&self) -> &str {
        self.weights_file.as_deref().unwrap_or(DEFAULT_WEIGHTS_FILE)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    entries: HashMap<String, ModelMetadata>,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelMetadata>) -> Self {
        let mut entries = HashMap::with_capacity(models.len());
        for model in models {
            entries.insert(model.id.clone(), model);
        }
        Self { entries }
    }

    pub fn get(&self, id: &str) -> Option<&ModelMetadata> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
