// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

pub mod config;
pub mod device;
pub mod domain;
pub mod engine;
pub mod error;
pub mod model;
pub mod pipeline;

pub use config::app::{AppConfig, ConfigError, ConfigLoader, DeviceConfig, RegistryConfig};
pub use config::model::{ModelCatalog, ModelKind, ModelMetadata};
pub use device::budget::{DeviceBudget, DeviceKind, DevicePreference};
pub use device::manager::DeviceManager;
pub use domain::{InferOutput, InferRequest, InferResult};
pub use engine::executor::InferenceExecutor;
pub use engine::{AnyModel, ForwardPass, TextModel, VisionModel};
pub use error::AppError;
pub use model::handle::{ModelHandle, ModelLease};
pub use model::loader::{LocalModelLoader, ModelLoader};
pub use model::registry::ModelRegistry;
pub use pipeline::config::PipelineConfig;
pub use pipeline::{InferTicket, InferencePipeline, PipelineStats};
