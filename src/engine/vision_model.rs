// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use ndarray::{Array1, ArrayD, Axis};
use tracing::debug;

use crate::engine::ForwardPass;
use crate::error::AppError;

/// 视觉模型参考实现：对 [channel, h, w] 输入做全局平均池化
pub struct VisionModel {
    name: String,
}

impl VisionModel {
    pub fn new(name: String) -> Self {
        debug!("Creating VisionModel {}", name);
        Self { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pool(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, AppError> {
        if input.ndim() < 3 {
            return Err(AppError::InferenceError(format!(
                "model {} expects [channel, h, w] input, got {} dims",
                self.name,
                input.ndim()
            )));
        }

        let channels = input.shape()[0];
        let mut pooled = Array1::<f32>::zeros(channels);

        for channel in 0..channels {
            let plane = input.index_axis(Axis(0), channel);
            pooled[channel] = plane.mean().ok_or_else(|| {
                AppError::InferenceError(format!(
                    "model {} received empty channel plane",
                    self.name
                ))
            })?;
        }

        Ok(pooled.into_dyn())
    }
}

impl ForwardPass for VisionModel {
    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>, AppError> {
        inputs.iter().map(|input| self.pool(input)).collect()
    }
}
