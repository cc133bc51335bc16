// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use ndarray::{ArrayD, Axis};
use tracing::debug;

use crate::engine::ForwardPass;
use crate::error::AppError;

/// 文本模型参考实现：对 [seq, hidden] 输入做 mean pooling
///
/// 真实权重后端通过 ForwardPass 接入；本实现只承担契约与形状校验。
pub struct TextModel {
    name: String,
    dimension: Option<usize>,
}

impl TextModel {
    pub fn new(name: String, dimension: Option<usize>) -> Self {
        debug!("Creating TextModel {} (dimension {:?})", name, dimension);
        Self { name, dimension }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pool(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, AppError> {
        if input.ndim() < 2 {
            return Err(AppError::InferenceError(format!(
                "model {} expects [seq, hidden] input, got {} dims",
                self.name,
                input.ndim()
            )));
        }

        let pooled = input.mean_axis(Axis(0)).ok_or_else(|| {
            AppError::InferenceError(format!("model {} received empty sequence", self.name))
        })?;

        if let Some(expected) = self.dimension {
            let actual = pooled.shape().last().copied().unwrap_or(0);
            if actual != expected {
                return Err(AppError::InferenceError(format!(
                    "model {} produced dimension {}, expected {}",
                    self.name, actual, expected
                )));
            }
        }

        Ok(pooled)
    }
}

impl ForwardPass for TextModel {
    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>, AppError> {
        inputs.iter().map(|input| self.pool(input)).collect()
    }
}
