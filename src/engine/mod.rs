// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

pub mod executor;
pub mod text_model;
pub mod vision_model;

pub use executor::{ExecutorStats, InferenceExecutor};
pub use text_model::TextModel;
pub use vision_model::VisionModel;

use ndarray::ArrayD;

use crate::config::model::{ModelKind, ModelMetadata};
use crate::error::AppError;

/// 前向计算抽象接口
///
/// 流水线只依赖这一契约；具体数值实现对调度层完全不透明。
pub trait ForwardPass: Send + Sync {
    /// 对一个批次执行前向计算，返回与输入等长且顺序对齐的输出
    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>, AppError>;
}

/// 能力标签化的模型变体，在加载时一次性解析，而不是逐请求分发
pub enum AnyModel {
    Text(TextModel),
    Vision(VisionModel),
}

impl AnyModel {
    pub fn resolve(metadata: &ModelMetadata) -> Self {
        match metadata.kind {
            ModelKind::Text => AnyModel::Text(TextModel::new(
                metadata.id.clone(),
                metadata.output_dimension,
            )),
            ModelKind::Vision => AnyModel::Vision(VisionModel::new(metadata.id.clone())),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            AnyModel::Text(_) => ModelKind::Text,
            AnyModel::Vision(_) => ModelKind::Vision,
        }
    }
}

impl ForwardPass for AnyModel {
    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>, AppError> {
        match self {
            AnyModel::Text(model) => model.forward(inputs),
            AnyModel::Vision(model) => model.forward(inputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{ModelKind, ModelMetadata};

    #[test]
    fn test_resolve_by_kind() {
        let text = AnyModel::resolve(&ModelMetadata::new("t", ModelKind::Text, 1));
        let vision = AnyModel::resolve(&ModelMetadata::new("v", ModelKind::Vision, 1));

        assert_eq!(text.kind(), ModelKind::Text);
        assert_eq!(vision.kind(), ModelKind::Vision);
    }
}
