// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use thiserror::Error;

// Clone 是必需的：single-flight 加载会把同一个失败广播给所有等待者。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    #[error("Model load error: {0}")]
    ModelLoadError(String),

    #[error("Out of device memory: {0}")]
    OutOfMemory(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Pipeline overloaded: {0}")]
    Overloaded(String),

    #[error("Inference error: {0}")]
    InferenceError(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// 判断失败是否应使批次内所有请求共同失败
    pub fn is_batch_wide(&self) -> bool {
        matches!(self, AppError::InferenceError(_))
    }
}
