// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 流水线配置
///
/// max_batch_size 与 max_wait_time_ms 共同构成 time-or-size 触发策略：
/// 批量换吞吐，等待上限保尾延迟。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// 单批次最大请求数
    pub max_batch_size: usize,
    /// 组内最老请求的最长等待时间（毫秒）
    pub max_wait_time_ms: u64,
    /// 待处理请求上限，超出即背压拒绝
    pub max_pending: usize,
    /// 每设备并发执行流数，默认 1（串行）
    pub streams_per_device: usize,
    /// admit 默认等待超时（秒）
    pub default_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_wait_time_ms: 20,
            max_pending: 1024,
            streams_per_device: 1,
            default_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// 调度循环的定时唤醒间隔，取等待上限的四分之一并限制在 1..=10ms
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis((self.max_wait_time_ms / 4).clamp(1, 10))
    }
}
