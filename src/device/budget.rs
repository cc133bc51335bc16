// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "index")]
pub enum DeviceKind {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

impl DeviceKind {
    pub fn is_gpu(&self) -> bool {
        matches!(self, DeviceKind::Cuda(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// GPU 优先，显存不足时回退 CPU
    Auto,
    /// 仅 GPU
    Gpu,
    /// 仅 CPU
    Cpu,
}

impl Default for DevicePreference {
    fn default() -> Self {
        DevicePreference::Auto
    }
}

/// 单设备内存账本，预留/释放均在 DeviceManager 的临界区内完成
#[derive(Debug, Clone, Serialize)]
pub struct DeviceBudget {
    pub device: DeviceKind,
    pub total_bytes: u64,
    pub reserved_bytes: u64,
    /// 单调代数，每次 load/evict 递增，用于识别过期句柄
    pub generation: u64,
}

impl DeviceBudget {
    pub fn new(device: DeviceKind, total_bytes: u64) -> Self {
        Self {
            device,
            total_bytes,
            reserved_bytes: 0,
            generation: 0,
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.reserved_bytes)
    }

    pub fn can_fit(&self, bytes: u64) -> bool {
        self.free_bytes() >= bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub device: DeviceKind,
    pub bytes: u64,
}
