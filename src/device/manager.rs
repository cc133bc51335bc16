// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::app::DeviceConfig;
use crate::device::budget::{DeviceBudget, DeviceKind, DevicePreference, Reservation};
use crate::error::AppError;

#[derive(Clone)]
pub struct DeviceManager {
    // 预留判定与计数变更必须在同一临界区内，否则并发加载会超卖
    devices: Arc<Mutex<Vec<DeviceBudget>>>,
}

impl DeviceManager {
    pub fn new(cpu_total_bytes: u64, gpu_total_bytes: &[u64]) -> Self {
        let mut devices = Vec::with_capacity(gpu_total_bytes.len() + 1);
        for (index, total) in gpu_total_bytes.iter().enumerate() {
            devices.push(DeviceBudget::new(DeviceKind::Cuda(index), *total));
        }
        devices.push(DeviceBudget::new(DeviceKind::Cpu, cpu_total_bytes));

        Self {
            devices: Arc::new(Mutex::new(devices)),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        let gpus: Vec<u64> = config
            .gpu_memory_mb
            .iter()
            .map(|mb| mb * 1024 * 1024)
            .collect();
        Self::new(config.cpu_memory_mb * 1024 * 1024, &gpus)
    }

    pub async fn reserve(
        &self,
        preference: DevicePreference,
        bytes: u64,
    ) -> Result<Reservation, AppError> {
        let mut devices = self.devices.lock().await;

        for budget in Self::ordered_mut(&mut devices, preference) {
            if budget.can_fit(bytes) {
                budget.reserved_bytes += bytes;
                debug_assert!(budget.reserved_bytes <= budget.total_bytes);

                debug!(
                    "Reserved {} bytes on {} (reserved {}/{})",
                    bytes, budget.device, budget.reserved_bytes, budget.total_bytes
                );

                return Ok(Reservation {
                    device: budget.device,
                    bytes,
                });
            }
        }

        Err(AppError::OutOfMemory(format!(
            "no device with {} free bytes (preference {:?})",
            bytes, preference
        )))
    }

    /// 驱逐后针对单一设备重试预留
    pub async fn reserve_on(
        &self,
        device: DeviceKind,
        bytes: u64,
    ) -> Result<Reservation, AppError> {
        let mut devices = self.devices.lock().await;

        let budget = devices
            .iter_mut()
            .find(|b| b.device == device)
            .ok_or_else(|| AppError::Internal(format!("unknown device {}", device)))?;

        if !budget.can_fit(bytes) {
            return Err(AppError::OutOfMemory(format!(
                "device {} has {} free bytes, {} needed",
                device,
                budget.free_bytes(),
                bytes
            )));
        }

        budget.reserved_bytes += bytes;
        debug_assert!(budget.reserved_bytes <= budget.total_bytes);

        Ok(Reservation { device, bytes })
    }

    pub async fn release(&self, device: DeviceKind, bytes: u64) {
        let mut devices = self.devices.lock().await;

        if let Some(budget) = devices.iter_mut().find(|b| b.device == device) {
            if budget.reserved_bytes < bytes {
                warn!(
                    "Release of {} bytes exceeds reservation on {} ({} reserved)",
                    bytes, device, budget.reserved_bytes
                );
            }
            budget.reserved_bytes = budget.reserved_bytes.saturating_sub(bytes);
            debug!(
                "Released {} bytes on {} (reserved {}/{})",
                bytes, device, budget.reserved_bytes, budget.total_bytes
            );
        }
    }

    /// 记录一次加载并返回新的设备代数
    pub async fn note_load(&self, device: DeviceKind) -> u64 {
        self.bump_generation(device).await
    }

    /// 记录一次驱逐并返回新的设备代数
    pub async fn note_evict(&self, device: DeviceKind) -> u64 {
        self.bump_generation(device).await
    }

    async fn bump_generation(&self, device: DeviceKind) -> u64 {
        let mut devices = self.devices.lock().await;
        if let Some(budget) = devices.iter_mut().find(|b| b.device == device) {
            budget.generation += 1;
            budget.generation
        } else {
            0
        }
    }

    pub async fn generation(&self, device: DeviceKind) -> u64 {
        let devices = self.devices.lock().await;
        devices
            .iter()
            .find(|b| b.device == device)
            .map(|b| b.generation)
            .unwrap_or(0)
    }

    pub async fn budget(&self, device: DeviceKind) -> Option<DeviceBudget> {
        let devices = self.devices.lock().await;
        devices.iter().find(|b| b.device == device).cloned()
    }

    pub async fn candidates(&self, preference: DevicePreference) -> Vec<DeviceKind> {
        let devices = self.devices.lock().await;
        devices
            .iter()
            .filter(|b| Self::matches(b.device, preference))
            .map(|b| b.device)
            .collect()
    }

    pub async fn stats(&self) -> DeviceManagerStats {
        let devices = self.devices.lock().await;
        DeviceManagerStats {
            total_reserved_bytes: devices.iter().map(|b| b.reserved_bytes).sum(),
            devices: devices.clone(),
        }
    }

    fn matches(device: DeviceKind, preference: DevicePreference) -> bool {
        match preference {
            DevicePreference::Auto => true,
            DevicePreference::Gpu => device.is_gpu(),
            DevicePreference::Cpu => device == DeviceKind::Cpu,
        }
    }

    // 设备向量的构造顺序即偏好顺序：GPU 按序号在前，CPU 最后
    fn ordered_mut(
        devices: &mut [DeviceBudget],
        preference: DevicePreference,
    ) -> impl Iterator<Item = &mut DeviceBudget> {
        devices
            .iter_mut()
            .filter(move |b| Self::matches(b.device, preference))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceManagerStats {
    pub devices: Vec<DeviceBudget>,
    pub total_reserved_bytes: u64,
}
