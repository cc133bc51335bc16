// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use ndarray::ArrayD;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::device::budget::DeviceKind;
use crate::domain::{Batch, InferOutput};
use crate::error::AppError;
use crate::model::handle::ModelLease;
use crate::model::registry::ModelRegistry;

/// 推理执行器
///
/// 每个设备同一时刻只执行一个批次（streams_per_device 可放宽），
/// 批次内任何失败都是整批失败。
pub struct InferenceExecutor {
    registry: Arc<ModelRegistry>,
    streams: Mutex<HashMap<DeviceKind, Arc<Semaphore>>>,
    streams_per_device: usize,
    batches_executed: AtomicU64,
    batches_failed: AtomicU64,
}

impl InferenceExecutor {
    pub fn new(registry: Arc<ModelRegistry>, streams_per_device: usize) -> Self {
        Self {
            registry,
            streams: Mutex::new(HashMap::new()),
            streams_per_device: streams_per_device.max(1),
            batches_executed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
        }
    }

    pub async fn run(
        &self,
        batch: &Batch,
        lease: &ModelLease,
    ) -> Result<Vec<InferOutput>, AppError> {
        let semaphore = self.device_slot(lease.device()).await;
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| AppError::Internal("device execution slot closed".to_string()))?;

        debug!(
            "Executing batch of {} for model {} on {}",
            batch.len(),
            batch.model_id,
            lease.device()
        );

        let started = Instant::now();
        let inputs: Vec<ArrayD<f32>> = batch
            .requests
            .iter()
            .map(|request| request.payload.clone())
            .collect();

        match lease.model().forward(&inputs) {
            Ok(outputs) if outputs.len() == batch.len() => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.batches_executed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Batch for model {} completed in {}ms",
                    batch.model_id, elapsed_ms
                );

                Ok(outputs
                    .into_iter()
                    .map(|output| InferOutput {
                        output,
                        processing_time_ms: elapsed_ms,
                    })
                    .collect())
            }
            Ok(outputs) => {
                self.fail_batch(batch, lease).await;
                Err(AppError::InferenceError(format!(
                    "model {} returned {} outputs for {} inputs",
                    batch.model_id,
                    outputs.len(),
                    batch.len()
                )))
            }
            Err(e) => {
                self.fail_batch(batch, lease).await;
                let error = match e {
                    AppError::InferenceError(_) => e,
                    other => AppError::InferenceError(other.to_string()),
                };
                Err(error)
            }
        }
    }

    // 执行故障使句柄的设备指派失效；携带代数，过期上报会被注册表忽略
    async fn fail_batch(&self, batch: &Batch, lease: &ModelLease) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Batch of {} for model {} failed on {}",
            batch.len(),
            batch.model_id,
            lease.device()
        );
        self.registry
            .invalidate(batch.model_id.as_str(), lease.generation())
            .await;
    }

    async fn device_slot(&self, device: DeviceKind) -> Arc<Semaphore> {
        let mut streams = self.streams.lock().await;
        Arc::clone(
            streams
                .entry(device)
                .or_insert_with(|| Arc::new(Semaphore::new(self.streams_per_device))),
        )
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            batches_executed: self.batches_executed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub batches_executed: u64,
    pub batches_failed: u64,
}
