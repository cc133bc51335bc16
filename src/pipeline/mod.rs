// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 推理请求流水线
//!
//! admit -> 分组排队 -> time-or-size 批处理 -> 设备串行执行 -> 结果分发。
//! 每个被准入的请求恰好完成一次，无论成功、失败还是超时。

mod batcher;
pub mod config;
mod dispatcher;
mod queue;

pub use batcher::{Batcher, BatcherStats};
pub use config::PipelineConfig;
pub use dispatcher::ResponseDispatcher;
pub use queue::PendingQueue;

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::app::AppConfig;
use crate::config::model::ModelCatalog;
use crate::domain::{InferOutput, InferRequest, InferResult, QueuedRequest};
use crate::engine::executor::{ExecutorStats, InferenceExecutor};
use crate::error::AppError;
use crate::model::loader::{LocalModelLoader, ModelLoader};
use crate::model::registry::{ModelRegistry, RegistryStats};

/// 推理流水线入口
pub struct InferencePipeline {
    queue: Arc<PendingQueue>,
    dispatcher: Arc<ResponseDispatcher>,
    registry: Arc<ModelRegistry>,
    executor: Arc<InferenceExecutor>,
    batcher: Arc<Batcher>,
    config: PipelineConfig,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// 已准入请求的凭据：可等待结果，也可用于取消
pub struct InferTicket {
    request_id: Uuid,
    rx: oneshot::Receiver<InferResult>,
}

impl InferTicket {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub async fn await_output(self) -> Result<InferOutput, AppError> {
        self.rx
            .await
            .map_err(|_| AppError::Internal("result slot dropped before completion".to_string()))?
    }
}

impl InferencePipeline {
    /// 组装并启动流水线
    pub fn start(config: PipelineConfig, registry: Arc<ModelRegistry>) -> Self {
        let queue = Arc::new(PendingQueue::new(config.max_pending));
        let dispatcher = Arc::new(ResponseDispatcher::new());
        let executor = Arc::new(InferenceExecutor::new(
            Arc::clone(&registry),
            config.streams_per_device,
        ));
        let batcher = Batcher::new(
            Arc::clone(&queue),
            Arc::clone(&dispatcher),
            Arc::clone(&registry),
            Arc::clone(&executor),
            config.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = batcher.spawn(shutdown_rx);

        info!("Inference pipeline started");

        Self {
            queue,
            dispatcher,
            registry,
            executor,
            batcher,
            config,
            shutdown_tx,
            loop_handle: Mutex::new(Some(handle)),
        }
    }

    /// 按应用配置组装：设备账本、本地加载器与模型目录均来自配置
    pub fn from_config(config: &AppConfig) -> Self {
        let devices = crate::device::manager::DeviceManager::from_config(&config.devices);
        let loader = Arc::new(LocalModelLoader::new(config.registry.model_dir_path()))
            as Arc<dyn ModelLoader>;
        let registry = Arc::new(ModelRegistry::new(
            ModelCatalog::new(config.models.clone()),
            loader,
            devices,
        ));
        Self::start(config.pipeline.clone(), registry)
    }

    /// 准入一个请求并等待其结果
    pub async fn admit(&self, request: InferRequest) -> Result<InferOutput, AppError> {
        let ticket = self.submit(request).await?;
        ticket.await_output().await
    }

    /// 准入一个请求，返回可取消的凭据
    pub async fn submit(&self, request: InferRequest) -> Result<InferTicket, AppError> {
        if request.model_id.is_empty() {
            return Err(AppError::InvalidInput("empty model id".to_string()));
        }
        if request.payload.is_empty() {
            return Err(AppError::InvalidInput("empty payload".to_string()));
        }

        // 准入时立即判定已过期的 deadline，绝不入队
        if let Some(deadline) = request.deadline
            && deadline <= Instant::now()
        {
            return Err(AppError::DeadlineExceeded(format!(
                "deadline already passed for model {}",
                request.model_id
            )));
        }

        let request_id = Uuid::new_v4();
        let rx = self.dispatcher.register(request_id).await;
        let queued = QueuedRequest::from_request(request_id, request);

        if let Err(error) = self.queue.enqueue(queued).await {
            self.dispatcher.discard(request_id).await;
            return Err(error);
        }

        Ok(InferTicket { request_id, rx })
    }

    /// 取消尚未进入批次的请求；已批次化的请求会运行至完成
    pub async fn cancel(&self, request_id: Uuid) -> bool {
        match self.queue.remove(request_id).await {
            Some(request) => {
                self.dispatcher
                    .complete(
                        request.request_id,
                        Err(AppError::Cancelled(format!(
                            "request for model {} cancelled before batching",
                            request.model_id
                        ))),
                    )
                    .await;
                true
            }
            None => false,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn stats(&self) -> PipelineStats {
        PipelineStats {
            pending_requests: self.queue.size(),
            inflight_slots: self.dispatcher.pending_count().await,
            batcher: self.batcher.stats(),
            executor: self.executor.stats(),
            registry: self.registry.stats().await,
        }
    }

    /// 停止调度循环并让尚未批次化的请求以 Cancelled 完成
    pub async fn shutdown(&self) {
        info!("Shutting down inference pipeline");

        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }

        let drained = self.queue.drain_all().await;
        if !drained.is_empty() {
            warn!("Failing {} pending requests on shutdown", drained.len());
        }
        for request in drained {
            self.dispatcher
                .complete(
                    request.request_id,
                    Err(AppError::Cancelled("pipeline shut down".to_string())),
                )
                .await;
        }

        self.registry.unload_all().await;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub pending_requests: usize,
    pub inflight_slots: usize,
    pub batcher: BatcherStats,
    pub executor: ExecutorStats,
    pub registry: RegistryStats,
}
