// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::domain::Batch;
use crate::engine::executor::InferenceExecutor;
use crate::error::AppError;
use crate::model::registry::ModelRegistry;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::dispatcher::ResponseDispatcher;
use crate::pipeline::queue::PendingQueue;

/// 批处理调度器
///
/// 单任务调度循环：定时唤醒（等待上限粒度）或入队事件唤醒，
/// 收集到期批次后按最老到达时间顺序释放执行。
pub struct Batcher {
    queue: Arc<PendingQueue>,
    dispatcher: Arc<ResponseDispatcher>,
    registry: Arc<ModelRegistry>,
    executor: Arc<InferenceExecutor>,
    config: PipelineConfig,
    batches_released: AtomicU64,
    requests_expired: AtomicU64,
}

impl Batcher {
    pub fn new(
        queue: Arc<PendingQueue>,
        dispatcher: Arc<ResponseDispatcher>,
        registry: Arc<ModelRegistry>,
        executor: Arc<InferenceExecutor>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            dispatcher,
            registry,
            executor,
            config,
            batches_released: AtomicU64::new(0),
            requests_expired: AtomicU64::new(0),
        })
    }

    /// 启动调度循环
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            batcher.run_loop(shutdown).await;
        })
    }

    async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Batching loop started (max_batch_size={}, max_wait={}ms)",
            self.config.max_batch_size, self.config.max_wait_time_ms
        );

        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.queue.wait_for_work() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            self.drain_ready().await;
        }

        info!("Batching loop stopped");
    }

    /// 单次调度：剔除过期请求，释放到期批次
    pub async fn drain_ready(&self) {
        let now = Instant::now();
        let (expired, batches) = self
            .queue
            .collect_due(self.config.max_batch_size, self.config.max_wait(), now)
            .await;

        for request in expired {
            self.requests_expired.fetch_add(1, Ordering::Relaxed);
            self.dispatcher
                .complete(
                    request.request_id,
                    Err(AppError::DeadlineExceeded(format!(
                        "request for model {} expired before batching",
                        request.model_id
                    ))),
                )
                .await;
        }

        for batch in batches {
            self.batches_released.fetch_add(1, Ordering::Relaxed);
            self.dispatch(batch);
        }
    }

    // 每个批次独立执行：设备级串行由执行器的许可控制，
    // 不同设备（以及不同模型的加载）天然并行。
    fn dispatch(&self, batch: Batch) {
        debug!(
            "Releasing batch of {} for model {} (shape {:?})",
            batch.len(),
            batch.model_id,
            batch.shape
        );

        let registry = Arc::clone(&self.registry);
        let executor = Arc::clone(&self.executor);
        let dispatcher = Arc::clone(&self.dispatcher);

        tokio::spawn(async move {
            match registry.get_or_load(&batch.model_id).await {
                Ok(lease) => match executor.run(&batch, &lease).await {
                    Ok(outputs) => dispatcher.complete_batch(&batch, outputs).await,
                    Err(error) => dispatcher.fail_batch(&batch, error).await,
                },
                Err(error) => dispatcher.fail_batch(&batch, error).await,
            }
        });
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            batches_released: self.batches_released.load(Ordering::Relaxed),
            requests_expired: self.requests_expired.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatcherStats {
    pub batches_released: u64,
    pub requests_expired: u64,
}
