// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::{Batch, InferOutput, InferResult};
use crate::error::AppError;

struct PendingSlot {
    tx: oneshot::Sender<InferResult>,
    registered_at: Instant,
}

/// 响应分发器
///
/// 每个请求在准入时注册一个 one-shot 结果槽，且只能完成一次；
/// 重复完成属于内部缺陷，触发断言而不是用户可见路径。
pub struct ResponseDispatcher {
    pending: RwLock<HashMap<Uuid, PendingSlot>>,
    completed: AtomicU64,
}

impl ResponseDispatcher {
    pub fn new() -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            completed: AtomicU64::new(0),
        }
    }

    /// 注册结果槽
    pub async fn register(&self, request_id: Uuid) -> oneshot::Receiver<InferResult> {
        let (tx, rx) = oneshot::channel();

        let slot = PendingSlot {
            tx,
            registered_at: Instant::now(),
        };
        self.pending.write().await.insert(request_id, slot);

        debug!("Registered result slot for request {}", request_id);
        rx
    }

    /// 完成结果槽（恰好一次）
    pub async fn complete(&self, request_id: Uuid, result: InferResult) {
        let slot = self.pending.write().await.remove(&request_id);

        match slot {
            Some(slot) => {
                let elapsed = slot.registered_at.elapsed();
                self.completed.fetch_add(1, Ordering::Relaxed);

                if slot.tx.send(result).is_err() {
                    warn!(
                        "Receiver for request {} dropped before completion",
                        request_id
                    );
                } else {
                    debug!("Request {} completed, elapsed {:?}", request_id, elapsed);
                }
            }
            None => {
                error!(
                    "Result slot for request {} completed more than once",
                    request_id
                );
                debug_assert!(false, "result slot completed more than once");
            }
        }
    }

    /// 按位置把批次输出拆回各请求
    pub async fn complete_batch(&self, batch: &Batch, outputs: Vec<InferOutput>) {
        debug_assert_eq!(batch.len(), outputs.len());

        for (request, output) in batch.requests.iter().zip(outputs) {
            self.complete(request.request_id, Ok(output)).await;
        }
    }

    /// 整批失败：每个请求收到同一个错误
    pub async fn fail_batch(&self, batch: &Batch, error: AppError) {
        for request in &batch.requests {
            self.complete(request.request_id, Err(error.clone())).await;
        }
    }

    /// 放弃结果槽而不完成（入队失败的回滚路径）
    pub async fn discard(&self, request_id: Uuid) -> bool {
        self.pending.write().await.remove(&request_id).is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl Default for ResponseDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
