// Copyright (c) 2025 Kirky.X
//
// Licensed under MIT License
// See LICENSE file in the project root for full license information

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Batch, GroupKey, QueuedRequest};
use crate::error::AppError;

/// 待批请求队列
///
/// 按 (model_id, 形状) 分组；容量检查通过原子计数完成，满则立即背压拒绝。
pub struct PendingQueue {
    groups: Mutex<HashMap<GroupKey, VecDeque<QueuedRequest>>>,
    max_pending: usize,
    current_size: AtomicUsize,
    notify: Notify,
}

impl PendingQueue {
    pub fn new(max_pending: usize) -> Self {
        debug!("Creating PendingQueue with max_pending={}", max_pending);

        Self {
            groups: Mutex::new(HashMap::new()),
            max_pending,
            current_size: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// 入队
    pub async fn enqueue(&self, request: QueuedRequest) -> Result<(), AppError> {
        // 原子占位，确保容量检查与入队之间无竞态
        loop {
            let current_size = self.current_size.load(Ordering::Acquire);

            if current_size >= self.max_pending {
                return Err(AppError::Overloaded(format!(
                    "pending queue at capacity ({})",
                    self.max_pending
                )));
            }

            match self.current_size.compare_exchange_weak(
                current_size,
                current_size + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(_) => continue,
            }
        }

        let key = request.group_key();
        let mut groups = self.groups.lock().await;
        groups.entry(key).or_default().push_back(request);
        drop(groups);

        self.notify.notify_one();

        debug!(
            "Request enqueued, pending={}",
            self.current_size.load(Ordering::Relaxed)
        );

        Ok(())
    }

    /// 取消尚未进入批次的请求
    pub async fn remove(&self, request_id: Uuid) -> Option<QueuedRequest> {
        let mut groups = self.groups.lock().await;

        let mut found: Option<(GroupKey, usize)> = None;
        for (key, queue) in groups.iter() {
            if let Some(position) = queue.iter().position(|r| r.request_id == request_id) {
                found = Some((key.clone(), position));
                break;
            }
        }

        let (key, position) = found?;
        let queue = groups.get_mut(&key)?;
        let request = queue.remove(position)?;
        if queue.is_empty() {
            groups.remove(&key);
        }
        self.current_size.fetch_sub(1, Ordering::Relaxed);

        Some(request)
    }

    /// 收集到期批次
    ///
    /// 返回 (过期请求, 批次列表)。过期请求绝不进入批次；
    /// 批次按最老成员到达时间非降序排列，组内保持到达顺序。
    pub async fn collect_due(
        &self,
        max_batch_size: usize,
        max_wait: Duration,
        now: Instant,
    ) -> (Vec<QueuedRequest>, Vec<Batch>) {
        let mut groups = self.groups.lock().await;

        let mut expired = Vec::new();
        let mut batches: Vec<Batch> = Vec::new();

        for (key, queue) in groups.iter_mut() {
            // 先剔除已过期的请求
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(request) = queue.pop_front() {
                if request.is_expired(now) {
                    expired.push(request);
                } else {
                    kept.push_back(request);
                }
            }
            *queue = kept;

            // time-or-size 触发：满批立即释放，否则等最老请求到时
            loop {
                let Some(oldest) = queue.front() else { break };
                let full = queue.len() >= max_batch_size;
                let timed_out = now.duration_since(oldest.submitted_at) >= max_wait;
                if !full && !timed_out {
                    break;
                }

                let take = queue.len().min(max_batch_size);
                let requests: Vec<QueuedRequest> = queue.drain(..take).collect();

                batches.push(Batch {
                    model_id: key.model_id.clone(),
                    shape: key.shape.clone(),
                    requests,
                });
            }
        }

        groups.retain(|_, queue| !queue.is_empty());
        drop(groups);

        let released: usize = expired.len() + batches.iter().map(|b| b.len()).sum::<usize>();
        if released > 0 {
            self.current_size.fetch_sub(released, Ordering::Relaxed);
        }

        batches.sort_by_key(|batch| batch.oldest_arrival());

        if !batches.is_empty() {
            debug!(
                "Collected {} batch(es), {} expired, pending={}",
                batches.len(),
                expired.len(),
                self.current_size.load(Ordering::Relaxed)
            );
        }

        (expired, batches)
    }

    /// 关停时取出全部待处理请求
    pub async fn drain_all(&self) -> Vec<QueuedRequest> {
        let mut groups = self.groups.lock().await;
        let mut drained = Vec::new();

        for (_, mut queue) in groups.drain() {
            drained.extend(queue.drain(..));
        }

        if !drained.is_empty() {
            warn!("Drained {} pending requests", drained.len());
        }
        self.current_size.store(0, Ordering::Relaxed);

        drained
    }

    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    pub fn size(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }
}
