// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Utc};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::model::{ModelKind, ModelMetadata};
use crate::device::budget::DeviceKind;
use crate::engine::ForwardPass;

pub struct ModelHandle {
    metadata: ModelMetadata,
    device: DeviceKind,
    // 加载时的设备代数快照；故障上报携带它来区分新旧句柄
    generation: u64,
    model: Arc<dyn ForwardPass>,
    active_refs: AtomicUsize,
    loaded_at: DateTime<Utc>,
}

impl ModelHandle {
    pub fn new(
        metadata: ModelMetadata,
        device: DeviceKind,
        generation: u64,
        model: Arc<dyn ForwardPass>,
    ) -> Self {
        Self {
            metadata,
            device,
            generation,
            model,
            active_refs: AtomicUsize::new(0),
            loaded_at: Utc::now(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.metadata.id
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn kind(&self) -> ModelKind {
        self.metadata.kind
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn footprint_bytes(&self) -> u64 {
        self.metadata.footprint_bytes
    }

    pub fn model(&self) -> &dyn ForwardPass {
        self.model.as_ref()
    }

    pub fn active_refs(&self) -> usize {
        self.active_refs.load(Ordering::Acquire)
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub(crate) fn retain(&self) {
        self.active_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let previous = self.active_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "model handle refcount underflow");
    }
}

/// 活跃引用租约：持有期间模型不会被驱逐
pub struct ModelLease {
    handle: Arc<ModelHandle>,
}

impl ModelLease {
    /// 调用方必须在注册表临界区内创建租约
    pub(crate) fn new(handle: Arc<ModelHandle>) -> Self {
        handle.retain();
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }
}

impl Deref for ModelLease {
    type Target = ModelHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.handle.release();
    }
}
