// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::config::model::ModelCatalog;
use crate::device::budget::{DeviceKind, Reservation};
use crate::device::manager::DeviceManager;
use crate::error::AppError;
use crate::model::handle::{ModelHandle, ModelLease};
use crate::model::loader::ModelLoader;

// None = 加载进行中；Some(Ok) = 已发布到 resident，重新取锁读取；Some(Err) = 加载失败
type LoadSignal = Option<Result<(), AppError>>;

struct RegistryInner {
    resident: HashMap<String, Arc<ModelHandle>>,
    /// LRU 索引，队首为最近使用；每次命中都会刷新
    access_order: VecDeque<String>,
    loading: HashMap<String, watch::Receiver<LoadSignal>>,
}

enum LoadRole {
    Wait(watch::Receiver<LoadSignal>),
    Lead(watch::Sender<LoadSignal>),
}

pub struct ModelRegistry {
    inner: Mutex<RegistryInner>,
    catalog: ModelCatalog,
    loader: Arc<dyn ModelLoader>,
    devices: DeviceManager,
    loads_started: AtomicU64,
    loads_failed: AtomicU64,
    evictions: AtomicU64,
}

impl ModelRegistry {
    pub fn new(
        catalog: ModelCatalog,
        loader: Arc<dyn ModelLoader>,
        devices: DeviceManager,
    ) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                resident: HashMap::new(),
                access_order: VecDeque::new(),
                loading: HashMap::new(),
            }),
            catalog,
            loader,
            devices,
            loads_started: AtomicU64::new(0),
            loads_failed: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    /// 命中直接返回租约；未命中时同一模型 id 只有一个加载在途，
    /// 其余调用者等待并共享同一结果。
    pub async fn get_or_load(&self, model_id: &str) -> Result<ModelLease, AppError> {
        loop {
            let role = {
                let mut inner = self.inner.lock().await;

                if let Some(handle) = inner.resident.get(model_id) {
                    let lease = ModelLease::new(Arc::clone(handle));
                    Self::touch(&mut inner.access_order, model_id);
                    debug!("Model {} cache hit on {}", model_id, lease.device());
                    return Ok(lease);
                }

                match inner.loading.get(model_id) {
                    Some(rx) => LoadRole::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inner.loading.insert(model_id.to_string(), rx);
                        LoadRole::Lead(tx)
                    }
                }
            };

            match role {
                LoadRole::Wait(mut rx) => {
                    let signal = rx
                        .wait_for(|value| value.is_some())
                        .await
                        .map_err(|_| {
                            AppError::Internal(format!(
                                "load broadcaster for model {} dropped",
                                model_id
                            ))
                        })?
                        .clone();

                    match signal {
                        Some(Ok(())) => continue,
                        Some(Err(e)) => return Err(e),
                        None => unreachable!("wait_for yielded empty load signal"),
                    }
                }
                LoadRole::Lead(tx) => {
                    let result = self.perform_load(model_id).await;

                    let lease = {
                        let mut inner = self.inner.lock().await;
                        inner.loading.remove(model_id);

                        match &result {
                            Ok(handle) => {
                                inner
                                    .resident
                                    .insert(model_id.to_string(), Arc::clone(handle));
                                Self::touch(&mut inner.access_order, model_id);
                                Some(ModelLease::new(Arc::clone(handle)))
                            }
                            Err(_) => None,
                        }
                    };

                    let signal = result.as_ref().map(|_| ()).map_err(AppError::clone);
                    let _ = tx.send(Some(signal));

                    return match result {
                        Ok(_) => {
                            Ok(lease.expect("lease created alongside resident entry"))
                        }
                        Err(e) => Err(e),
                    };
                }
            }
        }
    }

    async fn perform_load(&self, model_id: &str) -> Result<Arc<ModelHandle>, AppError> {
        let metadata = self
            .catalog
            .get(model_id)
            .ok_or_else(|| {
                AppError::ModelLoadError(format!("model {} not in catalog", model_id))
            })?
            .clone();

        self.loads_started.fetch_add(1, Ordering::Relaxed);
        info!(
            "Loading model {} ({} bytes, preference {:?})",
            model_id, metadata.footprint_bytes, metadata.device_preference
        );

        let reservation = match self.reserve_with_eviction(&metadata).await {
            Ok(reservation) => reservation,
            Err(e) => {
                self.loads_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        match self.loader.load(&metadata, reservation.device).await {
            Ok(model) => {
                let generation = self.devices.note_load(reservation.device).await;
                Ok(Arc::new(ModelHandle::new(
                    metadata,
                    reservation.device,
                    generation,
                    model,
                )))
            }
            Err(e) => {
                self.devices
                    .release(reservation.device, reservation.bytes)
                    .await;
                self.loads_failed.fetch_add(1, Ordering::Relaxed);
                warn!("Model {} load failed: {}", model_id, e);
                Err(e)
            }
        }
    }

    // 预留失败时，按偏好顺序在候选设备上驱逐空闲 LRU 模型并重试一次
    async fn reserve_with_eviction(
        &self,
        metadata: &crate::config::model::ModelMetadata,
    ) -> Result<Reservation, AppError> {
        match self
            .devices
            .reserve(metadata.device_preference, metadata.footprint_bytes)
            .await
        {
            Ok(reservation) => Ok(reservation),
            Err(AppError::OutOfMemory(_)) => {
                for device in self.devices.candidates(metadata.device_preference).await {
                    if !self.evict_idle_lru(device, metadata.footprint_bytes).await {
                        continue;
                    }
                    match self
                        .devices
                        .reserve_on(device, metadata.footprint_bytes)
                        .await
                    {
                        Ok(reservation) => return Ok(reservation),
                        Err(_) => continue,
                    }
                }

                Err(AppError::OutOfMemory(format!(
                    "no device can fit model {} ({} bytes) even after eviction",
                    metadata.id, metadata.footprint_bytes
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// 仅当空闲（refcount 为零）的 LRU 候选足以覆盖缺口时才执行驱逐
    async fn evict_idle_lru(&self, device: DeviceKind, bytes_needed: u64) -> bool {
        let Some(budget) = self.devices.budget(device).await else {
            return false;
        };
        if budget.free_bytes() >= bytes_needed {
            return true;
        }
        let shortfall = bytes_needed - budget.free_bytes();

        let victims = {
            let mut inner = self.inner.lock().await;

            let mut planned: u64 = 0;
            let mut victims: Vec<(String, u64)> = Vec::new();
            for id in inner.access_order.iter().rev() {
                if planned >= shortfall {
                    break;
                }
                if let Some(handle) = inner.resident.get(id)
                    && handle.device() == device
                    && handle.active_refs() == 0
                {
                    planned += handle.footprint_bytes();
                    victims.push((id.clone(), handle.footprint_bytes()));
                }
            }

            if planned < shortfall {
                return false;
            }

            for (id, _) in &victims {
                inner.resident.remove(id);
                inner.access_order.retain(|key| key != id);
            }
            victims
        };

        for (id, bytes) in victims {
            self.devices.release(device, bytes).await;
            self.devices.note_evict(device).await;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!("Evicted idle model {} from {} ({} bytes)", id, device, bytes);
        }

        true
    }

    /// 执行期设备故障后的失效处理。代数不匹配说明上报方持有过期句柄，忽略。
    pub async fn invalidate(&self, model_id: &str, generation: u64) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            match inner.resident.get(model_id) {
                Some(handle) if handle.generation() == generation => {
                    let handle = inner.resident.remove(model_id);
                    inner.access_order.retain(|key| key != model_id);
                    handle
                }
                Some(_) => {
                    debug!(
                        "Ignoring stale fault report for model {} (generation {})",
                        model_id, generation
                    );
                    None
                }
                None => None,
            }
        };

        match removed {
            Some(handle) => {
                self.devices
                    .release(handle.device(), handle.footprint_bytes())
                    .await;
                self.devices.note_evict(handle.device()).await;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Invalidated model {} on {} after execution fault",
                    model_id,
                    handle.device()
                );
                true
            }
            None => false,
        }
    }

    pub async fn unload(&self, model_id: &str) -> Result<(), AppError> {
        let removed = {
            let mut inner = self.inner.lock().await;
            match inner.resident.get(model_id) {
                Some(handle) if handle.active_refs() > 0 => {
                    return Err(AppError::InvalidInput(format!(
                        "model {} has {} active executions",
                        model_id,
                        handle.active_refs()
                    )));
                }
                Some(_) => {
                    let handle = inner.resident.remove(model_id);
                    inner.access_order.retain(|key| key != model_id);
                    handle
                }
                None => {
                    return Err(AppError::InvalidInput(format!(
                        "model {} not resident",
                        model_id
                    )));
                }
            }
        };

        if let Some(handle) = removed {
            self.devices
                .release(handle.device(), handle.footprint_bytes())
                .await;
            self.devices.note_evict(handle.device()).await;
            info!("Model {} unloaded", model_id);
        }
        Ok(())
    }

    pub async fn unload_all(&self) {
        let removed = {
            let mut inner = self.inner.lock().await;
            let ids: Vec<String> = inner.resident.keys().cloned().collect();

            let mut removed = Vec::new();
            for id in ids {
                let in_use = inner
                    .resident
                    .get(&id)
                    .is_some_and(|handle| handle.active_refs() > 0);
                if in_use {
                    warn!("Model {} still in use, skipping unload", id);
                    continue;
                }
                if let Some(handle) = inner.resident.remove(&id) {
                    inner.access_order.retain(|key| key != &id);
                    removed.push(handle);
                }
            }
            removed
        };

        for handle in removed {
            self.devices
                .release(handle.device(), handle.footprint_bytes())
                .await;
            self.devices.note_evict(handle.device()).await;
            info!("Model {} unloaded", handle.model_id());
        }
    }

    pub async fn is_resident(&self, model_id: &str) -> bool {
        self.inner.lock().await.resident.contains_key(model_id)
    }

    pub async fn resident_models(&self) -> Vec<String> {
        self.inner.lock().await.resident.keys().cloned().collect()
    }

    pub fn loads_started(&self) -> u64 {
        self.loads_started.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        RegistryStats {
            resident_models: inner.resident.len(),
            resident_bytes: inner
                .resident
                .values()
                .map(|handle| handle.footprint_bytes())
                .sum(),
            loads_started: self.loads_started.load(Ordering::Relaxed),
            loads_failed: self.loads_failed.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn touch(access_order: &mut VecDeque<String>, model_id: &str) {
        if let Some(position) = access_order.iter().position(|key| key == model_id) {
            access_order.remove(position);
        }
        access_order.push_front(model_id.to_string());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub resident_models: usize,
    pub resident_bytes: u64,
    pub loads_started: u64,
    pub loads_failed: u64,
    pub evictions: u64,
}
