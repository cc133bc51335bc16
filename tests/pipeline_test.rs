// Copyright (c) 2025 Kirky.X
//
// Licensed under MIT License
// See LICENSE file in the project root for full license information

//! 集成测试
//!
//! 覆盖流水线端到端行为：批处理触发、single-flight 加载、
//! LRU 驱逐、整批失败与背压。

use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use inferboost::{
    AppError, DeviceKind, DeviceManager, DevicePreference, ForwardPass, InferRequest,
    InferencePipeline, LocalModelLoader, ModelCatalog, ModelKind, ModelLoader, ModelMetadata,
    ModelRegistry, PipelineConfig,
};

const GB: u64 = 1024 * 1024 * 1024;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

fn write_model_dir(root: &Path, model_id: &str) {
    let dir = root.join(model_id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("model.safetensors"), b"weights").unwrap();
    fs::write(dir.join("config.json"), b"{\"hidden_size\": 8}").unwrap();
}

fn payload(shape: &[usize], value: f32) -> ArrayD<f32> {
    ArrayD::from_elem(IxDyn(shape), value)
}

fn local_pipeline(
    root: &Path,
    models: Vec<ModelMetadata>,
    devices: DeviceManager,
    config: PipelineConfig,
) -> InferencePipeline {
    let loader =
        Arc::new(LocalModelLoader::new(root.to_path_buf())) as Arc<dyn ModelLoader>;
    let registry = Arc::new(ModelRegistry::new(ModelCatalog::new(models), loader, devices));
    InferencePipeline::start(config, registry)
}

#[tokio::test]
async fn test_e2e_single_request() {
    let dir = tempdir().unwrap();
    write_model_dir(dir.path(), "sentiment-ko");

    let pipeline = local_pipeline(
        dir.path(),
        vec![ModelMetadata::new("sentiment-ko", ModelKind::Text, 1 * GB)],
        DeviceManager::new(16 * GB, &[]),
        PipelineConfig {
            max_wait_time_ms: 5,
            ..Default::default()
        },
    );

    let output = pipeline
        .admit(InferRequest::new("sentiment-ko", payload(&[4, 8], 3.0)))
        .await
        .unwrap();

    assert_eq!(output.output.shape(), &[8]);
    assert!(output.output.iter().all(|v| *v == 3.0));

    pipeline.shutdown().await;
    println!("[PASS] end-to-end single request");
}

#[tokio::test]
async fn test_every_request_completes_exactly_once() {
    init_tracing();
    let dir = tempdir().unwrap();
    write_model_dir(dir.path(), "sentiment-ko");
    write_model_dir(dir.path(), "clip-vit");

    let pipeline = Arc::new(local_pipeline(
        dir.path(),
        vec![
            ModelMetadata::new("sentiment-ko", ModelKind::Text, 1 * GB),
            ModelMetadata::new("clip-vit", ModelKind::Vision, 1 * GB),
        ],
        DeviceManager::new(16 * GB, &[]),
        PipelineConfig {
            max_batch_size: 4,
            max_wait_time_ms: 5,
            ..Default::default()
        },
    ));

    let mut admissions = Vec::new();
    for i in 0..40 {
        let pipeline = Arc::clone(&pipeline);
        admissions.push(async move {
            if i % 2 == 0 {
                pipeline
                    .admit(InferRequest::new("sentiment-ko", payload(&[4, 8], 1.0)))
                    .await
            } else {
                pipeline
                    .admit(InferRequest::new("clip-vit", payload(&[3, 2, 2], 1.0)))
                    .await
            }
        });
    }

    let results = futures::future::join_all(admissions).await;
    let completions = results.len();
    assert!(results.iter().all(|result| result.is_ok()));
    assert_eq!(completions, 40);

    // 所有结果槽都已结清
    let stats = pipeline.stats().await;
    assert_eq!(stats.inflight_slots, 0);
    assert_eq!(stats.pending_requests, 0);

    pipeline.shutdown().await;
    println!("[PASS] {} requests completed exactly once", completions);
}

#[tokio::test]
async fn test_concurrent_admissions_single_flight_load() {
    let dir = tempdir().unwrap();
    write_model_dir(dir.path(), "sentiment-ko");

    let pipeline = Arc::new(local_pipeline(
        dir.path(),
        vec![ModelMetadata::new("sentiment-ko", ModelKind::Text, 1 * GB)],
        DeviceManager::new(16 * GB, &[]),
        PipelineConfig {
            max_batch_size: 4,
            max_wait_time_ms: 5,
            ..Default::default()
        },
    ));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline
                .admit(InferRequest::new("sentiment-ko", payload(&[4, 8], 1.0)))
                .await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(pipeline.registry().loads_started(), 1);

    pipeline.shutdown().await;
    println!("[PASS] single-flight load under concurrency");
}

#[tokio::test]
async fn test_latency_bound_batch_release() {
    let dir = tempdir().unwrap();
    write_model_dir(dir.path(), "sentiment-ko");

    // 批大小上限 8，等待上限 20ms：3 个请求在 t=0 到达，无后续
    let pipeline = local_pipeline(
        dir.path(),
        vec![ModelMetadata::new("sentiment-ko", ModelKind::Text, 1 * GB)],
        DeviceManager::new(16 * GB, &[]),
        PipelineConfig {
            max_batch_size: 8,
            max_wait_time_ms: 20,
            ..Default::default()
        },
    );

    let started = Instant::now();
    let mut tickets = Vec::new();
    for _ in 0..3 {
        tickets.push(
            pipeline
                .submit(InferRequest::new("sentiment-ko", payload(&[4, 8], 1.0)))
                .await
                .unwrap(),
        );
    }

    for ticket in tickets {
        assert!(ticket.await_output().await.is_ok());
    }
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(20), "batch released after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500));

    let stats = pipeline.stats().await;
    assert_eq!(stats.batcher.batches_released, 1);

    pipeline.shutdown().await;
    println!("[PASS] 3-request batch released at latency bound ({:?})", elapsed);
}

#[tokio::test]
async fn test_batches_never_exceed_max_size() {
    let dir = tempdir().unwrap();
    write_model_dir(dir.path(), "sentiment-ko");

    let pipeline = Arc::new(local_pipeline(
        dir.path(),
        vec![ModelMetadata::new("sentiment-ko", ModelKind::Text, 1 * GB)],
        DeviceManager::new(16 * GB, &[]),
        PipelineConfig {
            max_batch_size: 4,
            max_wait_time_ms: 10,
            ..Default::default()
        },
    ));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline
                .admit(InferRequest::new("sentiment-ko", payload(&[4, 8], 1.0)))
                .await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let stats = pipeline.stats().await;
    // 10 个请求、批大小 4：至少 3 个批次
    assert!(stats.batcher.batches_released >= 3);

    pipeline.shutdown().await;
    println!(
        "[PASS] {} batches for 10 requests under size limit 4",
        stats.batcher.batches_released
    );
}

#[tokio::test]
async fn test_past_deadline_rejected_at_admission() {
    let dir = tempdir().unwrap();
    write_model_dir(dir.path(), "sentiment-ko");

    let pipeline = local_pipeline(
        dir.path(),
        vec![ModelMetadata::new("sentiment-ko", ModelKind::Text, 1 * GB)],
        DeviceManager::new(16 * GB, &[]),
        PipelineConfig::default(),
    );

    let result = pipeline
        .admit(
            InferRequest::new("sentiment-ko", payload(&[4, 8], 1.0))
                .with_deadline(Instant::now() - Duration::from_secs(1)),
        )
        .await;

    assert!(matches!(result, Err(AppError::DeadlineExceeded(_))));

    let stats = pipeline.stats().await;
    assert_eq!(stats.batcher.batches_released, 0);
    assert_eq!(stats.registry.loads_started, 0);

    pipeline.shutdown().await;
    println!("[PASS] past deadline rejected before batching");
}

#[tokio::test]
async fn test_gpu_eviction_scenario() {
    // m1 6GB 常驻 8GB 设备；m2 4GB 需要驱逐空闲的 m1
    let dir = tempdir().unwrap();
    write_model_dir(dir.path(), "m1");
    write_model_dir(dir.path(), "m2");

    let pipeline = local_pipeline(
        dir.path(),
        vec![
            ModelMetadata::new("m1", ModelKind::Text, 6 * GB)
                .with_preference(DevicePreference::Gpu),
            ModelMetadata::new("m2", ModelKind::Text, 4 * GB)
                .with_preference(DevicePreference::Gpu),
        ],
        DeviceManager::new(0, &[8 * GB]),
        PipelineConfig {
            max_wait_time_ms: 5,
            ..Default::default()
        },
    );

    pipeline
        .admit(InferRequest::new("m1", payload(&[4, 8], 1.0)))
        .await
        .unwrap();

    let budget = pipeline
        .registry()
        .devices()
        .budget(DeviceKind::Cuda(0))
        .await
        .unwrap();
    assert_eq!(budget.reserved_bytes, 6 * GB);

    pipeline
        .admit(InferRequest::new("m2", payload(&[4, 8], 1.0)))
        .await
        .unwrap();

    assert!(!pipeline.registry().is_resident("m1").await);
    assert!(pipeline.registry().is_resident("m2").await);

    let budget = pipeline
        .registry()
        .devices()
        .budget(DeviceKind::Cuda(0))
        .await
        .unwrap();
    assert_eq!(budget.reserved_bytes, 4 * GB);

    pipeline.shutdown().await;
    println!("[PASS] idle 6GB model evicted for 4GB load");
}

struct FaultyModel;

impl ForwardPass for FaultyModel {
    fn forward(&self, _inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>, AppError> {
        Err(AppError::InferenceError("simulated device fault".to_string()))
    }
}

struct FaultyLoader;

#[async_trait]
impl ModelLoader for FaultyLoader {
    async fn load(
        &self,
        _metadata: &ModelMetadata,
        _device: DeviceKind,
    ) -> Result<Arc<dyn ForwardPass>, AppError> {
        Ok(Arc::new(FaultyModel))
    }

    async fn is_cached(&self, _metadata: &ModelMetadata) -> bool {
        true
    }
}

#[tokio::test]
async fn test_faulted_batch_fails_atomically() {
    let registry = Arc::new(ModelRegistry::new(
        ModelCatalog::new(vec![ModelMetadata::new("m", ModelKind::Text, 1 * GB)]),
        Arc::new(FaultyLoader) as Arc<dyn ModelLoader>,
        DeviceManager::new(16 * GB, &[]),
    ));
    let pipeline = Arc::new(InferencePipeline::start(
        PipelineConfig {
            max_batch_size: 5,
            max_wait_time_ms: 10,
            ..Default::default()
        },
        registry,
    ));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline
                .admit(InferRequest::new("m", payload(&[4, 8], 1.0)))
                .await
        }));
    }

    for handle in handles {
        let error = handle.await.unwrap().unwrap_err();
        assert!(matches!(error, AppError::InferenceError(_)));
    }

    // 故障后句柄失效，后续请求会触发重新加载
    assert!(!pipeline.registry().is_resident("m").await);

    pipeline.shutdown().await;
    println!("[PASS] 5-request batch failed atomically");
}

#[tokio::test]
async fn test_missing_weights_fail_only_their_requests() {
    let dir = tempdir().unwrap();
    write_model_dir(dir.path(), "present");
    // "absent" 无权重文件

    let pipeline = Arc::new(local_pipeline(
        dir.path(),
        vec![
            ModelMetadata::new("present", ModelKind::Text, 1 * GB),
            ModelMetadata::new("absent", ModelKind::Text, 1 * GB),
        ],
        DeviceManager::new(16 * GB, &[]),
        PipelineConfig {
            max_wait_time_ms: 5,
            ..Default::default()
        },
    ));

    let good = Arc::clone(&pipeline);
    let good = tokio::spawn(async move {
        good.admit(InferRequest::new("present", payload(&[4, 8], 1.0)))
            .await
    });
    let bad = Arc::clone(&pipeline);
    let bad = tokio::spawn(async move {
        bad.admit(InferRequest::new("absent", payload(&[4, 8], 1.0)))
            .await
    });

    assert!(good.await.unwrap().is_ok());
    let error = bad.await.unwrap().unwrap_err();
    assert!(matches!(error, AppError::ModelLoadError(_)));

    pipeline.shutdown().await;
    println!("[PASS] load failure isolated to its own requests");
}
