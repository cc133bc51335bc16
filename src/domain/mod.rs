// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use ndarray::ArrayD;
use std::time::Instant;
use uuid::Uuid;

use crate::error::AppError;

pub type InferResult = Result<InferOutput, AppError>;

#[derive(Debug, Clone)]
pub struct InferRequest {
    pub model_id: String,
    pub payload: ArrayD<f32>,
    pub deadline: Option<Instant>,
}

impl InferRequest {
    pub fn new(model_id: impl Into<String>, payload: ArrayD<f32>) -> Self {
        Self {
            model_id: model_id.into(),
            payload,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone)]
pub struct InferOutput {
    pub output: ArrayD<f32>,
    pub processing_time_ms: u64,
}

#[derive(Debug)]
pub struct QueuedRequest {
    pub request_id: Uuid,
    pub model_id: String,
    pub payload: ArrayD<f32>,
    pub submitted_at: Instant,
    pub deadline: Option<Instant>,
}

impl QueuedRequest {
    pub fn from_request(request_id: Uuid, request: InferRequest) -> Self {
        Self {
            request_id,
            model_id: request.model_id,
            payload: request.payload,
            submitted_at: Instant::now(),
            deadline: request.deadline,
        }
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            model_id: self.model_id.clone(),
            shape: self.payload.shape().to_vec(),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// 批次分组键：同一模型且形状完全一致的请求才能融合
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub model_id: String,
    pub shape: Vec<usize>,
}

#[derive(Debug)]
pub struct Batch {
    pub model_id: String,
    pub shape: Vec<usize>,
    pub requests: Vec<QueuedRequest>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// 批次中最早请求的到达时间，决定批次释放顺序
    pub fn oldest_arrival(&self) -> Instant {
        self.requests
            .iter()
            .map(|r| r.submitted_at)
            .min()
            .unwrap_or_else(Instant::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;
    use std::time::Duration;

    fn payload(shape: &[usize]) -> ArrayD<f32> {
        ArrayD::zeros(ndarray::IxDyn(shape))
    }

    #[test]
    fn test_group_key_same_model_same_shape() {
        let a = QueuedRequest::from_request(
            Uuid::new_v4(),
            InferRequest::new("sentiment-ko", payload(&[16, 768])),
        );
        let b = QueuedRequest::from_request(
            Uuid::new_v4(),
            InferRequest::new("sentiment-ko", payload(&[16, 768])),
        );
        assert_eq!(a.group_key(), b.group_key());
    }

    #[test]
    fn test_group_key_shape_mismatch() {
        let a = QueuedRequest::from_request(
            Uuid::new_v4(),
            InferRequest::new("sentiment-ko", payload(&[16, 768])),
        );
        let b = QueuedRequest::from_request(
            Uuid::new_v4(),
            InferRequest::new("sentiment-ko", payload(&[32, 768])),
        );
        assert_ne!(a.group_key(), b.group_key());
    }

    #[test]
    fn test_request_expiry() {
        let now = Instant::now();
        let fresh = QueuedRequest::from_request(
            Uuid::new_v4(),
            InferRequest::new("m", payload(&[4])).with_deadline(now + Duration::from_secs(5)),
        );
        let expired = QueuedRequest::from_request(
            Uuid::new_v4(),
            InferRequest::new("m", payload(&[4])).with_deadline(now - Duration::from_millis(1)),
        );
        let no_deadline =
            QueuedRequest::from_request(Uuid::new_v4(), InferRequest::new("m", payload(&[4])));

        assert!(!fresh.is_expired(now));
        assert!(expired.is_expired(now));
        assert!(!no_deadline.is_expired(now));
    }

    #[test]
    fn test_batch_oldest_arrival() {
        let first = QueuedRequest::from_request(
            Uuid::new_v4(),
            InferRequest::new("m", payload(&[4])),
        );
        std::thread::sleep(Duration::from_millis(2));
        let second = QueuedRequest::from_request(
            Uuid::new_v4(),
            InferRequest::new("m", payload(&[4])),
        );

        let earliest = first.submitted_at;
        let batch = Batch {
            model_id: "m".to_string(),
            shape: vec![4],
            requests: vec![second, first],
        };

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.oldest_arrival(), earliest);
    }
}
