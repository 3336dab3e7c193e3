//! Event emission toward the consumer.
//!
//! Sends block when the channel is full, so a slow consumer slows the
//! pipeline down instead of losing events. A closed channel means the
//! consumer disconnected and surfaces as `AppError::Cancelled`.

use crate::protocol::{PipelineEvent, FINAL_PHASE, GENERATION_PHASE};
use crate::types::ResponsePackage;
use serde::Serialize;
use sift_core::{AppError, AppResult};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Emits protocol events for one request.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }

    /// Emitter plus the receiving end, with room for `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn emit(&self, event: PipelineEvent) -> AppResult<()> {
        tracing::debug!(kind = event.kind(), "Pipeline event");
        self.tx.send(event).await.map_err(|_| AppError::Cancelled)
    }

    pub async fn progress(&self, phase: u8, message: impl Into<String>, progress: u8) -> AppResult<()> {
        self.emit(PipelineEvent::Progress {
            phase,
            message: message.into(),
            progress,
        })
        .await
    }

    /// Emit a phase's output. Serialization failures degrade to `null` data.
    pub async fn phase_result<T: Serialize>(&self, phase: u8, data: &T, progress: u8) -> AppResult<()> {
        let data = serde_json::to_value(data).unwrap_or_else(|e| {
            tracing::warn!(phase, "phase result not serializable: {}", e);
            serde_json::Value::Null
        });
        self.emit(PipelineEvent::PhaseResult {
            phase,
            data,
            progress,
        })
        .await
    }

    pub async fn token(&self, token: impl Into<String>) -> AppResult<()> {
        self.emit(PipelineEvent::Token {
            token: token.into(),
            phase: GENERATION_PHASE,
        })
        .await
    }

    pub async fn complete(&self, package: ResponsePackage) -> AppResult<()> {
        self.emit(PipelineEvent::Complete {
            phase: FINAL_PHASE,
            data: package,
            progress: 100,
        })
        .await
    }

    pub async fn error(
        &self,
        message: impl Into<String>,
        phase: Option<u8>,
        phase_timings: BTreeMap<u8, f64>,
    ) -> AppResult<()> {
        self.emit(PipelineEvent::Error {
            message: message.into(),
            phase,
            partial: true,
            phase_timings,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (emitter, mut rx) = EventEmitter::channel(8);
        emitter.progress(1, "Analyzing query", 5).await.unwrap();
        emitter.token("Hi").await.unwrap();
        emitter
            .complete(ResponsePackage::degraded("Hi", "w"))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().kind(), "progress");
        match rx.recv().await.unwrap() {
            PipelineEvent::Token { token, phase } => {
                assert_eq!(token, "Hi");
                assert_eq!(phase, GENERATION_PHASE);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.recv().await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_closed_consumer_is_cancellation() {
        let (emitter, rx) = EventEmitter::channel(1);
        drop(rx);
        assert!(emitter.is_closed());
        let result = emitter.progress(1, "x", 5).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_phase_result_serializes_data() {
        let (emitter, mut rx) = EventEmitter::channel(1);
        emitter
            .phase_result(2, &serde_json::json!({"count": 3}), 40)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            PipelineEvent::PhaseResult { phase, data, progress } => {
                assert_eq!(phase, 2);
                assert_eq!(data["count"], 3);
                assert_eq!(progress, 40);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
