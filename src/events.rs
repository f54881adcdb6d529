//! Engine events and sinks
//!
//! The engine only emits; delivery (webhooks, alerting) belongs to whoever
//! consumes a sink.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RetrainRecommended {
        config_id: String,
        batch_candidate_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        webhook_url: Option<String>,
    },
    DriftAlert {
        config_id: String,
        version: u32,
        divergence: f64,
        threshold: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alert_target: Option<String>,
    },
    AutoRollback {
        config_id: String,
        from_version: u32,
        to_version: u32,
        divergence: f64,
    },
    FeedbackSubmitted {
        config_id: String,
        feedback_id: String,
        webhook_url: String,
    },
}

impl EngineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::RetrainRecommended { .. } => "retrain_recommended",
            EngineEvent::DriftAlert { .. } => "drift_alert",
            EngineEvent::AutoRollback { .. } => "auto_rollback",
            EngineEvent::FeedbackSubmitted { .. } => "feedback_submitted",
        }
    }

    pub fn config_id(&self) -> &str {
        match self {
            EngineEvent::RetrainRecommended { config_id, .. }
            | EngineEvent::DriftAlert { config_id, .. }
            | EngineEvent::AutoRollback { config_id, .. }
            | EngineEvent::FeedbackSubmitted { config_id, .. } => config_id,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

/// Logs every event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        match event {
            EngineEvent::DriftAlert { .. } | EngineEvent::AutoRollback { .. } => {
                tracing::warn!(
                    event = event.event_type(),
                    config_id = event.config_id(),
                    %payload,
                    "engine event"
                );
            }
            _ => {
                tracing::info!(
                    event = event.event_type(),
                    config_id = event.config_id(),
                    %payload,
                    "engine event"
                );
            }
        }
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn take(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Forwards events to an async consumer
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &EngineEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::debug!(event = event.event_type(), "event receiver dropped");
        }
    }
}

/// Sends every event to each inner sink in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &EngineEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
