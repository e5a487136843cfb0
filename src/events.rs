//! Observability sink.
//!
//! Components report state changes as typed `ExecutionEvent`s to an
//! `ExecutionObserver`. The core never decides how events are transported;
//! the binary wires a `TracingObserver`, tests usually a `ChannelObserver`
//! or `CollectingObserver`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::breaker::state::BreakerStatus;
use crate::engine::coordinator::{Resolution, Stage};
use crate::types::{AttemptOutcome, RetryAttempt};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    BreakerTransition {
        resource_key: String,
        from: BreakerStatus,
        to: BreakerStatus,
        trip_level: u32,
        open_until: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    CascadeTripped {
        open_keys: Vec<String>,
        at: DateTime<Utc>,
    },
    RetryAttempted(RetryAttempt),
    StageCompleted {
        fingerprint: String,
        stage: Stage,
        elapsed_ms: u64,
    },
    Terminal {
        fingerprint: String,
        resolution: Resolution,
        transaction_id: Option<Uuid>,
        attempts: usize,
        error: Option<String>,
    },
}

/// Receiver of execution events. Must not block.
pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_event(&self, _event: &ExecutionEvent) {}
}

/// Turns events into structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::BreakerTransition {
                resource_key,
                from,
                to,
                trip_level,
                open_until,
                ..
            } => match to {
                BreakerStatus::Open => warn!(
                    resource_key = %resource_key,
                    from = %from,
                    trip_level,
                    open_until = ?open_until,
                    "Circuit breaker opened"
                ),
                _ => info!(
                    resource_key = %resource_key,
                    from = %from,
                    to = %to,
                    "Circuit breaker transition"
                ),
            },
            ExecutionEvent::CascadeTripped { open_keys, .. } => error!(
                open = open_keys.len(),
                keys = ?open_keys,
                "Cascade detected: system protection tripped"
            ),
            ExecutionEvent::RetryAttempted(attempt) => match attempt.classified_outcome {
                AttemptOutcome::Accepted => info!(
                    tx_id = %attempt.transaction_id,
                    attempt = attempt.attempt_number,
                    nonce = attempt.nonce,
                    tx_hash = ?attempt.tx_hash,
                    escalation_pct = %attempt.gas_escalation_pct,
                    "Broadcast accepted"
                ),
                AttemptOutcome::Failed(kind) => warn!(
                    tx_id = %attempt.transaction_id,
                    attempt = attempt.attempt_number,
                    nonce = attempt.nonce,
                    kind = %kind,
                    delay_ms = attempt.delay_ms,
                    message = ?attempt.message,
                    "Broadcast attempt failed"
                ),
            },
            ExecutionEvent::StageCompleted {
                fingerprint,
                stage,
                elapsed_ms,
            } => debug!(
                fingerprint = %fingerprint,
                stage = ?stage,
                elapsed_ms,
                "Stage complete"
            ),
            ExecutionEvent::Terminal {
                fingerprint,
                resolution,
                transaction_id,
                attempts,
                error,
            } => info!(
                fingerprint = %fingerprint,
                resolution = ?resolution,
                tx_id = ?transaction_id,
                attempts,
                error = ?error,
                "Execution finished"
            ),
        }
    }
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::Sender<ExecutionEvent>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl ExecutionObserver for ChannelObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            debug!(error = %e, "Observer channel full or closed, event dropped");
        }
    }
}

/// Broadcasts every event to each inner observer.
#[derive(Clone, Default)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl FanoutObserver {
    pub fn new(observers: Vec<Arc<dyn ExecutionObserver>>) -> Self {
        Self { observers }
    }

    pub fn with(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl ExecutionObserver for FanoutObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl CollectingObserver {
    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().clone()
    }

    pub fn retry_attempts(&self) -> Vec<RetryAttempt> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::RetryAttempted(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&ExecutionEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl ExecutionObserver for CollectingObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        self.events.lock().push(event.clone());
    }
}
