//! Event fan-out: recorded events are pushed onto a bounded queue and a
//! worker delivers them to the configured notifiers. Publishing never
//! blocks the caller, a full queue drops the event with a warning.

pub mod signature;
pub mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{EventKind, NewEvent, RecordOutcome, UtmParams};

pub use webhook::WebhookNotifier;

/// The payload delivered to notifiers for every recorded event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutEvent {
    pub kind: String,
    pub alias: Option<String>,
    pub link_id: Option<i64>,
    pub event_id: i64,
    pub device_key: String,
    pub session_id: String,
    pub new_session: bool,
    pub occurred_at: i64,
    pub ip: Option<String>,
    pub country_code: Option<String>,
    pub device_type: Option<String>,
    pub referrer_domain: Option<String>,
    pub utm: UtmParams,
}

impl FanoutEvent {
    pub fn new(
        kind: EventKind,
        alias: Option<String>,
        link_id: Option<i64>,
        outcome: &RecordOutcome,
        event: &NewEvent,
    ) -> Self {
        FanoutEvent {
            kind: kind.as_str().to_string(),
            alias,
            link_id,
            event_id: outcome.event_id,
            device_key: outcome.device_key.clone(),
            session_id: outcome.session_id.clone(),
            new_session: outcome.new_session,
            occurred_at: event.occurred_at,
            ip: event.ip.clone(),
            country_code: event.geo.country_code.clone(),
            device_type: event.device_type.clone(),
            referrer_domain: event.referrer_domain.clone(),
            utm: event.utm.clone(),
        }
    }
}

/// A fan-out consumer. Deliveries get one attempt each, a failure is the
/// notifier's problem and never stalls the queue.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &FanoutEvent) -> Result<()>;
    fn name(&self) -> &str;
}

/// Writes every event to the log, the always-on in-process consumer.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &FanoutEvent) -> Result<()> {
        info!(
            kind = %event.kind,
            alias = event.alias.as_deref().unwrap_or("-"),
            session_id = %event.session_id,
            new_session = event.new_session,
            "event recorded"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Cheap cloneable handle for publishing onto the fan-out queue.
#[derive(Clone)]
pub struct FanoutHandle {
    tx: Option<mpsc::Sender<FanoutEvent>>,
}

impl FanoutHandle {
    /// A handle that discards everything, used when fan-out is not
    /// configured.
    pub fn disabled() -> Self {
        FanoutHandle { tx: None }
    }

    /// Enqueue an event without blocking. Dropped with a warning when the
    /// queue is full.
    pub fn publish(&self, event: FanoutEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("fanout queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("fanout worker stopped, dropping event");
            }
        }
    }
}

/// Start the fan-out worker. Events already queued at shutdown are still
/// delivered before the worker exits.
pub fn spawn_fanout(
    notifiers: Vec<Arc<dyn Notifier>>,
    queue_capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> (FanoutHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<FanoutEvent>(queue_capacity.max(1));

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => deliver_all(&notifiers, &event).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Drain what is already queued, then stop.
                        while let Ok(event) = rx.try_recv() {
                            deliver_all(&notifiers, &event).await;
                        }
                        info!("fanout worker shutting down");
                        break;
                    }
                }
            }
        }
    });

    (FanoutHandle { tx: Some(tx) }, handle)
}

async fn deliver_all(notifiers: &[Arc<dyn Notifier>], event: &FanoutEvent) {
    for notifier in notifiers {
        if let Err(e) = notifier.notify(event).await {
            warn!(notifier = notifier.name(), "event delivery failed: {}", e);
        }
    }
}
