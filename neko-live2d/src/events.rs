//! Typed Live2D events and the in-process emitter that delivers them
//!
//! Adapters report platform events (tap, motion finished, runtime errors)
//! through an [`EventSink`]; the service republishes them, together with its
//! own lifecycle events, to callback handlers and broadcast subscribers.

use neko_core::{ErrorInfo, Live2DState, ModelRef, MotionRef};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Event names consumers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    StateChanged,
    ModelLoaded,
    ModelUnloaded,
    Tap,
    MotionFinished,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateChanged => "stateChanged",
            EventKind::ModelLoaded => "modelLoaded",
            EventKind::ModelUnloaded => "modelUnloaded",
            EventKind::Tap => "tap",
            EventKind::MotionFinished => "motionFinished",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Live2DEvent {
    StateChanged {
        prev: Live2DState,
        next: Live2DState,
    },
    ModelLoaded {
        model: ModelRef,
    },
    ModelUnloaded {
        prev_model: Option<ModelRef>,
    },
    /// Pointer tap in adapter coordinates
    Tap {
        x: f64,
        y: f64,
    },
    MotionFinished {
        motion: Option<MotionRef>,
    },
    Error {
        error: ErrorInfo,
    },
}

impl Live2DEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Live2DEvent::StateChanged { .. } => EventKind::StateChanged,
            Live2DEvent::ModelLoaded { .. } => EventKind::ModelLoaded,
            Live2DEvent::ModelUnloaded { .. } => EventKind::ModelUnloaded,
            Live2DEvent::Tap { .. } => EventKind::Tap,
            Live2DEvent::MotionFinished { .. } => EventKind::MotionFinished,
            Live2DEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Callback an adapter uses to report platform events to the service
pub type EventSink = Arc<dyn Fn(Live2DEvent) + Send + Sync>;

/// Subscriber callback. An `Err` (or a panic) is reported, never propagated.
pub type EventHandler = Arc<dyn Fn(&Live2DEvent) -> anyhow::Result<()> + Send + Sync>;

/// Receives handler failures; defaults to a warning log.
pub type HandlerErrorHook = Arc<dyn Fn(EventKind, &anyhow::Error) + Send + Sync>;

type HandlerTable = HashMap<EventKind, Vec<(Uuid, EventHandler)>>;

/// Handle returned by [`EventEmitter::on`]
pub struct Subscription {
    id: Uuid,
    kind: EventKind,
    handlers: Weak<RwLock<HandlerTable>>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove the handler. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        let Some(handlers) = self.handlers.upgrade() else {
            return;
        };
        let mut table = handlers.write();
        if let Some(list) = table.get_mut(&self.kind) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                table.remove(&self.kind);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// In-process event emitter with per-handler fault isolation
pub struct EventEmitter {
    handlers: Arc<RwLock<HandlerTable>>,
    on_error: Option<HandlerErrorHook>,
    broadcast: broadcast::Sender<Live2DEvent>,
}

impl EventEmitter {
    pub fn new(channel_capacity: usize, on_error: Option<HandlerErrorHook>) -> Self {
        let (broadcast, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            on_error,
            broadcast,
        }
    }

    /// Register `handler` for `kind`. Handlers run in registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Live2DEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            kind,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Receiver of every emitted event.
    pub fn subscribe(&self) -> broadcast::Receiver<Live2DEvent> {
        self.broadcast.subscribe()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, |list| list.len())
    }

    /// Deliver `event` to every handler registered for its kind, then to
    /// broadcast subscribers.
    pub fn emit(&self, event: Live2DEvent) {
        let kind = event.kind();

        // Snapshot so handlers may (un)subscribe without deadlocking
        let handlers: Vec<EventHandler> = {
            let table = self.handlers.read();
            table
                .get(&kind)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(payload) => Some(anyhow::anyhow!("event handler panicked: {}", panic_message(&*payload))),
            };
            if let Some(err) = failure {
                self.report_handler_error(kind, &err);
            }
        }

        // No receivers is fine
        let _ = self.broadcast.send(event);
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    fn report_handler_error(&self, kind: EventKind, err: &anyhow::Error) {
        match &self.on_error {
            Some(hook) => {
                if panic::catch_unwind(AssertUnwindSafe(|| hook(kind, err))).is_err() {
                    warn!("Event error hook panicked while reporting {} handler failure", kind);
                }
            }
            None => warn!("Event handler failed (event=\"{}\"): {:#}", kind, err),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
