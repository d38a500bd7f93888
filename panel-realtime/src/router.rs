//! Message router - raw frames in, typed events out
//!
//! Parsing normalizes every legacy field synonym in one place
//! ([`parse_frame`]); nothing downstream sees the loose JSON. Dispatch walks
//! a snapshot of the handler list so handlers may register or dispose other
//! handlers (or themselves) while an event is being delivered.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared_types::{
    ConsoleStream, MetricSample, OperationResult, ServerState, FRAME_COMMAND_RESULT,
    FRAME_CONNECTED, FRAME_CONSOLE_OUTPUT, FRAME_ERROR, FRAME_OPERATION_RESULT, FRAME_PONG,
    FRAME_RESOURCE_STATS, FRAME_SERVER_STATE, FRAME_SERVER_STATE_UPDATE,
};

// ============================================================================
// Events
// ============================================================================

/// One parsed inbound event. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Arrival sequence number assigned by the router, strictly increasing
    pub seq: u64,
    /// Topic (server ID)
    pub server_id: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    ConsoleLine {
        stream: ConsoleStream,
        text: String,
    },
    StateChange {
        state: ServerState,
        reason: Option<String>,
    },
    ResourceSample(MetricSample),
    OperationResult(OperationResult),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ConsoleLine { .. } => "console_line",
            EventKind::StateChange { .. } => "state_change",
            EventKind::ResourceSample(_) => "resource_sample",
            EventKind::OperationResult(_) => "operation_result",
        }
    }
}

/// A frame that parsed successfully.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Event { server_id: String, kind: EventKind },
    /// Connection-level frame with no topic (`pong`, `connected`, `error`)
    Control { frame_type: String, message: Option<String> },
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame has no type")]
    MissingType,

    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    #[error("Frame {frame_type} is missing {field}")]
    MissingField {
        frame_type: String,
        field: &'static str,
    },
}

// ============================================================================
// Parsing
// ============================================================================

pub fn parse_frame(raw: &str) -> Result<ParsedFrame, FrameError> {
    let json: Value = serde_json::from_str(raw).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if !json.is_object() {
        return Err(FrameError::Malformed("expected a JSON object".to_string()));
    }
    let frame_type = json
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(FrameError::MissingType)?;

    match frame_type {
        FRAME_PONG | FRAME_CONNECTED | FRAME_ERROR => Ok(ParsedFrame::Control {
            frame_type: frame_type.to_string(),
            message: first_str(&json, &["message", "error"]),
        }),
        FRAME_CONSOLE_OUTPUT => {
            let server_id = server_id(&json, frame_type)?;
            let text = first_str(&json, &["data", "line", "text"]).ok_or_else(|| {
                FrameError::MissingField {
                    frame_type: frame_type.to_string(),
                    field: "data",
                }
            })?;
            let stream = json
                .get("stream")
                .and_then(|v| v.as_str())
                .and_then(ConsoleStream::from_wire)
                .unwrap_or_default();
            Ok(ParsedFrame::Event {
                server_id,
                kind: EventKind::ConsoleLine { stream, text },
            })
        }
        FRAME_SERVER_STATE | FRAME_SERVER_STATE_UPDATE => {
            let server_id = server_id(&json, frame_type)?;
            let state = first_str(&json, &["state", "status"]).ok_or_else(|| {
                FrameError::MissingField {
                    frame_type: frame_type.to_string(),
                    field: "state",
                }
            })?;
            Ok(ParsedFrame::Event {
                server_id,
                kind: EventKind::StateChange {
                    state: ServerState::from_wire(&state),
                    reason: first_str(&json, &["reason"]),
                },
            })
        }
        FRAME_RESOURCE_STATS => {
            let server_id = server_id(&json, frame_type)?;
            let sample = parse_sample(&json).ok_or_else(|| FrameError::MissingField {
                frame_type: frame_type.to_string(),
                field: "stats",
            })?;
            Ok(ParsedFrame::Event {
                server_id,
                kind: EventKind::ResourceSample(sample),
            })
        }
        FRAME_OPERATION_RESULT | FRAME_COMMAND_RESULT => {
            let server_id = server_id(&json, frame_type)?;
            let operation = first_str(&json, &["operation", "action"])
                .unwrap_or_else(|| frame_type.to_string());
            Ok(ParsedFrame::Event {
                server_id,
                kind: EventKind::OperationResult(OperationResult {
                    operation,
                    success: json.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
                    message: first_str(&json, &["message", "error"]),
                }),
            })
        }
        other => Err(FrameError::UnknownType(other.to_string())),
    }
}

fn server_id(json: &Value, frame_type: &str) -> Result<String, FrameError> {
    first_str(json, &["serverId", "server_id"])
        .filter(|id| !id.is_empty())
        .ok_or_else(|| FrameError::MissingField {
            frame_type: frame_type.to_string(),
            field: "serverId",
        })
}

fn first_str(json: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| json.get(*key).and_then(|v| v.as_str()))
        .map(ToString::to_string)
}

fn first_number(json: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| json.get(*key).and_then(|v| v.as_f64()))
}

/// Canonical names win over synonyms: `cpuPercent` before `cpu`,
/// `memoryUsageMb` before `memoryMb` before `memory`, and so on.
fn parse_sample(json: &Value) -> Option<MetricSample> {
    let stats = json.get("stats").filter(|v| v.is_object()).unwrap_or(json);

    let cpu = first_number(stats, &["cpuPercent", "cpu"]);
    let memory = first_number(stats, &["memoryUsageMb", "memoryMb", "memory"]);
    let disk = first_number(stats, &["diskUsageMb", "diskMb", "disk"]);
    let rx = first_number(stats, &["networkRxBytes", "networkRx", "rx"]);
    let tx = first_number(stats, &["networkTxBytes", "networkTx", "tx"]);

    if cpu.is_none() && memory.is_none() && disk.is_none() && rx.is_none() && tx.is_none() {
        return None;
    }

    let observed_at = first_str(stats, &["timestamp", "observedAt"])
        .or_else(|| first_str(json, &["timestamp"]))
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(MetricSample {
        cpu_percent: cpu.unwrap_or(0.0),
        memory_usage_mb: memory.unwrap_or(0.0),
        disk_usage_mb: disk.unwrap_or(0.0),
        network_rx_bytes: rx.unwrap_or(0.0).max(0.0) as u64,
        network_tx_bytes: tx.unwrap_or(0.0).max(0.0) as u64,
        observed_at,
    })
}

// ============================================================================
// Handlers
// ============================================================================

pub type HandlerResult = anyhow::Result<()>;

type Callback = Rc<dyn Fn(&InboundEvent) -> HandlerResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    topic: Option<String>,
    callback: Callback,
}

#[derive(Default)]
pub struct Router {
    handlers: RefCell<Vec<Registration>>,
    next_handler: Cell<u64>,
    next_seq: Cell<u64>,
    dropped: Cell<u64>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw frame into an event, assigning the next sequence number.
    ///
    /// Malformed and unknown frames are logged and dropped; control frames
    /// are consumed here.
    pub fn ingest(&self, raw: &str) -> Option<InboundEvent> {
        match parse_frame(raw) {
            Ok(ParsedFrame::Event { server_id, kind }) => {
                let seq = self.next_seq.get() + 1;
                self.next_seq.set(seq);
                Some(InboundEvent {
                    seq,
                    server_id,
                    kind,
                })
            }
            Ok(ParsedFrame::Control {
                frame_type,
                message,
            }) => {
                if frame_type == FRAME_ERROR {
                    tracing::warn!(message = message.as_deref().unwrap_or(""), "server reported error");
                } else {
                    tracing::trace!(frame_type = %frame_type, "control frame");
                }
                None
            }
            Err(e) => {
                self.dropped.set(self.dropped.get() + 1);
                tracing::warn!(error = %e, "dropping inbound frame");
                None
            }
        }
    }

    /// Frames dropped because they failed to parse.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.get()
    }

    /// Register a handler. With a topic, only that topic's events are delivered.
    pub fn register<F>(&self, topic: Option<String>, callback: F) -> HandlerId
    where
        F: Fn(&InboundEvent) -> HandlerResult + 'static,
    {
        let id = HandlerId(self.next_handler.get() + 1);
        self.next_handler.set(id.0);
        self.handlers.borrow_mut().push(Registration {
            id,
            topic,
            callback: Rc::new(callback),
        });
        id
    }

    /// Remove a handler by identity. Returns whether it was registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        let before = handlers.len();
        handlers.retain(|registration| registration.id != id);
        handlers.len() != before
    }

    pub fn is_registered(&self, id: HandlerId) -> bool {
        self.handlers.borrow().iter().any(|registration| registration.id == id)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    /// Deliver an event to every matching handler, in registration order.
    ///
    /// A handler that returns an error or panics is logged and skipped.
    /// Handlers removed during delivery are not invoked afterwards.
    pub fn dispatch(&self, event: &InboundEvent) {
        let snapshot: Vec<Registration> = self.handlers.borrow().clone();
        for registration in snapshot {
            if let Some(topic) = &registration.topic {
                if topic != &event.server_id {
                    continue;
                }
            }
            if !self.is_registered(registration.id) {
                continue;
            }

            let callback = Rc::clone(&registration.callback);
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    handler = %registration.id,
                    seq = event.seq,
                    event = event.kind.name(),
                    error = %e,
                    "event handler failed"
                ),
                Err(_) => tracing::error!(
                    handler = %registration.id,
                    seq = event.seq,
                    event = event.kind.name(),
                    "event handler panicked"
                ),
            }
        }
    }
}

/// Disposer for a handler registration. Dropping it removes the handler.
#[must_use = "dropping the guard unregisters the handler"]
pub struct HandlerGuard {
    router: Weak<Router>,
    id: HandlerId,
    armed: bool,
}

impl HandlerGuard {
    pub(crate) fn new(router: &Rc<Router>, id: HandlerId) -> Self {
        Self {
            router: Rc::downgrade(router),
            id,
            armed: true,
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Unregister now.
    pub fn dispose(mut self) {
        self.release();
    }

    /// Keep the handler registered for the lifetime of the router.
    pub fn detach(mut self) -> HandlerId {
        self.armed = false;
        self.id
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.armed, false) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.remove(self.id);
        }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Tests
// ============================================================================
