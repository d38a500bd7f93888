#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use panel_realtime::transport::backoff::BackoffConfig;
use panel_realtime::{
    AllocationTable, Collaborators, Connector, HistoryError, HistorySource, RealtimeClient,
    RealtimeConfig, Session, StaticCredential, TransportError,
};
use serde_json::{json, Value};
use shared_types::HistoricalLine;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Connector
// ============================================================================

/// Server side of one scripted session.
pub struct Peer {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<String>,
}

impl Peer {
    /// Frames the client wrote since the last call, parsed as JSON.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap_or(Value::String(frame)));
        }
        frames
    }

    pub fn push(&self, frame: Value) {
        self.inbound.send(frame.to_string()).unwrap();
    }

    pub fn push_raw(&self, frame: &str) {
        self.inbound.send(frame.to_string()).unwrap();
    }
}

#[derive(Default)]
pub struct MockConnector {
    pub dials: Cell<usize>,
    pub failures: Cell<usize>,
    peers: RefCell<VecDeque<Peer>>,
}

impl MockConnector {
    pub fn take_peer(&self) -> Peer {
        self.peers
            .borrow_mut()
            .pop_front()
            .expect("no session was established")
    }

    pub fn open_sessions(&self) -> usize {
        self.peers.borrow().len()
    }
}

#[async_trait(?Send)]
impl Connector for MockConnector {
    async fn connect(&self, _credential: &str) -> Result<Session, TransportError> {
        self.dials.set(self.dials.get() + 1);
        if self.failures.get() > 0 {
            self.failures.set(self.failures.get() - 1);
            return Err(TransportError::Io("connection refused".to_string()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.peers.borrow_mut().push_back(Peer {
            sent: out_rx,
            inbound: in_tx,
        });
        Ok(Session {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ============================================================================
// History
// ============================================================================

type HistoryReply = Result<Vec<HistoricalLine>, HistoryError>;

/// History source whose fetches stay pending until the test resolves them.
#[derive(Default)]
pub struct ScriptedHistory {
    pub calls: RefCell<Vec<String>>,
    waiting: RefCell<Vec<(String, oneshot::Sender<HistoryReply>)>>,
}

impl ScriptedHistory {
    /// Answer the oldest fetch for `server_id` that is still being awaited.
    pub fn resolve(&self, server_id: &str, reply: HistoryReply) -> bool {
        let mut waiting = self.waiting.borrow_mut();
        waiting.retain(|(_, tx)| !tx.is_closed());
        let Some(index) = waiting.iter().position(|(id, _)| id == server_id) else {
            return false;
        };
        let (_, tx) = waiting.remove(index);
        tx.send(reply).is_ok()
    }

    pub fn resolve_lines(&self, server_id: &str, lines: &[&str]) -> bool {
        self.resolve(server_id, Ok(history_lines(lines)))
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

#[async_trait(?Send)]
impl HistorySource for ScriptedHistory {
    async fn fetch_recent_lines(&self, server_id: &str, _limit: usize) -> HistoryReply {
        self.calls.borrow_mut().push(server_id.to_string());
        let (tx, rx) = oneshot::channel();
        self.waiting.borrow_mut().push((server_id.to_string(), tx));
        rx.await
            .unwrap_or_else(|_| Err(HistoryError::Http("request dropped".to_string())))
    }
}

pub fn history_lines(lines: &[&str]) -> Vec<HistoricalLine> {
    lines
        .iter()
        .map(|text| HistoricalLine::new(shared_types::ConsoleStream::Stdout, *text))
        .collect()
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub client: RealtimeClient,
    pub connector: Rc<MockConnector>,
    pub history: Rc<ScriptedHistory>,
    pub auth: Rc<StaticCredential>,
    pub allocations: Rc<AllocationTable>,
}

pub fn test_config() -> RealtimeConfig {
    RealtimeConfig {
        backoff: BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(400),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ping_interval: None,
        history_timeout: Duration::from_secs(60),
        ..RealtimeConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: RealtimeConfig) -> Harness {
    let connector = Rc::new(MockConnector::default());
    let history = Rc::new(ScriptedHistory::default());
    let auth = Rc::new(StaticCredential::new("test-token"));
    let allocations = Rc::new(AllocationTable::new());
    let client = RealtimeClient::new(
        config,
        Collaborators {
            connector: connector.clone(),
            auth: auth.clone(),
            history: history.clone(),
            metadata: allocations.clone(),
        },
    );
    Harness {
        client,
        connector,
        history,
        auth,
        allocations,
    }
}

/// Let spawned local tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

// ============================================================================
// Frames
// ============================================================================

pub fn console_frame(server_id: &str, data: &str) -> Value {
    json!({
        "type": "console_output",
        "serverId": server_id,
        "stream": "stdout",
        "data": data,
    })
}

pub fn subscribe_frame(server_id: &str) -> Value {
    json!({"type": "subscribe", "serverId": server_id})
}

pub fn unsubscribe_frame(server_id: &str) -> Value {
    json!({"type": "unsubscribe", "serverId": server_id})
}
