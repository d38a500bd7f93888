//! Transport - owns the single physical connection to the backend
//!
//! The transport runs one connection task (spawned on the current `LocalSet`)
//! that dials through a [`Connector`], pumps inbound frames to a
//! [`TransportObserver`], and redials with [`Backoff`] whenever the session
//! ends. Nothing outside this module sees a reconnect except through the
//! observer callbacks and [`Transport::state`].
//!
//! Frames sent while not connected are dropped, not queued: subscriptions are
//! replayed from the topic registry on every reconnect and console commands
//! are rejected up front, so a queue would only replay stale intent.

pub mod backoff;
pub mod state;
pub mod ws;

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use shared_types::OutboundFrame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::collaborators::AuthProvider;
use backoff::{Backoff, BackoffConfig};
pub use state::ConnectionState;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Transport was torn down")]
    Closed,

    #[error("No credential available or session not ready")]
    NotAuthenticated,

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    Io(String),
}

// ============================================================================
// Seams
// ============================================================================

/// One established session: text frames out, text frames in.
///
/// The session is over when `inbound` yields `None`. Dropping `outbound`
/// tells the connector to close its side.
pub struct Session {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Dials the backend. Implemented over WebSocket by [`ws::WsConnector`].
#[async_trait(?Send)]
pub trait Connector {
    async fn connect(&self, credential: &str) -> Result<Session, TransportError>;
}

/// Callbacks from the connection task.
pub trait TransportObserver {
    /// A session is up but not yet announced. Frames pushed here go out
    /// before anyone can observe the connected state.
    fn on_established(&self);
    /// The transport is now `Connected`.
    fn on_open(&self);
    /// One inbound text frame, in arrival order.
    fn on_frame(&self, frame: String);
    /// A connected session was lost; a reconnect is scheduled.
    fn on_close(&self);
}

/// Where outbound frames go.
pub trait FrameSink {
    fn is_connected(&self) -> bool;
    /// Write a frame on the live session if there is one. Returns whether it was written.
    fn push_frame(&self, frame: &OutboundFrame) -> bool;
}

// ============================================================================
// Transport
// ============================================================================

pub struct Transport {
    connector: Rc<dyn Connector>,
    backoff: BackoffConfig,
    ping_interval: Option<Duration>,
    state: Cell<ConnectionState>,
    link: RefCell<Option<mpsc::UnboundedSender<String>>>,
    task: RefCell<Option<JoinHandle<()>>>,
    torn_down: Cell<bool>,
    attempts: Cell<u64>,
}

impl Transport {
    pub fn new(
        connector: Rc<dyn Connector>,
        backoff: BackoffConfig,
        ping_interval: Option<Duration>,
    ) -> Self {
        Self {
            connector,
            backoff,
            ping_interval,
            state: Cell::new(ConnectionState::Disconnected),
            link: RefCell::new(None),
            task: RefCell::new(None),
            torn_down: Cell::new(false),
            attempts: Cell::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Number of dial attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.get()
    }

    /// Start the connection task. No-op while a connection is active or pending.
    ///
    /// Must be called from within a `LocalSet`.
    pub fn connect(
        self: &Rc<Self>,
        auth: Rc<dyn AuthProvider>,
        observer: Weak<dyn TransportObserver>,
    ) -> Result<(), TransportError> {
        if self.torn_down.get() {
            return Err(TransportError::Closed);
        }
        if self.state.get().is_active() {
            tracing::debug!(state = %self.state.get(), "connect ignored, transport already active");
            return Ok(());
        }

        self.transition(ConnectionState::Connecting);
        let transport = Rc::clone(self);
        let handle = tokio::task::spawn_local(async move {
            transport.run(auth, observer).await;
        });
        *self.task.borrow_mut() = Some(handle);
        Ok(())
    }

    /// Terminal teardown: cancels the connection task, including any pending
    /// backoff timer, and drops the session.
    pub fn disconnect(&self) {
        self.torn_down.set(true);
        if let Some(task) = self.task.borrow_mut().take() {
            task.abort();
        }
        self.link.borrow_mut().take();
        if self.state.get() != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
            tracing::info!("transport torn down");
        }
    }

    /// Send a raw text frame. Dropped (returns `false`) unless connected.
    pub fn send(&self, frame: &str) -> bool {
        if !self.state.get().is_connected() {
            tracing::debug!(state = %self.state.get(), "dropping frame while not connected");
            return false;
        }
        self.write(frame.to_string())
    }

    fn write(&self, frame: String) -> bool {
        match self.link.borrow().as_ref() {
            Some(link) => link.send(frame).is_ok(),
            None => false,
        }
    }

    fn transition(&self, next: ConnectionState) {
        let current = self.state.get();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::error!(from = %current, to = %next, "unexpected transport transition");
        }
        tracing::debug!(from = %current, to = %next, "transport state");
        self.state.set(next);
    }

    async fn run(self: Rc<Self>, auth: Rc<dyn AuthProvider>, observer: Weak<dyn TransportObserver>) {
        let mut backoff = Backoff::new(self.backoff.clone());

        loop {
            if self.torn_down.get() || observer.upgrade().is_none() {
                return;
            }
            self.transition(ConnectionState::Connecting);
            self.attempts.set(self.attempts.get() + 1);

            let attempt = match auth.credential() {
                Some(credential) if auth.is_ready() => self.connector.connect(&credential).await,
                _ => Err(TransportError::NotAuthenticated),
            };
            if self.torn_down.get() {
                return;
            }

            match attempt {
                Ok(session) => {
                    let opened = Instant::now();
                    self.drive_session(session, &observer).await;
                    if self.torn_down.get() {
                        return;
                    }
                    // a session that drops right after the handshake keeps growing the delay
                    if opened.elapsed() >= self.backoff.max {
                        backoff.reset();
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt = self.attempts.get(), "connection attempt failed");
                    self.transition(ConnectionState::Reconnecting);
                }
            }

            let delay = backoff.next_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    async fn drive_session(&self, session: Session, observer: &Weak<dyn TransportObserver>) {
        let Session {
            outbound,
            mut inbound,
        } = session;
        *self.link.borrow_mut() = Some(outbound);

        if let Some(observer) = observer.upgrade() {
            observer.on_established();
        }
        self.transition(ConnectionState::Connected);
        tracing::info!("transport connected");
        if let Some(observer) = observer.upgrade() {
            observer.on_open();
        }

        let mut keepalive = self
            .ping_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));
        let ping = OutboundFrame::Ping.to_json();

        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    let Some(observer) = observer.upgrade() else { break };
                    observer.on_frame(frame);
                    if self.torn_down.get() {
                        return;
                    }
                }
                _ = next_tick(&mut keepalive) => {
                    if !self.write(ping.clone()) {
                        tracing::debug!("keepalive ping not written");
                    }
                }
            }
        }

        self.link.borrow_mut().take();
        if self.torn_down.get() {
            return;
        }
        self.transition(ConnectionState::Reconnecting);
        tracing::warn!("transport connection lost");
        if let Some(observer) = observer.upgrade() {
            observer.on_close();
        }
    }
}

async fn next_tick(keepalive: &mut Option<tokio::time::Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl FrameSink for Transport {
    fn is_connected(&self) -> bool {
        self.state.get().is_connected()
    }

    fn push_frame(&self, frame: &OutboundFrame) -> bool {
        self.write(frame.to_json())
    }
}

// ============================================================================
// Tests
// ============================================================================
