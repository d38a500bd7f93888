//! RealtimeClient - the public surface of the realtime core
//!
//! One client owns one [`Transport`] and everything scoped to it: the topic
//! registry, the router, and the per-topic console and metrics state. All
//! state lives on the current thread; handlers may call back into the client
//! (subscribe, unsubscribe, send) while an event is being dispatched, because
//! no internal borrow is held across a dispatch.
//!
//! Handlers that need the client should capture a [`WeakClient`]. A handler
//! holding a strong [`RealtimeClient`] keeps the client alive for as long as
//! the handler stays registered.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use shared_types::{ConsoleStream, HistoricalLine, OutboundFrame, ServerState};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::collaborators::{AuthProvider, ServerMetadata};
use crate::command::{validate_command, CommandRejection};
use crate::config::RealtimeConfig;
use crate::console::{ConsoleSnapshot, ConsoleStore, HistoryStatus};
use crate::history::{HistoryError, HistorySource, HttpHistorySource};
use crate::metrics::{MetricsStore, MetricsView};
use crate::registry::{Acquired, RegistryError, Released, TopicRegistry};
use crate::router::{EventKind, HandlerGuard, HandlerResult, InboundEvent, Router};
use crate::transport::ws::WsConnector;
use crate::transport::{
    ConnectionState, Connector, FrameSink, Transport, TransportError, TransportObserver,
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// External collaborators the client is built from.
pub struct Collaborators {
    pub connector: Rc<dyn Connector>,
    pub auth: Rc<dyn AuthProvider>,
    pub history: Rc<dyn HistorySource>,
    pub metadata: Rc<dyn ServerMetadata>,
}

impl Collaborators {
    /// WebSocket transport and HTTP history, both pointed at the configured panel.
    pub fn panel(
        config: &RealtimeConfig,
        auth: Rc<dyn AuthProvider>,
        metadata: Rc<dyn ServerMetadata>,
    ) -> Self {
        Self {
            connector: Rc::new(WsConnector::new(config.ws_url.clone())),
            history: Rc::new(HttpHistorySource::new(config.api_url.clone(), auth.clone())),
            auth,
            metadata,
        }
    }
}

/// Change notification for consumers that render topic state.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicChange {
    ConsoleUpdated { server_id: String },
    HistoryLoaded { server_id: String },
    HistoryUnavailable { server_id: String, reason: String },
    MetricsUpdated { server_id: String },
    StateChanged { server_id: String, state: ServerState },
    /// The last subscriber left; the topic's state was discarded
    TopicReleased { server_id: String },
}

struct HistoryJob {
    token: u64,
    handle: JoinHandle<()>,
}

struct ClientInner {
    config: RealtimeConfig,
    transport: Rc<Transport>,
    auth: Rc<dyn AuthProvider>,
    history: Rc<dyn HistorySource>,
    metadata: Rc<dyn ServerMetadata>,
    registry: RefCell<TopicRegistry>,
    router: Rc<Router>,
    consoles: RefCell<ConsoleStore>,
    metrics: RefCell<MetricsStore>,
    history_jobs: RefCell<HashMap<String, HistoryJob>>,
    connectivity: watch::Sender<bool>,
    changes: broadcast::Sender<TopicChange>,
    this: Weak<ClientInner>,
}

#[derive(Clone)]
pub struct RealtimeClient {
    inner: Rc<ClientInner>,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            connector,
            auth,
            history,
            metadata,
        } = collaborators;
        let transport = Rc::new(Transport::new(
            connector,
            config.backoff.clone(),
            config.ping_interval,
        ));
        let (connectivity, _) = watch::channel(false);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let console_cap = config.console_cap;

        let inner = Rc::new_cyclic(|this| ClientInner {
            config,
            transport,
            auth,
            history,
            metadata,
            registry: RefCell::new(TopicRegistry::new()),
            router: Rc::new(Router::new()),
            consoles: RefCell::new(ConsoleStore::new(console_cap)),
            metrics: RefCell::new(MetricsStore::new()),
            history_jobs: RefCell::new(HashMap::new()),
            connectivity,
            changes,
            this: this.clone(),
        });
        Self { inner }
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Start connecting. Idempotent while connecting or connected.
    ///
    /// Refuses with [`TransportError::NotAuthenticated`] until the auth
    /// collaborator is ready and has a credential. Must run inside a `LocalSet`.
    pub fn connect(&self) -> Result<(), TransportError> {
        let auth = &self.inner.auth;
        if !auth.is_ready() || auth.credential().is_none() {
            tracing::debug!("connect refused, auth not ready");
            return Err(TransportError::NotAuthenticated);
        }
        let observer: Weak<ClientInner> = Rc::downgrade(&self.inner);
        let observer: Weak<dyn TransportObserver> = observer;
        self.inner.transport.connect(Rc::clone(auth), observer)
    }

    /// Terminal teardown of the connection. Topic state is kept for reading.
    pub fn disconnect(&self) {
        self.inner.transport.disconnect();
        self.inner.connectivity.send_replace(false);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Connected/disconnected signal for gating interactive controls.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.inner.connectivity.subscribe()
    }

    pub fn changes(&self) -> broadcast::Receiver<TopicChange> {
        self.inner.changes.subscribe()
    }

    // ------------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------------

    /// Add a subscriber to `server_id`. The first subscriber starts the history fetch.
    pub fn subscribe(&self, server_id: &str) {
        let acquired = self
            .inner
            .registry
            .borrow_mut()
            .subscribe(server_id, &*self.inner.transport);
        if let Acquired::First { sent } = acquired {
            tracing::info!(server_id, sent, "topic opened");
            self.inner.open_topic(server_id);
        }
    }

    /// Remove a subscriber. The last one discards the topic's console and metrics.
    pub fn unsubscribe(&self, server_id: &str) -> Result<(), RegistryError> {
        self.inner.unsubscribe(server_id)
    }

    /// Subscribe and get a guard that unsubscribes when dropped.
    pub fn watch(&self, server_id: &str) -> TopicGuard {
        self.subscribe(server_id);
        TopicGuard {
            client: self.downgrade(),
            server_id: Some(server_id.to_string()),
        }
    }

    pub fn subscriber_count(&self, server_id: &str) -> usize {
        self.inner.registry.borrow().count(server_id)
    }

    pub fn active_topics(&self) -> Vec<String> {
        self.inner.registry.borrow().active_topics()
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    /// Register a handler for every event. Dropping the guard unregisters it.
    pub fn on_event<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&InboundEvent) -> HandlerResult + 'static,
    {
        let id = self.inner.router.register(None, handler);
        HandlerGuard::new(&self.inner.router, id)
    }

    /// Register a handler for one topic's events.
    pub fn on_topic_event<F>(&self, server_id: &str, handler: F) -> HandlerGuard
    where
        F: Fn(&InboundEvent) -> HandlerResult + 'static,
    {
        let id = self
            .inner
            .router
            .register(Some(server_id.to_string()), handler);
        HandlerGuard::new(&self.inner.router, id)
    }

    // ------------------------------------------------------------------------
    // Topic state
    // ------------------------------------------------------------------------

    pub fn console(&self, server_id: &str) -> Option<ConsoleSnapshot> {
        self.inner
            .consoles
            .borrow()
            .get(server_id)
            .map(|buffer| buffer.snapshot())
    }

    /// Empty a topic's console. History is not fetched again.
    pub fn clear_console(&self, server_id: &str) -> bool {
        let cleared = match self.inner.consoles.borrow_mut().get_mut(server_id) {
            Some(buffer) => {
                buffer.clear();
                true
            }
            None => false,
        };
        if cleared {
            self.inner.abort_history(server_id);
            self.inner.notify(TopicChange::ConsoleUpdated {
                server_id: server_id.to_string(),
            });
        }
        cleared
    }

    /// Fetch history again for a topic whose history is unavailable.
    pub fn retry_history(&self, server_id: &str) -> bool {
        let token = self.inner.consoles.borrow_mut().retry(server_id);
        match token {
            Some(token) => {
                tracing::info!(server_id, "retrying console history");
                self.inner.start_history(server_id, token);
                true
            }
            None => false,
        }
    }

    pub fn metrics(&self, server_id: &str) -> Option<MetricsView> {
        self.inner
            .metrics
            .borrow()
            .view(server_id, &*self.inner.metadata)
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Send a console command to a subscribed server.
    ///
    /// Rejected without any wire traffic when disconnected, when nobody is
    /// subscribed to the server, or when the command is malformed.
    pub fn send_command(&self, server_id: &str, command: &str) -> Result<(), CommandRejection> {
        if !self.inner.transport.is_connected() {
            return Err(CommandRejection::Disconnected);
        }
        if !self.inner.registry.borrow().is_subscribed(server_id) {
            return Err(CommandRejection::NotSubscribed {
                server_id: server_id.to_string(),
            });
        }
        let command = validate_command(command, self.inner.config.max_command_len)?;

        let frame = OutboundFrame::console_command(server_id, command);
        if !self.inner.transport.push_frame(&frame) {
            return Err(CommandRejection::Disconnected);
        }
        tracing::debug!(server_id, "console command sent");

        if self.inner.config.echo_commands {
            if let Some(buffer) = self.inner.consoles.borrow_mut().get_mut(server_id) {
                buffer.push_local(ConsoleStream::Stdin, command);
            }
            self.inner.notify(TopicChange::ConsoleUpdated {
                server_id: server_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

// ============================================================================
// Internals
// ============================================================================

impl ClientInner {
    fn unsubscribe(&self, server_id: &str) -> Result<(), RegistryError> {
        let released = self
            .registry
            .borrow_mut()
            .unsubscribe(server_id, &*self.transport)?;
        if let Released::Last { sent } = released {
            tracing::info!(server_id, sent, "topic released");
            self.release_topic(server_id);
        }
        Ok(())
    }

    fn open_topic(&self, server_id: &str) {
        let token = self.consoles.borrow_mut().open(server_id);
        self.metrics.borrow_mut().remove(server_id);
        self.start_history(server_id, token);
    }

    fn release_topic(&self, server_id: &str) {
        self.abort_history(server_id);
        self.consoles.borrow_mut().remove(server_id);
        self.metrics.borrow_mut().remove(server_id);
        self.notify(TopicChange::TopicReleased {
            server_id: server_id.to_string(),
        });
    }

    fn start_history(&self, server_id: &str, token: u64) {
        let limit = self.config.history_limit;
        if limit == 0 {
            self.finish_history(server_id, token, Ok(Vec::new()));
            return;
        }

        let timeout = self.config.history_timeout;
        let source = Rc::clone(&self.history);
        let this = self.this.clone();
        let topic = server_id.to_string();
        let handle = tokio::task::spawn_local(async move {
            let result = match tokio::time::timeout(timeout, source.fetch_recent_lines(&topic, limit)).await {
                Ok(result) => result,
                Err(_) => Err(HistoryError::Timeout(timeout)),
            };
            if let Some(inner) = this.upgrade() {
                inner.finish_history(&topic, token, result);
            }
        });

        let previous = self
            .history_jobs
            .borrow_mut()
            .insert(server_id.to_string(), HistoryJob { token, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    fn abort_history(&self, server_id: &str) {
        if let Some(job) = self.history_jobs.borrow_mut().remove(server_id) {
            job.handle.abort();
        }
    }

    fn finish_history(
        &self,
        server_id: &str,
        token: u64,
        result: Result<Vec<HistoricalLine>, HistoryError>,
    ) {
        {
            let mut jobs = self.history_jobs.borrow_mut();
            if jobs.get(server_id).map(|job| job.token) == Some(token) {
                jobs.remove(server_id);
            }
        }
        if let Err(e) = &result {
            tracing::warn!(server_id, error = %e, "console history unavailable");
        }

        let status = {
            let mut consoles = self.consoles.borrow_mut();
            let Some(buffer) = consoles.get_mut(server_id) else {
                tracing::debug!(server_id, "history arrived for a released topic");
                return;
            };
            if !buffer.apply_history(token, result) {
                return;
            }
            buffer.history_status().clone()
        };

        let server_id = server_id.to_string();
        match status {
            HistoryStatus::Unavailable { reason } => self.notify(TopicChange::HistoryUnavailable {
                server_id: server_id.clone(),
                reason,
            }),
            _ => self.notify(TopicChange::HistoryLoaded {
                server_id: server_id.clone(),
            }),
        }
        self.notify(TopicChange::ConsoleUpdated { server_id });
    }

    /// Fold an event into topic state. Returns the change to announce, if any.
    fn apply(&self, event: &InboundEvent) -> Option<TopicChange> {
        let server_id = event.server_id.clone();
        match &event.kind {
            EventKind::ConsoleLine { stream, text } => {
                let mut consoles = self.consoles.borrow_mut();
                let buffer = consoles.get_mut(&event.server_id)?;
                buffer.push_live(event.seq, *stream, text);
                if buffer.is_seeding() {
                    return None;
                }
                Some(TopicChange::ConsoleUpdated { server_id })
            }
            EventKind::ResourceSample(sample) => {
                self.metrics
                    .borrow_mut()
                    .record(&event.server_id, sample.clone());
                Some(TopicChange::MetricsUpdated { server_id })
            }
            EventKind::StateChange { state, .. } => Some(TopicChange::StateChanged {
                server_id,
                state: state.clone(),
            }),
            EventKind::OperationResult(_) => None,
        }
    }

    fn notify(&self, change: TopicChange) {
        // no receivers is fine
        let _ = self.changes.send(change);
    }
}

impl TransportObserver for ClientInner {
    fn on_established(&self) {
        let replayed = self.registry.borrow().resubscribe_all(&*self.transport);
        tracing::debug!(topics = replayed, "subscriptions replayed");
    }

    fn on_open(&self) {
        self.connectivity.send_replace(true);
    }

    fn on_frame(&self, frame: String) {
        let Some(event) = self.router.ingest(&frame) else {
            return;
        };
        if !self.registry.borrow().is_subscribed(&event.server_id) {
            tracing::debug!(server_id = %event.server_id, seq = event.seq, "event for unsubscribed topic dropped");
            return;
        }
        if let Some(change) = self.apply(&event) {
            self.notify(change);
        }
        self.router.dispatch(&event);
    }

    fn on_close(&self) {
        self.connectivity.send_replace(false);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.transport.disconnect();
        for (_, job) in self.history_jobs.borrow_mut().drain() {
            job.handle.abort();
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Non-owning client handle for use inside handlers.
#[derive(Clone)]
pub struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    pub fn upgrade(&self) -> Option<RealtimeClient> {
        self.inner.upgrade().map(|inner| RealtimeClient { inner })
    }
}

/// One subscriber's hold on a topic. Dropping it unsubscribes.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct TopicGuard {
    client: WeakClient,
    server_id: Option<String>,
}

impl TopicGuard {
    pub fn server_id(&self) -> &str {
        self.server_id.as_deref().unwrap_or_default()
    }

    /// Unsubscribe now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(server_id) = self.server_id.take() else {
            return;
        };
        if let Some(inner) = self.client.inner.upgrade() {
            if let Err(e) = inner.unsubscribe(&server_id) {
                tracing::warn!(error = %e, "topic guard release failed");
            }
        }
    }
}

impl Drop for TopicGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// ============================================================================
// Tests
// ============================================================================
