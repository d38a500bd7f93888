//! Panel Realtime - subscription and console-streaming client for the panel dashboard
//!
//! This crate owns the single WebSocket connection to the panel backend,
//! multiplexes one topic per game server over it, and rebuilds per-server
//! console transcripts and resource metrics from the interleaved stream.
//!
//! Everything is single-threaded: the client must be driven from a
//! `tokio::task::LocalSet` on a current-thread runtime.

pub mod client;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod console;
pub mod history;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod transport;

pub use client::{Collaborators, RealtimeClient, TopicChange, TopicGuard, WeakClient};
pub use collaborators::{AllocationTable, AuthProvider, ServerMetadata, StaticCredential};
pub use command::CommandRejection;
pub use config::RealtimeConfig;
pub use console::{ConsoleEntry, ConsoleSnapshot, HistoryStatus};
pub use history::{HistoryError, HistorySource, HttpHistorySource};
pub use metrics::MetricsView;
pub use router::{EventKind, HandlerGuard, HandlerResult, InboundEvent};
pub use transport::{ConnectionState, Connector, Session, TransportError};
