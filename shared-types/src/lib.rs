//! Shared types between the panel dashboard and its realtime backend
//!
//! These types are used by both:
//! - the realtime client (`panel-realtime`)
//! - the backend that serves `/ws` and the console history endpoint
//!
//! Serializable with serde for JSON over WebSocket/HTTP

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Console
// ============================================================================

/// Which stream a console line was written to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStream {
    #[default]
    Stdout,
    Stderr,
    /// Lines produced by the panel daemon itself (install steps, power actions)
    System,
    /// Commands typed by an operator
    Stdin,
}

impl ConsoleStream {
    /// Parse the wire name of a stream. Unknown names return `None`.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "system" => Some(Self::System),
            "stdin" => Some(Self::Stdin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
            Self::Stdin => "stdin",
        }
    }
}

impl std::fmt::Display for ConsoleStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line returned by the console history endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricalLine {
    #[serde(default)]
    pub stream: ConsoleStream,
    #[serde(alias = "data", alias = "line")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl HistoricalLine {
    pub fn new(stream: ConsoleStream, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
            timestamp: None,
        }
    }
}

// ============================================================================
// Server State
// ============================================================================

/// Lifecycle state reported for a game server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Offline,
    Installing,
    Starting,
    Running,
    Stopping,
    Crashed,
    /// A state name this client does not know yet
    Other(String),
}

impl ServerState {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "offline" | "stopped" => Self::Offline,
            "installing" => Self::Installing,
            "starting" => Self::Starting,
            "running" | "online" => Self::Running,
            "stopping" => Self::Stopping,
            "crashed" => Self::Crashed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Latest resource usage sample for one server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub cpu_percent: f64,
    pub memory_usage_mb: f64,
    pub disk_usage_mb: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub observed_at: DateTime<Utc>,
}

/// Resources allocated to a server by the panel.
///
/// `None` means the allocation is unknown; `Some(0)` is treated the same way
/// by anything deriving percentages from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerAllocation {
    pub memory_mb: Option<u64>,
    pub disk_mb: Option<u64>,
    /// CPU limit in percent of one core (200 = two cores)
    pub cpu_limit_percent: Option<f64>,
}

// ============================================================================
// Operations
// ============================================================================

/// Outcome of an out-of-band operation reported over the realtime channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationResult {
    pub operation: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Client → Server Frames
// ============================================================================

/// Frames the realtime client sends to the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Subscribe {
        #[serde(rename = "serverId")]
        server_id: String,
    },
    Unsubscribe {
        #[serde(rename = "serverId")]
        server_id: String,
    },
    ConsoleCommand {
        #[serde(rename = "serverId")]
        server_id: String,
        command: String,
    },
    Ping,
}

impl OutboundFrame {
    pub fn subscribe(server_id: impl Into<String>) -> Self {
        Self::Subscribe {
            server_id: server_id.into(),
        }
    }

    pub fn unsubscribe(server_id: impl Into<String>) -> Self {
        Self::Unsubscribe {
            server_id: server_id.into(),
        }
    }

    pub fn console_command(server_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self::ConsoleCommand {
            server_id: server_id.into(),
            command: command.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Inbound frame types
pub const FRAME_CONSOLE_OUTPUT: &str = "console_output";
pub const FRAME_SERVER_STATE: &str = "server_state";
pub const FRAME_SERVER_STATE_UPDATE: &str = "server_state_update";
pub const FRAME_RESOURCE_STATS: &str = "resource_stats";
pub const FRAME_OPERATION_RESULT: &str = "operation_result";
pub const FRAME_COMMAND_RESULT: &str = "command_result";
pub const FRAME_PONG: &str = "pong";
pub const FRAME_CONNECTED: &str = "connected";
pub const FRAME_ERROR: &str = "error";

// ============================================================================
// Tests
// ============================================================================
