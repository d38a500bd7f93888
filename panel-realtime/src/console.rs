//! Console buffer - per-server transcript merged from history and live lines
//!
//! A buffer starts in the seeding phase: live lines are held aside until the
//! historical fetch resolves, then the history is laid down first and the held
//! lines after it. Eviction (oldest first) only happens outside the seeding
//! phase. Fetch results carry a token; a result whose token no longer matches
//! the buffer's phase is stale and discarded.
//!
//! History and live lines overlap only when the history already contains lines
//! stamped after the buffer started listening. Those lines are kept from the
//! history and their live copies are skipped, whichever side arrives first.
//! Untimestamped history is never de-duplicated.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared_types::{ConsoleStream, HistoricalLine};

use crate::history::HistoryError;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsoleEntry {
    /// Unique within the topic's buffer
    pub id: u64,
    pub stream: ConsoleStream,
    pub text: String,
    /// Router sequence number for live lines; `None` for history and local echo
    pub seq: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HistoryStatus {
    /// No fetch was requested, or it was abandoned by a clear
    NotRequested,
    Pending,
    Loaded,
    /// The fetch failed; live lines are shown and a retry is possible
    Unavailable { reason: String },
}

impl HistoryStatus {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, HistoryStatus::Unavailable { .. })
    }
}

/// Read-only copy of a buffer handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsoleSnapshot {
    pub entries: Vec<ConsoleEntry>,
    pub history: HistoryStatus,
    /// Entries dropped by the cap since the buffer was created or cleared
    pub evicted: u64,
}

impl ConsoleSnapshot {
    pub fn lines(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.text.as_str()).collect()
    }
}

#[derive(Debug)]
enum Phase {
    /// First fetch outstanding; live lines wait in `pending`
    Seeding { token: u64, pending: Vec<ConsoleEntry> },
    /// Retry outstanding; live lines are visible and history goes in front of them
    Backfilling { token: u64 },
    Live,
}

// ============================================================================
// ConsoleBuffer
// ============================================================================

#[derive(Debug)]
pub struct ConsoleBuffer {
    cap: usize,
    entries: VecDeque<ConsoleEntry>,
    phase: Phase,
    history: HistoryStatus,
    next_id: u64,
    evicted: u64,
    /// When live delivery started for this buffer
    listening_since: DateTime<Utc>,
    /// History lines stamped after `listening_since` whose live copy has not arrived yet
    echoes: VecDeque<(ConsoleStream, String)>,
}

impl ConsoleBuffer {
    pub fn new(cap: usize) -> Self {
        Self::listening_since(cap, Utc::now())
    }

    pub fn listening_since(cap: usize, since: DateTime<Utc>) -> Self {
        Self {
            cap: cap.max(1),
            entries: VecDeque::new(),
            phase: Phase::Live,
            history: HistoryStatus::NotRequested,
            next_id: 0,
            evicted: 0,
            listening_since: since,
            echoes: VecDeque::new(),
        }
    }

    /// Begin a historical fetch identified by `token`.
    ///
    /// On an empty buffer this holds live lines back until the fetch resolves;
    /// otherwise live lines stay visible and the history is placed before them.
    pub fn start_history(&mut self, token: u64) {
        self.phase = if self.entries.is_empty() {
            let pending = match std::mem::replace(&mut self.phase, Phase::Live) {
                Phase::Seeding { pending, .. } => pending,
                _ => Vec::new(),
            };
            Phase::Seeding { token, pending }
        } else {
            Phase::Backfilling { token }
        };
        self.history = HistoryStatus::Pending;
    }

    pub fn is_seeding(&self) -> bool {
        matches!(self.phase, Phase::Seeding { .. })
    }

    pub fn history_status(&self) -> &HistoryStatus {
        &self.history
    }

    /// Token of the outstanding fetch, if any.
    pub fn pending_token(&self) -> Option<u64> {
        match self.phase {
            Phase::Seeding { token, .. } | Phase::Backfilling { token } => Some(token),
            Phase::Live => None,
        }
    }

    /// Append a live chunk. Multi-line chunks become one entry per line.
    /// Returns the number of entries added; lines already shown from history are skipped.
    pub fn push_live(&mut self, seq: u64, stream: ConsoleStream, text: &str) -> usize {
        let mut added = 0;
        for line in split_lines(text) {
            if !self.is_seeding() && self.take_echo(stream, line) {
                continue;
            }
            self.append(Some(seq), stream, line.to_string(), Utc::now());
            added += 1;
        }
        added
    }

    /// Append a locally produced line (e.g. an echoed command).
    pub fn push_local(&mut self, stream: ConsoleStream, text: impl Into<String>) {
        self.append(None, stream, text.into(), Utc::now());
    }

    /// Resolve the fetch identified by `token`. Returns `false` for a stale result.
    pub fn apply_history(&mut self, token: u64, result: Result<Vec<HistoricalLine>, HistoryError>) -> bool {
        if self.pending_token() != Some(token) {
            tracing::debug!(token, "discarding stale history result");
            return false;
        }

        let live: Vec<ConsoleEntry> = match std::mem::replace(&mut self.phase, Phase::Live) {
            Phase::Seeding { pending, .. } => pending,
            _ => self.entries.drain(..).collect(),
        };

        self.echoes.clear();
        match result {
            Ok(lines) => {
                self.entries.clear();
                for line in lines {
                    match line.timestamp {
                        Some(at) if at >= self.listening_since => {
                            self.echoes.push_back((line.stream, line.text.clone()));
                        }
                        _ => self.echoes.clear(),
                    }
                    let timestamp = line.timestamp.unwrap_or_else(Utc::now);
                    let entry = self.entry(None, line.stream, line.text, timestamp);
                    self.entries.push_back(entry);
                }

                let mut skipped = 0;
                for entry in live {
                    if entry.seq.is_some() && self.take_echo(entry.stream, &entry.text) {
                        skipped += 1;
                        continue;
                    }
                    self.entries.push_back(entry);
                }
                if skipped > 0 {
                    tracing::debug!(skipped, "live lines already present in history");
                }
                self.history = HistoryStatus::Loaded;
            }
            Err(e) => {
                self.entries = live.into();
                self.history = HistoryStatus::Unavailable {
                    reason: e.to_string(),
                };
            }
        }
        self.trim();
        true
    }

    /// Empty the buffer. Any outstanding fetch is abandoned; only new live lines appear.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.echoes.clear();
        self.evicted = 0;
        if !matches!(self.phase, Phase::Live) {
            self.phase = Phase::Live;
            self.history = HistoryStatus::NotRequested;
        }
        if self.history.is_unavailable() {
            self.history = HistoryStatus::NotRequested;
        }
    }

    /// Visible entries. Lines held during seeding are not included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> ConsoleSnapshot {
        ConsoleSnapshot {
            entries: self.entries.iter().cloned().collect(),
            history: self.history.clone(),
            evicted: self.evicted,
        }
    }

    fn append(&mut self, seq: Option<u64>, stream: ConsoleStream, text: String, timestamp: DateTime<Utc>) {
        let entry = self.entry(seq, stream, text, timestamp);
        match &mut self.phase {
            Phase::Seeding { pending, .. } => pending.push(entry),
            _ => {
                self.entries.push_back(entry);
                self.trim();
            }
        }
    }

    fn entry(&mut self, seq: Option<u64>, stream: ConsoleStream, text: String, timestamp: DateTime<Utc>) -> ConsoleEntry {
        self.next_id += 1;
        ConsoleEntry {
            id: self.next_id,
            stream,
            text,
            seq,
            timestamp,
        }
    }

    /// Consume the expected live copy of a history line. Lines before the match
    /// never came through live; a line matching nothing ends the overlap.
    fn take_echo(&mut self, stream: ConsoleStream, text: &str) -> bool {
        if self.echoes.is_empty() {
            return false;
        }
        match self
            .echoes
            .iter()
            .position(|(s, t)| *s == stream && t == text)
        {
            Some(index) => {
                self.echoes.drain(..=index);
                true
            }
            None => {
                self.echoes.clear();
                false
            }
        }
    }

    fn trim(&mut self) {
        while self.entries.len() > self.cap {
            self.entries.pop_front();
            self.evicted += 1;
        }
    }
}

/// Split a chunk into lines, tolerating `\r\n` and ignoring one trailing newline.
fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    let text = text.strip_suffix('\n').unwrap_or(text);
    let text = text.strip_suffix('\r').unwrap_or(text);
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
}


// ============================================================================
// ConsoleStore
// ============================================================================

/// All console buffers, keyed by topic.
#[derive(Debug)]
pub struct ConsoleStore {
    cap: usize,
    buffers: HashMap<String, ConsoleBuffer>,
    next_token: u64,
}

impl ConsoleStore {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buffers: HashMap::new(),
            next_token: 0,
        }
    }

    /// Create a fresh buffer for `topic` in the seeding phase, replacing any
    /// previous one. Returns the fetch token.
    pub fn open(&mut self, topic: &str) -> u64 {
        let token = self.issue_token();
        let mut buffer = ConsoleBuffer::new(self.cap);
        buffer.start_history(token);
        self.buffers.insert(topic.to_string(), buffer);
        token
    }

    /// Start another fetch for a topic whose history is unavailable.
    pub fn retry(&mut self, topic: &str) -> Option<u64> {
        let token = self.next_token + 1;
        let buffer = self.buffers.get_mut(topic)?;
        if !buffer.history_status().is_unavailable() {
            return None;
        }
        buffer.start_history(token);
        self.next_token = token;
        Some(token)
    }

    pub fn get(&self, topic: &str) -> Option<&ConsoleBuffer> {
        self.buffers.get(topic)
    }

    pub fn get_mut(&mut self, topic: &str) -> Option<&mut ConsoleBuffer> {
        self.buffers.get_mut(topic)
    }

    pub fn remove(&mut self, topic: &str) -> Option<ConsoleBuffer> {
        self.buffers.remove(topic)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn issue_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

// ============================================================================
// Tests
// ============================================================================
