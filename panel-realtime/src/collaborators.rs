//! Boundary collaborators the client depends on but does not own.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use shared_types::ServerAllocation;

/// Supplies the bearer credential used for the WebSocket handshake.
pub trait AuthProvider {
    fn credential(&self) -> Option<String>;
    /// The session is authenticated and ready; no dial happens before this is true.
    fn is_ready(&self) -> bool;
}

/// Supplies per-server allocation budgets. Read on every metrics view, never cached.
pub trait ServerMetadata {
    fn allocation(&self, server_id: &str) -> Option<ServerAllocation>;
}

/// Fixed token, e.g. an API key taken from the environment.
#[derive(Debug)]
pub struct StaticCredential {
    token: RefCell<Option<String>>,
    ready: Cell<bool>,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RefCell::new(Some(token.into())),
            ready: Cell::new(true),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.set(ready);
    }

    pub fn replace(&self, token: Option<String>) {
        *self.token.borrow_mut() = token;
    }
}

impl AuthProvider for StaticCredential {
    fn credential(&self) -> Option<String> {
        self.token.borrow().clone().filter(|token| !token.is_empty())
    }

    fn is_ready(&self) -> bool {
        self.ready.get()
    }
}

/// In-memory allocation table the dashboard keeps up to date from its server list.
#[derive(Debug, Default)]
pub struct AllocationTable {
    entries: RefCell<HashMap<String, ServerAllocation>>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, server_id: impl Into<String>, allocation: ServerAllocation) {
        self.entries.borrow_mut().insert(server_id.into(), allocation);
    }

    pub fn remove(&self, server_id: &str) {
        self.entries.borrow_mut().remove(server_id);
    }
}

impl ServerMetadata for AllocationTable {
    fn allocation(&self, server_id: &str) -> Option<ServerAllocation> {
        self.entries.borrow().get(server_id).cloned()
    }
}
