//! Handler registry
//!
//! Maps handler names to uniform callables. The scheduler and executor
//! agree on the registered name as the routing key, so user code adapts its
//! typed functions into the `(args, kwargs) -> Result` shape at registration
//! time; argument checking is the adapter's job. Arguments and results must
//! be JSON-encodable.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::debug;

/// What a handler returns: a JSON value, or a textual error
pub type HandlerResult = std::result::Result<Value, String>;

/// The uniform callable shape every handler is adapted into
pub type Handler = dyn Fn(Vec<Value>, Map<String, Value>) -> HandlerResult + Send + Sync;

/// Process-wide table of task handlers, keyed by name
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<Handler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under a name, replacing any previous registration
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> HandlerResult + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(function = %name, "Registered task handler");
        self.handlers.write().insert(name, Arc::new(handler));
    }

    /// Look up a handler by name
    pub fn get(&self, name: &str) -> Option<Arc<Handler>> {
        self.handlers.read().get(name).cloned()
    }

    /// Whether a handler is registered under the name
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Names of all registered handlers
    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
