//! Process-wide publish/subscribe registry.
//!
//! Components talk to each other through named events instead of direct
//! references. Emission is synchronous: `emit` returns after every listener
//! registered at the moment of the call has run.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, trace};

use crate::lock;

/// Number of recent emissions kept for `stats()`.
const MAX_EVENT_LOG: usize = 50;

/// Number of recent emissions reported by `stats()`.
const RECENT_EVENTS_REPORTED: usize = 10;

/// Error a listener may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type of every listener callback.
pub type ListenerResult = Result<(), ListenerError>;

type Callback = Arc<dyn Fn(&Value) -> ListenerResult + Send + Sync>;

/// Why a listener invocation did not complete.
#[derive(Debug)]
pub(crate) enum ListenerFailure {
    Error(ListenerError),
    Panic(String),
}

impl std::fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerFailure::Error(e) => write!(f, "{}", e),
            ListenerFailure::Panic(msg) => write!(f, "panicked: {}", msg),
        }
    }
}

/// Run a listener, turning both returned errors and panics into a
/// `ListenerFailure` so delivery to other listeners can continue.
pub(crate) fn invoke_listener(f: impl FnOnce() -> ListenerResult) -> Result<(), ListenerFailure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ListenerFailure::Error(e)),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ListenerFailure::Panic(msg))
        }
    }
}

/// Identifier of a registered listener, unique per bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Registered {
    id: ListenerId,
    callback: Callback,
}

/// One entry of the emission log.
#[derive(Debug, Clone, Serialize)]
pub struct EmittedEvent {
    pub event: String,
    pub at: DateTime<Utc>,
    pub has_data: bool,
}

/// Snapshot of bus activity.
#[derive(Debug, Clone, Serialize)]
pub struct EventBusStats {
    /// Number of distinct event names with at least one listener.
    pub total_events: usize,
    pub total_emits: u64,
    pub listeners: BTreeMap<String, usize>,
    pub recent_events: Vec<EmittedEvent>,
}

struct Inner {
    /// Listeners per event name, in registration order.
    listeners: Mutex<HashMap<String, Vec<Registered>>>,
    next_id: AtomicU64,
    emit_count: AtomicU64,
    recent: Mutex<VecDeque<EmittedEvent>>,
}

impl Inner {
    fn remove(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let Some(registered) = listeners.get_mut(event) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|r| r.id != id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            listeners.remove(event);
        }
        removed
    }
}

/// Handle returned by `on`/`once`.
///
/// Dropping the handle does not unsubscribe; call `unsubscribe`.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    bus: Weak<Inner>,
    event: String,
    id: ListenerId,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.remove(&self.event, self.id),
            None => false,
        }
    }
}

/// Cheaply cloneable handle to a shared listener registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                emit_count: AtomicU64::new(0),
                recent: Mutex::new(VecDeque::with_capacity(MAX_EVENT_LOG)),
            }),
        }
    }

    fn allocate_id(&self) -> ListenerId {
        ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, event: String, id: ListenerId, callback: Callback) -> ListenerHandle {
        lock(&self.inner.listeners)
            .entry(event.clone())
            .or_default()
            .push(Registered { id, callback });
        trace!(event = %event, id = id.0, "listener registered");
        ListenerHandle {
            bus: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Register `callback` for `event`.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) -> ListenerResult + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.register(event.into(), id, Arc::new(callback))
    }

    /// Register `callback` for the next emission of `event` only.
    pub fn once<F>(&self, event: impl Into<String>, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) -> ListenerResult + Send + Sync + 'static,
    {
        let event = event.into();
        let id = self.allocate_id();
        let bus = Arc::downgrade(&self.inner);
        let fired = AtomicBool::new(false);
        let name = event.clone();

        let wrapper = move |data: &Value| {
            if fired.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(inner) = bus.upgrade() {
                inner.remove(&name, id);
            }
            callback(data)
        };

        self.register(event, id, Arc::new(wrapper))
    }

    /// Deliver `data` to every listener of `event`.
    ///
    /// Listeners are called on a copy of the registration list taken before
    /// the first call, so listeners added or removed during emission do not
    /// affect this emission. A failing listener is logged and skipped.
    pub fn emit(&self, event: &str, data: Value) {
        self.inner.emit_count.fetch_add(1, Ordering::Relaxed);
        {
            let mut recent = lock(&self.inner.recent);
            if recent.len() == MAX_EVENT_LOG {
                recent.pop_front();
            }
            recent.push_back(EmittedEvent {
                event: event.to_string(),
                at: Utc::now(),
                has_data: !data.is_null(),
            });
        }

        let snapshot: Vec<Registered> = match lock(&self.inner.listeners).get(event) {
            Some(registered) => registered.clone(),
            None => return,
        };

        for listener in snapshot {
            if let Err(failure) = invoke_listener(|| (listener.callback)(&data)) {
                error!(event = %event, listener = listener.id.0, error = %failure, "event listener failed");
            }
        }
    }

    /// Remove a listener by id.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.remove(event, id)
    }

    /// Remove every listener of `event`, or of all events when `None`.
    pub fn clear(&self, event: Option<&str>) {
        let mut listeners = lock(&self.inner.listeners);
        match event {
            Some(event) => {
                listeners.remove(event);
            }
            None => listeners.clear(),
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.inner.listeners).get(event).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> EventBusStats {
        let listeners: BTreeMap<String, usize> = lock(&self.inner.listeners)
            .iter()
            .map(|(name, registered)| (name.clone(), registered.len()))
            .collect();
        let recent = lock(&self.inner.recent);
        let skip = recent.len().saturating_sub(RECENT_EVENTS_REPORTED);

        EventBusStats {
            total_events: listeners.len(),
            total_emits: self.inner.emit_count.load(Ordering::Relaxed),
            listeners,
            recent_events: recent.iter().skip(skip).cloned().collect(),
        }
    }
}
