//! Fan-out hub: one event, many local listeners.

use std::sync::Arc;

use cloudkit_core::ListenerId;
use parking_lot::RwLock;

/// Listener callback. Receives the event and the sender id, if any.
pub type Callback<T> = Arc<dyn Fn(&T, Option<&str>) + Send + Sync>;

/// A registered listener.
pub struct Listener<T> {
    /// Handle used to deregister.
    pub id: ListenerId,
    /// Callback, or `None` for a placeholder that is skipped on dispatch.
    pub callback: Option<Callback<T>>,
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            callback: self.callback.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Registry dispatching each event to every listener in registration order.
pub struct FanoutHub<T> {
    listeners: RwLock<Vec<Listener<T>>>,
}

impl<T> Default for FanoutHub<T> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<T> FanoutHub<T> {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a listener with a fresh id and return it.
    pub fn register(&self, callback: Option<Callback<T>>) -> Listener<T> {
        let listener = Listener {
            id: ListenerId::new(),
            callback,
        };
        self.listeners.write().push(listener.clone());
        listener
    }

    /// Register a closure.
    pub fn register_fn<F>(&self, f: F) -> Listener<T>
    where
        F: Fn(&T, Option<&str>) + Send + Sync + 'static,
    {
        self.register(Some(Arc::new(f)))
    }

    /// Remove the listener with `id`. Returns whether one was removed.
    pub fn deregister(&self, id: &ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| &l.id != id);
        listeners.len() < before
    }

    /// Invoke every callback with `event` and `sender_id`.
    ///
    /// The listener list is copied first, so callbacks may register or
    /// deregister; changes apply from the next dispatch.
    pub fn dispatch(&self, event: &T, sender_id: Option<&str>) {
        let callbacks: Vec<Callback<T>> = self
            .listeners
            .read()
            .iter()
            .filter_map(|l| l.callback.clone())
            .collect();
        for callback in callbacks {
            callback(event, sender_id);
        }
    }

    /// Number of registered listeners, including placeholders.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}
