//! Listener registry - explicit observer interface
//!
//! Handlers subscribe to one event kind (or to all of them) and get a
//! [`SubscriptionId`] back for unsubscribing. Handlers are called outside
//! the registry lock, so a handler may subscribe or unsubscribe itself.

use parking_lot::RwLock;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry<K, E> {
    id: SubscriptionId,
    /// `None` listens to every kind
    kind: Option<K>,
    handler: Handler<E>,
}

pub struct Listeners<K, E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<Entry<K, E>>>,
}

impl<K, E> Listeners<K, E>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, kind: K, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(handler))
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Call every handler registered for `kind`, in subscription order.
    /// Returns how many were called.
    pub fn emit(&self, kind: K, event: &E) -> usize {
        let handlers: Vec<Handler<E>> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.kind.is_none_or(|k| k == kind))
            .map(|e| Arc::clone(&e.handler))
            .collect();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn insert(&self, kind: Option<K>, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push(Entry { id, kind, handler });
        id
    }
}

impl<K, E> Default for Listeners<K, E>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
