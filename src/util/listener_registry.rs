use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::time::Instant;

/// Handle for deregistering a listener. Ids are unique per registry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ListenerId(u64);

pub struct RegisteredListener<L: ?Sized> {
    pub id: ListenerId,
    pub listener: Arc<L>,
    pub expires_at: Option<Instant>,
}
impl<L: ?Sized> Clone for RegisteredListener<L> {
    fn clone(&self) -> Self {
        RegisteredListener {
            id: self.id,
            listener: self.listener.clone(),
            expires_at: self.expires_at,
        }
    }
}
impl<L: ?Sized> RegisteredListener<L> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at
            .map(|expires_at| expires_at <= now)
            .unwrap_or(false)
    }
}


/// A copy-on-write list of listeners. Registering and deregistering replace the list, while
///  notification iterates over a snapshot: listeners (de)registered during a notification round
///  take effect with the next round, and notification never holds a lock.
///
/// Listeners are kept (and notified) in registration order.
pub struct ListenerRegistry<L: ?Sized> {
    listeners: ArcSwap<Vec<RegisteredListener<L>>>,
    next_id: AtomicU64,
}
impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        ListenerRegistry {
            listeners: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}
impl<L: ?Sized> Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ListenerRegistry{{len:{}}}", self.listeners.load().len())
    }
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        self.do_add(listener, None)
    }

    /// registers a listener that is removed automatically once `expiry` has passed
    pub fn add_with_expiry(&self, listener: Arc<L>, expiry: Duration) -> ListenerId {
        self.do_add(listener, Some(Instant::now() + expiry))
    }

    fn do_add(&self, listener: Arc<L>, expires_at: Option<Instant>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registered = RegisteredListener { id, listener, expires_at };

        self.listeners.rcu(|current| {
            let mut updated = Vec::clone(current);
            updated.push(registered.clone());
            updated
        });
        id
    }

    /// returns `true` if the listener was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let previous = self.listeners.rcu(|current| {
            current.iter()
                .filter(|l| l.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|l| l.id == id)
    }

    /// drops listeners whose expiry has passed, returning the number of listeners removed
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let previous = self.listeners.rcu(|current| {
            current.iter()
                .filter(|l| !l.is_expired(now))
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter()
            .filter(|l| l.is_expired(now))
            .count()
    }

    /// the listeners to notify right now, in registration order - listeners whose expiry has
    ///  passed but that were not removed yet are skipped
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        let now = Instant::now();
        self.listeners.load()
            .iter()
            .filter(|l| !l.is_expired(now))
            .map(|l| l.listener.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
