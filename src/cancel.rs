//! Cooperative cancellation.
//!
//! A [`CancelToken`] is passed through every suspension point of the crate (clock sleeps, hops,
//! subscription ticks). Work checks the token before resuming and unwinds with
//! [`Error::Cancelled`] once it is set.
//!
//! Tokens form a tree: [`CancelToken::child`] creates a token that is cancelled whenever its
//! parent is, but can also be cancelled on its own without affecting the parent. A task group
//! scope, a timer subscription and every background step of a session are children of the
//! session's root token.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use crate::{
    sync::{Condvar, Mutex},
    Error, Result,
};

type Listener = Box<dyn FnOnce() + Send>;

struct State {
    cancelled: bool,
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

struct Inner {
    state: Mutex<State>,
    /// Notified on cancellation, for threads sleeping in [`CancelToken::sleep`].
    condvar: Condvar,
    /// Registration in the parent token, removed when this token goes away.
    parent: Option<(Arc<Inner>, u64)>,
}

impl Inner {
    fn cancel(&self) {
        let listeners = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.listeners)
        };
        self.condvar.notify_all();

        // Listeners may lock other things (a clock, a child token), so they run unlocked.
        for (_, listener) in listeners {
            listener();
        }
    }

    fn register(&self, listener: Listener) -> Option<u64> {
        let mut state = self.state.lock();
        if state.cancelled {
            drop(state);
            listener();
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, listener));
        Some(id)
    }

    fn unregister(&self, id: u64) {
        self.state.lock().listeners.retain(|(i, _)| *i != id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some((parent, id)) = self.parent.take() {
            parent.unregister(id);
        }
    }
}

/// A shareable cancellation flag with parent/child propagation.
///
/// Cloning a [`CancelToken`] yields a handle to the *same* flag.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a new root token.
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<(Arc<Inner>, u64)>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    cancelled: false,
                    next_id: 0,
                    listeners: Vec::new(),
                }),
                condvar: Condvar::new(),
                parent,
            }),
        }
    }

    /// Creates a child token.
    ///
    /// The child is cancelled when `self` is cancelled (including when `self` already is).
    /// Cancelling the child does not affect `self`.
    pub fn child(&self) -> CancelToken {
        // The parent only holds a weak reference, so dropping the child releases it.
        let slot: Arc<Mutex<Weak<Inner>>> = Arc::new(Mutex::new(Weak::new()));
        let listener_slot = slot.clone();
        let id = self.inner.register(Box::new(move || {
            let child = listener_slot.lock().upgrade();
            if let Some(child) = child {
                child.cancel();
            }
        }));

        match id {
            Some(id) => {
                let child = Self::with_parent(Some((self.inner.clone(), id)));
                *slot.lock() = Arc::downgrade(&child.inner);
                // The parent may have been cancelled between registration and now.
                if self.is_cancelled() {
                    child.cancel();
                }
                child
            }
            None => {
                let child = Self::new();
                child.cancel();
                child
            }
        }
    }

    /// Sets the flag and wakes everything waiting on it. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// Returns [`Error::Cancelled`] if the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs `f` once when the token is cancelled.
    ///
    /// If the token is already cancelled, `f` runs immediately on the calling thread. Dropping the
    /// returned [`CancelListener`] unregisters `f` if it has not run yet.
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) -> CancelListener {
        CancelListener {
            id: self.inner.register(Box::new(f)),
            token: Arc::downgrade(&self.inner),
        }
    }

    /// Blocks for up to `dur`, returning early with [`Error::Cancelled`] if the token is cancelled.
    pub(crate) fn sleep(&self, dur: Duration) -> Result<()> {
        let guard = self.inner.state.lock();
        let (guard, _) = self
            .inner
            .condvar
            .wait_timeout_while(guard, dur, |state| !state.cancelled);
        if guard.cancelled {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Registration returned by [`CancelToken::on_cancel`].
#[must_use = "dropping a `CancelListener` unregisters the callback"]
pub struct CancelListener {
    id: Option<u64>,
    token: Weak<Inner>,
}

impl Drop for CancelListener {
    fn drop(&mut self) {
        if let (Some(id), Some(token)) = (self.id, self.token.upgrade()) {
            token.unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Instant,
    };

    use super::*;

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _listener = token.on_cancel(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert!(token.check().is_ok());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.check().unwrap_err().is_cancelled());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn parent_cancels_children() {
        let root = CancelToken::new();
        let scope = root.child();
        let leaf = scope.child();
        root.cancel();
        assert!(scope.is_cancelled());
        assert!(leaf.is_cancelled());
    }

    #[test]
    fn child_does_not_cancel_parent() {
        let root = CancelToken::new();
        let scope = root.child();
        scope.cancel();
        assert!(!root.is_cancelled());
        assert!(scope.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let root = CancelToken::new();
        root.cancel();
        assert!(root.child().is_cancelled());
    }

    #[test]
    fn dropped_children_unregister() {
        let root = CancelToken::new();
        for _ in 0..100 {
            drop(root.child());
        }
        assert!(root.inner.state.lock().listeners.is_empty());
    }

    #[test]
    fn dropped_listener_never_runs() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        drop(token.on_cancel(move || {
            h.fetch_add(1, Ordering::Relaxed);
        }));
        token.cancel();
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn cancel_wakes_sleeper() {
        let token = CancelToken::new();
        let t = token.clone();
        let start = Instant::now();
        let sleeper = thread::spawn(move || t.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(sleeper.join().unwrap().unwrap_err().is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn sleep_elapses() {
        let token = CancelToken::new();
        token.sleep(Duration::from_millis(5)).unwrap();
    }
}
