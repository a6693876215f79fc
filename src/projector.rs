//! The UI-facing state and its read-only feed.
//!
//! [`StateProjector`] is the writing half. It is moved into the main context (a
//! [`Region`][crate::Region]) when the session is built, so the only way to write to it is a job
//! on that context: writes from any other thread have to be marshalled there first.
//!
//! [`StateFeed`] is the reading half handed to the presentation layer. It supports two styles of
//! consumption:
//!
//! - *Polling*, via [`StateFeed::get`], [`StateFeed::is_changed`] and [`StateFeed::block`]. Like a
//!   watch channel, a polling reader only sees the latest state and may skip intermediate ones.
//!   That is the renderer throttling itself.
//! - *Observing*, via [`StateFeed::subscribe`]. Every [`Observer`] receives one snapshot per write,
//!   in the order the writes were issued. The projector never coalesces.

use std::{fmt, sync::Arc};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    sync::{Condvar, Mutex},
    Timestamp,
};

/// A snapshot of the state shown by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewState {
    /// Whether a progress indicator should be shown.
    pub loading: bool,
    /// The most recent value delivered by the timer subscription.
    pub last_tick: Option<Timestamp>,
    /// How many deferred callbacks have fired.
    pub deferred_fires: u32,
}

struct Inner {
    state: ViewState,
    /// Incremented on every write.
    generation: u64,
    /// Set when the [`StateProjector`] is dropped.
    disconnected: bool,
    observers: Vec<Sender<ViewState>>,
}

struct Shared {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

/// The writing half of the view state. See the [module docs](self).
pub struct StateProjector {
    shared: Arc<Shared>,
}

/// Creates a connected [`StateProjector`] and [`StateFeed`], starting from the default state.
pub fn projector() -> (StateProjector, StateFeed) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            state: ViewState::default(),
            generation: 0,
            disconnected: false,
            observers: Vec::new(),
        }),
        condvar: Condvar::new(),
    });
    (
        StateProjector {
            shared: shared.clone(),
        },
        StateFeed {
            shared,
            read_gen: 0,
        },
    )
}

impl StateProjector {
    pub fn set_loading(&mut self, loading: bool) {
        self.write(|state| state.loading = loading);
    }

    pub fn set_last_tick(&mut self, tick: Timestamp) {
        self.write(|state| state.last_tick = Some(tick));
    }

    pub fn record_deferred_fire(&mut self) {
        self.write(|state| state.deferred_fires += 1);
    }

    pub fn state(&self) -> ViewState {
        self.shared.inner.lock().state
    }

    /// Applies one write. Every write counts, even if it leaves the state unchanged.
    fn write(&mut self, f: impl FnOnce(&mut ViewState)) {
        let mut inner = self.shared.inner.lock();
        f(&mut inner.state);
        inner.generation += 1;
        let snapshot = inner.state;
        inner
            .observers
            .retain(|observer| observer.send(snapshot).is_ok());
        drop(inner);
        self.shared.condvar.notify_all();
    }
}

impl Drop for StateProjector {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.disconnected = true;
        // Disconnects every observer once it has drained its queue.
        inner.observers.clear();
        drop(inner);
        self.shared.condvar.notify_all();
    }
}

impl fmt::Debug for StateProjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateProjector").field(&self.state()).finish()
    }
}

/// An error returned by [`StateFeed`] when the [`StateProjector`] has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// The read-only half of the view state. See the [module docs](self).
pub struct StateFeed {
    shared: Arc<Shared>,
    read_gen: u64,
}

impl Clone for StateFeed {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            read_gen: self.read_gen,
        }
    }
}

impl StateFeed {
    /// Returns the current state and marks it as seen.
    ///
    /// This keeps working after the projector is gone, returning the last state written.
    pub fn get(&mut self) -> ViewState {
        let inner = self.shared.inner.lock();
        self.read_gen = inner.generation;
        inner.state
    }

    /// Returns whether a write happened that this feed hasn't seen via [`StateFeed::get`] or
    /// [`StateFeed::block`] yet.
    pub fn is_changed(&self) -> bool {
        self.shared.inner.lock().generation != self.read_gen
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.inner.lock().disconnected
    }

    /// Blocks until there is an unseen write, and returns the state after the latest one.
    ///
    /// Returns [`Disconnected`] once the projector is gone and all writes have been seen.
    pub fn block(&mut self) -> Result<ViewState, Disconnected> {
        let read_gen = self.read_gen;
        let inner = self
            .shared
            .condvar
            .wait_while(self.shared.inner.lock(), |inner| {
                inner.generation == read_gen && !inner.disconnected
            });
        if inner.generation != read_gen {
            self.read_gen = inner.generation;
            Ok(inner.state)
        } else {
            Err(Disconnected)
        }
    }

    /// Registers an [`Observer`] that receives every subsequent write.
    pub fn subscribe(&self) -> Observer {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut inner = self.shared.inner.lock();
        if !inner.disconnected {
            inner.observers.push(sender);
        }
        Observer { receiver }
    }
}

impl fmt::Debug for StateFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateFeed")
            .field("read_gen", &self.read_gen)
            .finish_non_exhaustive()
    }
}

/// Receives one [`ViewState`] snapshot per write, in issue order.
///
/// Iterating an [`Observer`] blocks for each write and ends when the projector is dropped.
#[derive(Debug)]
pub struct Observer {
    receiver: Receiver<ViewState>,
}

impl Observer {
    /// Returns the snapshots received so far without blocking.
    pub fn drain(&self) -> Vec<ViewState> {
        self.receiver.try_iter().collect()
    }

    /// Blocks for the next write.
    pub fn recv(&self) -> Option<ViewState> {
        self.receiver.recv().ok()
    }
}

impl IntoIterator for Observer {
    type Item = ViewState;
    type IntoIter = crossbeam_channel::IntoIter<ViewState>;

    fn into_iter(self) -> Self::IntoIter {
        self.receiver.into_iter()
    }
}
