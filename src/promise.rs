//! One-shot reply slots used for awaited calls into an execution context.

use std::{mem, sync::Arc};

use crate::sync::{Condvar, Mutex};

/// Creates a connected pair of [`Promise`] and [`PromiseHandle`].
pub(crate) fn promise<T>() -> (Promise<T>, PromiseHandle<T>) {
    let inner = Arc::new(PromiseInner {
        state: Mutex::new(PromiseState::Empty),
        condvar: Condvar::new(),
    });
    (
        Promise {
            inner: inner.clone(),
            fulfilled: false,
        },
        PromiseHandle { inner },
    )
}

enum PromiseState<T> {
    Empty,
    Fulfilled(T),
    Dropped,
}

struct PromiseInner<T> {
    state: Mutex<PromiseState<T>>,
    condvar: Condvar,
}

/// The sending half: moved into a job and fulfilled by the context that runs it.
///
/// If the job is dropped without running (because its context shut down, or it panicked), the
/// [`Promise`] is dropped with it and the waiting [`PromiseHandle`] is released.
pub(crate) struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
    fulfilled: bool,
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.fulfilled {
            return;
        }

        *self.inner.state.lock() = PromiseState::Dropped;
        self.inner.condvar.notify_all();
    }
}

impl<T> Promise<T> {
    /// Fulfills the promise with a value, consuming it. Never blocks.
    pub(crate) fn fulfill(mut self, value: T) {
        *self.inner.state.lock() = PromiseState::Fulfilled(value);
        self.inner.condvar.notify_all();
        self.fulfilled = true;
    }
}

/// The receiving half, held by the caller that waits for the reply.
pub(crate) struct PromiseHandle<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> PromiseHandle<T> {
    /// Blocks until the connected [`Promise`] is fulfilled.
    ///
    /// Returns [`None`] if the [`Promise`] was dropped without a value.
    pub(crate) fn block(self) -> Option<T> {
        let mut state = self
            .inner
            .condvar
            .wait_while(self.inner.state.lock(), |state| {
                matches!(state, PromiseState::Empty)
            });
        match mem::replace(&mut *state, PromiseState::Dropped) {
            PromiseState::Fulfilled(value) => Some(value),
            PromiseState::Empty | PromiseState::Dropped => None,
        }
    }
}
