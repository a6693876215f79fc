use std::{
    panic::resume_unwind,
    thread::{self, JoinHandle},
};

use crate::{drop::defer, Result};

/// A named, owned, run-to-completion thread.
///
/// Calling [`Background::join`] or dropping a [`Background`] object will join the thread. If the
/// thread panicked, the panic will be propagated to the owner. [`Background::detach`] gives up
/// ownership instead, letting the thread run on by itself.
pub(crate) struct Background<R> {
    handle: Option<JoinHandle<R>>,
}

impl<R> Drop for Background<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                if !thread::panicking() {
                    resume_unwind(payload);
                }
            }
        }
    }
}

impl<R> Background<R> {
    /// Blocks on the background thread and returns its result.
    ///
    /// If the thread panics, the panic will be propagated to the owner.
    pub(crate) fn join(mut self) -> Option<R> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(r) => Some(r),
            Err(payload) => resume_unwind(payload),
        }
    }

    /// Returns whether the thread has finished, so that joining it would not block.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Lets the thread run unowned. It is no longer joined, and its panics are not propagated.
    pub(crate) fn detach(mut self) {
        drop(self.handle.take());
    }
}

/// Spawns a named run-to-completion [`Background`] thread.
pub(crate) fn background<R, F>(name: String, f: F) -> Result<Background<R>>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        log::trace!("'{name}' starting");
        let _guard = defer(move || log::trace!("'{name}' exiting"));
        f()
    })?;
    Ok(Background {
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    use super::*;

    #[test]
    fn join_returns_result() {
        let bg = background("adder".into(), || 1 + 1).unwrap();
        assert_eq!(bg.join(), Some(2));
    }

    #[test]
    fn drop_joins() {
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        let bg = background("sleeper".into(), move || {
            thread::sleep(std::time::Duration::from_millis(10));
            d.store(true, Ordering::SeqCst);
        })
        .unwrap();
        drop(bg);
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn panic_propagates_on_join() {
        let bg = background("panicker".into(), || -> i32 {
            resume_unwind(Box::new("background panic"))
        })
        .unwrap();
        catch_unwind(AssertUnwindSafe(|| bg.join())).unwrap_err();
    }

    #[test]
    fn detached_thread_is_finished_eventually() {
        let bg = background("parked".into(), || ()).unwrap();
        while !bg.is_finished() {
            thread::yield_now();
        }
        bg.detach();
    }
}
