//! Exclusive regions: values owned by a dedicated thread.
//!
//! A [`Region`] moves a value onto its own thread and only lets other code touch it by sending
//! closures to that thread. The closures run one at a time, in the order they were sent, so no
//! caller can ever observe another caller's half-applied mutation. This is the "actor" of this
//! crate, without mailboxes of user-defined message types: the message *is* the closure.
//!
//! Calls come in two flavors:
//!
//! - *Awaited* calls ([`RegionHandle::access`], [`RegionHandle::mutate`],
//!   [`RegionHandle::flush`]) block the caller until the closure has run and return its result.
//! - *Hops* ([`RegionHandle::dispatch`]) only enqueue the closure and return immediately.
//!
//! Awaited calls refuse to run on a thread that is itself executing a region job and return
//! [`Error::NestedAccess`] instead. Code running inside a region talks to other regions (and to
//! itself) exclusively through hops, so two regions can never end up waiting on each other.

use std::{
    cell::RefCell,
    fmt,
    ops::Deref,
    panic::resume_unwind,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{select, Sender};

use crate::{drop::defer, promise::promise, Error, Result};

type Job<T> = Box<dyn FnOnce(&mut T) + Send>;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Name of the region whose thread this is, if any.
    static CURRENT: RefCell<Option<Arc<str>>> = const { RefCell::new(None) };
}

/// Returns a printable name for the execution context of the calling thread.
///
/// This is the region name on region threads, and the thread name (or id) elsewhere.
pub fn current_context() -> String {
    CURRENT.with(|current| match &*current.borrow() {
        Some(name) => format!("region '{name}'"),
        None => {
            let thread = thread::current();
            match thread.name() {
                Some(name) => format!("thread '{name}'"),
                None => format!("thread {:?}", thread.id()),
            }
        }
    })
}

/// A builder object that can be used to configure and spawn a [`Region`].
#[derive(Clone, Default)]
pub struct RegionBuilder {
    name: Option<String>,
}

impl RegionBuilder {
    /// Sets the name of the [`Region`] and its thread.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    /// Moves `value` onto a new region thread.
    pub fn spawn<T: Send + 'static>(self, value: T) -> Result<Region<T>> {
        let id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = match self.name {
            Some(name) => name.into(),
            None => format!("region-{id}").into(),
        };
        let (jobs, jobs_recv) = crossbeam_channel::unbounded::<Job<T>>();
        let (stop, stop_recv) = crossbeam_channel::bounded::<()>(0);

        let thread_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                log::trace!("region '{thread_name}' starting");
                let exiting = thread_name.clone();
                let _guard = defer(move || log::trace!("region '{exiting}' exiting"));
                CURRENT.with(|current| *current.borrow_mut() = Some(thread_name));

                let mut value = value;
                loop {
                    select! {
                        recv(jobs_recv) -> job => match job {
                            Ok(job) => job(&mut value),
                            Err(_) => break,
                        },
                        recv(stop_recv) -> _ => {
                            // Run what was enqueued before the owner let go, then exit.
                            for job in jobs_recv.try_iter() {
                                job(&mut value);
                            }
                            break;
                        },
                    }
                }
            })?;

        Ok(Region {
            handle: RegionHandle { name, jobs },
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

/// An owned region thread holding a value of type `T`.
///
/// This type enforces structured concurrency: when it's dropped, the jobs already queued are run,
/// the thread exits and is joined. If a job has panicked, the panic is forwarded to the thread
/// dropping the [`Region`]. [`RegionHandle`]s that outlive the [`Region`] report
/// [`Error::ContextClosed`].
///
/// [`Region`] dereferences to its [`RegionHandle`], so all calls can be made on it directly.
pub struct Region<T: Send + 'static> {
    handle: RegionHandle<T>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Region<()> {
    /// Returns a builder that can be used to configure and spawn a [`Region`].
    #[inline]
    pub fn builder() -> RegionBuilder {
        RegionBuilder::default()
    }
}

impl<T: Send + 'static> Region<T> {
    /// Returns a cloneable handle that can be passed to other threads.
    pub fn handle(&self) -> RegionHandle<T> {
        self.handle.clone()
    }
}

impl<T: Send + 'static> Deref for Region<T> {
    type Target = RegionHandle<T>;

    fn deref(&self) -> &RegionHandle<T> {
        &self.handle
    }
}

impl<T: Send + 'static> Drop for Region<T> {
    fn drop(&mut self) {
        // Disconnect the stop channel to signal the thread to exit.
        drop(self.stop.take());

        if let Some(thread) = self.thread.take() {
            if let Err(payload) = thread.join() {
                if !thread::panicking() {
                    resume_unwind(payload);
                }
            }
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Region<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.handle.name)
            .finish_non_exhaustive()
    }
}

/// A cloneable, sendable reference to a [`Region`].
pub struct RegionHandle<T> {
    name: Arc<str>,
    jobs: Sender<Job<T>>,
}

impl<T> Clone for RegionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

impl<T> fmt::Debug for RegionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> RegionHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `action` to run on the region and returns without waiting for it.
    ///
    /// This never blocks and may be called from anywhere, including from inside a region job.
    pub fn dispatch<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.jobs
            .send(Box::new(action))
            .map_err(|_| Error::ContextClosed(self.name.to_string()))
    }

    /// Runs `action` with exclusive access to the value and returns its result.
    pub fn mutate<R, F>(&self, action: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        self.check_not_nested()?;
        let (promise, handle) = promise();
        self.dispatch(move |value| promise.fulfill(action(value)))?;
        // The promise is dropped unfulfilled if the region shuts down or the action panics.
        handle
            .block()
            .ok_or_else(|| Error::ContextClosed(self.name.to_string()))
    }

    /// Runs `action` with a shared reference to the value and returns its result.
    ///
    /// This is serialized with every other call, exactly like [`RegionHandle::mutate`].
    pub fn access<R, F>(&self, action: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&T) -> R + Send + 'static,
    {
        self.mutate(move |value| action(value))
    }

    /// Blocks until every job enqueued before this call has run.
    pub fn flush(&self) -> Result<()> {
        self.mutate(|_| ())
    }

    fn check_not_nested(&self) -> Result<()> {
        CURRENT.with(|current| match &*current.borrow() {
            Some(from) => Err(Error::NestedAccess {
                from: from.to_string(),
                to: self.name.to_string(),
            }),
            None => Ok(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, AtomicUsize},
            Barrier,
        },
    };

    use super::*;

    fn silent_panic(payload: String) {
        resume_unwind(Box::new(payload));
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn concurrent_increments_are_not_lost() {
        const CALLERS: usize = 8;
        const INCREMENTS: usize = 250;

        let region = Region::builder().name("counter").spawn(0usize).unwrap();
        let barrier = Arc::new(Barrier::new(CALLERS));
        let callers: Vec<_> = (0..CALLERS)
            .map(|_| {
                let handle = region.handle();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..INCREMENTS {
                        handle.mutate(|n| *n += 1).unwrap();
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        assert_eq!(region.access(|n| *n).unwrap(), CALLERS * INCREMENTS);
    }

    #[test]
    fn actions_never_overlap() {
        let region = Region::builder().spawn(()).unwrap();
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let callers: Vec<_> = (0..4)
            .map(|_| {
                let handle = region.handle();
                let inside = inside.clone();
                let overlaps = overlaps.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let inside = inside.clone();
                        let overlaps = overlaps.clone();
                        handle
                            .mutate(move |_| {
                                if inside.swap(true, Ordering::SeqCst) {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                thread::yield_now();
                                inside.store(false, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispatch_preserves_order() {
        let region = Region::builder().spawn(Vec::new()).unwrap();
        for i in 0..100 {
            region.dispatch(move |v: &mut Vec<i32>| v.push(i)).unwrap();
        }
        let values = region.access(|v| v.clone()).unwrap();
        assert_eq!(values, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn awaited_call_from_inside_a_region_is_refused() {
        let outer = Region::builder().name("outer").spawn(()).unwrap();
        let inner = Region::builder().name("inner").spawn(0).unwrap();

        let target = inner.handle();
        let err = outer
            .mutate(move |_| target.mutate(|n| *n += 1).unwrap_err())
            .unwrap();
        match err {
            Error::NestedAccess { from, to } => {
                assert_eq!(from, "outer");
                assert_eq!(to, "inner");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Hopping works.
        let target = inner.handle();
        outer
            .mutate(move |_| target.dispatch(|n| *n += 1))
            .unwrap()
            .unwrap();
        assert_eq!(inner.access(|n| *n).unwrap(), 1);
    }

    #[test]
    fn mutual_hops_do_not_deadlock() {
        let a = Region::builder().name("a").spawn(0).unwrap();
        let b = Region::builder().name("b").spawn(0).unwrap();

        for _ in 0..10 {
            let to_b = b.handle();
            let back_to_a = a.handle();
            a.dispatch(move |n| {
                *n += 1;
                to_b.dispatch(move |m| {
                    *m += 1;
                    back_to_a.dispatch(|n| *n += 1).unwrap();
                })
                .unwrap();
            })
            .unwrap();
        }

        // Each round trip touches `b` once and `a` twice. Flush `a`, then `b`, then `a` again to
        // let every hop land.
        a.flush().unwrap();
        b.flush().unwrap();
        a.flush().unwrap();
        assert_eq!(a.access(|n| *n).unwrap(), 20);
        assert_eq!(b.access(|n| *n).unwrap(), 10);
    }

    #[test]
    fn handle_outliving_region_reports_closed() {
        let region = Region::builder().name("short-lived").spawn(0).unwrap();
        let handle = region.handle();
        drop(region);
        assert!(matches!(handle.dispatch(|_| {}), Err(Error::ContextClosed(name)) if name == "short-lived"));
        assert!(matches!(handle.flush(), Err(Error::ContextClosed(_))));
    }

    #[test]
    fn queued_jobs_run_before_shutdown() {
        let region = Region::builder().spawn(()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let ran = ran.clone();
            region
                .dispatch(move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        drop(region);
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn region_propagates_panic_on_drop() {
        let region = Region::builder().spawn(()).unwrap();
        region
            .dispatch(|_| silent_panic("region panic".into()))
            .unwrap();
        catch_unwind(AssertUnwindSafe(|| drop(region))).unwrap_err();
    }

    #[test]
    fn current_context_names_the_region() {
        let region = Region::builder().name("named").spawn(()).unwrap();
        assert_eq!(region.access(|_| current_context()).unwrap(), "region 'named'");
        assert!(current_context().starts_with("thread"));
    }

    #[test]
    fn region_is_send() {
        assert_send::<Region<()>>();
        assert_send::<RegionHandle<()>>();
    }
}
