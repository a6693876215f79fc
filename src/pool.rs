//! The background worker pool.

use std::{
    fmt,
    panic::{self, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::Sender;

use crate::{drop::defer, Error, Result};

type Job = Box<dyn FnOnce() + Send>;

/// A builder object that can be used to configure and spawn a [`Pool`].
pub struct PoolBuilder {
    name: String,
}

impl PoolBuilder {
    /// Sets the base name of the [`Pool`] threads.
    ///
    /// Each thread spawned will be named according to this base name and its index.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self { name: name.into() }
    }

    /// Spawns a [`Pool`] of `count` worker threads.
    ///
    /// # Panics
    ///
    /// This method will panic if `count` is 0.
    pub fn spawn(self, count: usize) -> Result<Pool> {
        assert_ne!(count, 0, "count must be at least 1");

        let panic_flag = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);
        let (sender, recv) = crossbeam_channel::unbounded::<Job>();
        for i in 0..count {
            let thread_name = format!("{}-{i}", self.name);
            let recv = recv.clone();
            let panic_flag = panic_flag.clone();
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    log::trace!("pool worker '{thread_name}' starting");
                    let _guard = defer(move || log::trace!("pool worker '{thread_name}' exiting"));
                    let res = panic::catch_unwind(AssertUnwindSafe(|| {
                        for job in recv {
                            job();
                        }
                    }));
                    if let Err(payload) = res {
                        panic_flag.store(true, Ordering::Relaxed);
                        resume_unwind(payload);
                    }
                })?;
            handles.push(handle);
        }

        Ok(Pool {
            name: self.name,
            sender: Some(sender),
            handles,
            panic_flag,
        })
    }
}

/// An owned set of worker threads running background jobs.
///
/// Jobs are queued without bound, so [`Pool::spawn`] never blocks the caller; they are picked up
/// by whichever worker becomes idle first. Jobs are expected to be cooperative: they sleep on a
/// [`Clock`][crate::Clock] with a [`CancelToken`][crate::CancelToken] and never wait for another
/// pool job.
///
/// When the [`Pool`] is dropped, the queued jobs are drained and the threads are joined. If a job
/// panicked, the panic is propagated to the owner at that point.
pub struct Pool {
    name: String,
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    /// Set to `true` when any thread panics.
    panic_flag: Arc<AtomicBool>,
}

impl Pool {
    /// Returns a builder that can be used to configure and spawn a [`Pool`].
    #[inline]
    pub fn builder() -> PoolBuilder {
        PoolBuilder {
            name: "pool".into(),
        }
    }

    /// Returns the number of worker threads.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Queues `job` to run on one of the workers.
    ///
    /// Fails with [`Error::ContextClosed`] once a worker has panicked; the panic itself is
    /// propagated when the [`Pool`] is dropped.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.panic_flag.load(Ordering::Relaxed) {
            return Err(Error::ContextClosed(self.name.clone()));
        }
        match &self.sender {
            Some(sender) => sender
                .send(Box::new(job))
                .map_err(|_| Error::ContextClosed(self.name.clone())),
            None => Err(Error::ContextClosed(self.name.clone())),
        }
    }

    fn wait_for_exit(&mut self) {
        let mut payload = None;
        for handle in self.handles.drain(..) {
            if let Err(pl) = handle.join() {
                payload = Some(pl);
            }
        }
        if let Some(payload) = payload {
            if !thread::panicking() {
                resume_unwind(payload);
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Close the channel to signal the threads to exit once the queue is empty.
        drop(self.sender.take());

        self.wait_for_exit();
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("size", &self.handles.len())
            .finish_non_exhaustive()
    }
}
