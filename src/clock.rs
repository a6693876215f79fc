//! Time sources.
//!
//! Every simulated delay in this crate goes through a [`Clock`], so that the same code can run in
//! real time ([`SystemClock`]) or on a virtual timeline that tests drive by hand
//! ([`ManualClock`]).

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    ops::Add,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    drop::{defer_boxed, BoxedDefer},
    sync::{Condvar, Mutex},
    CancelToken, Result,
};

/// A point in time, measured from the origin of the [`Clock`] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    #[inline]
    pub const fn from_duration(since_origin: Duration) -> Self {
        Self(since_origin)
    }

    #[inline]
    pub const fn since_origin(self) -> Duration {
        self.0
    }

    /// Returns the time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0.as_secs_f64())
    }
}

thread_local! {
    /// Virtual clocks this thread holds a bound [`ClockGuard`] for.
    static BOUND: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn is_bound(key: usize) -> bool {
    BOUND.with(|bound| bound.borrow().contains(&key))
}

/// Registration of a thread that is driven by a [`Clock`].
///
/// Returned by [`Clock::enter`]. The thread the registration stands for has to claim it with
/// [`ClockGuard::bind`]; only sleeps of bound threads count as progress of a participant. The
/// registration ends when the guard is dropped.
#[must_use = "dropping a `ClockGuard` ends the registration immediately"]
pub struct ClockGuard {
    key: Option<usize>,
    bound: bool,
    _release: Option<BoxedDefer>,
}

impl ClockGuard {
    /// A guard that does not track anything.
    pub fn untracked() -> Self {
        Self {
            key: None,
            bound: false,
            _release: None,
        }
    }

    /// Marks the calling thread as the participant this guard registered.
    ///
    /// The guard must then be dropped on the same thread.
    pub fn bind(mut self) -> Self {
        if let (Some(key), false) = (self.key, self.bound) {
            BOUND.with(|bound| bound.borrow_mut().push(key));
            self.bound = true;
        }
        self
    }
}

impl Drop for ClockGuard {
    fn drop(&mut self) {
        if let (Some(key), true) = (self.key, self.bound) {
            BOUND.with(|bound| {
                let mut bound = bound.borrow_mut();
                if let Some(pos) = bound.iter().position(|k| *k == key) {
                    bound.swap_remove(pos);
                }
            });
        }
    }
}

/// A source of [`Timestamp`]s that threads can sleep on.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;

    /// Blocks the calling thread until `deadline`.
    ///
    /// Returns [`Error::Cancelled`][crate::Error::Cancelled] as soon as `cancel` is cancelled,
    /// and also when the deadline is reached but `cancel` has been cancelled in the meantime.
    fn sleep_until(&self, deadline: Timestamp, cancel: &CancelToken) -> Result<()>;

    /// Registers a thread whose progress is driven by this clock.
    ///
    /// Virtual clocks use this to know when all participants have caught up with the current
    /// time. The guard should be created *before* the participant thread is spawned, moved into
    /// it and bound there with [`ClockGuard::bind`]. Real-time clocks don't need to track
    /// anything.
    fn enter(&self) -> ClockGuard {
        ClockGuard::untracked()
    }

    /// Sleeps for `dur`, starting now. See [`Clock::sleep_until`].
    fn sleep(&self, dur: Duration, cancel: &CancelToken) -> Result<()> {
        self.sleep_until(self.now() + dur, cancel)
    }
}

/// A [`Clock`] following wall-clock time, with its origin at construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.origin.elapsed())
    }

    fn sleep_until(&self, deadline: Timestamp, cancel: &CancelToken) -> Result<()> {
        loop {
            cancel.check()?;
            let now = self.now();
            if now >= deadline {
                return Ok(());
            }
            cancel.sleep(deadline.saturating_duration_since(now))?;
        }
    }
}

struct ManualState {
    now: Timestamp,
    /// Number of live [`ClockGuard`]s.
    participants: usize,
    /// Threads currently blocked in `sleep_until`, with their deadline and whether they are a
    /// bound participant.
    parked: BTreeMap<u64, (Timestamp, bool)>,
    next_id: u64,
}

impl ManualState {
    /// All participants are parked on a deadline that lies in the future.
    ///
    /// Sleepers that never entered the clock are not waited for, and don't stand in for a
    /// participant that is still busy.
    fn is_quiescent(&self) -> bool {
        let mut parked = 0;
        for (deadline, participant) in self.parked.values() {
            if *participant {
                if *deadline <= self.now {
                    return false;
                }
                parked += 1;
            }
        }
        parked >= self.participants
    }
}

struct ManualShared {
    state: Mutex<ManualState>,
    condvar: Condvar,
}

/// A virtual [`Clock`] that only moves when [`ManualClock::advance`] is called.
///
/// Cloning a [`ManualClock`] yields another handle to the same timeline.
#[derive(Clone)]
pub struct ManualClock {
    shared: Arc<ManualShared>,
}

impl ManualClock {
    /// Creates a clock standing at [`Timestamp::ZERO`].
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ManualShared {
                state: Mutex::new(ManualState {
                    now: Timestamp::ZERO,
                    participants: 0,
                    parked: BTreeMap::new(),
                    next_id: 0,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Moves the clock forward by `dur` and blocks until the timeline is quiescent again.
    ///
    /// Quiescent means that every thread registered via [`Clock::enter`] is either gone or
    /// sleeping on a deadline after the new time. Sleepers whose deadline was passed have therefore
    /// woken up, done their work and gone back to sleep (or exited) when this returns.
    ///
    /// A participant that blocks on something other than this clock will make `advance` wait for
    /// it as well.
    pub fn advance(&self, dur: Duration) {
        let mut state = self.shared.state.lock();
        state.now = state.now + dur;
        log::trace!("manual clock advanced to {}", state.now);
        self.shared.condvar.notify_all();
        drop(
            self.shared
                .condvar
                .wait_while(state, |state| !state.is_quiescent()),
        );
    }

    /// Returns the number of live participants.
    pub fn participants(&self) -> usize {
        self.shared.state.lock().participants
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("participants", &state.participants)
            .field("parked", &state.parked.len())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.shared.state.lock().now
    }

    fn sleep_until(&self, deadline: Timestamp, cancel: &CancelToken) -> Result<()> {
        let shared = self.shared.clone();
        let _listener = cancel.on_cancel(move || {
            // Taking the lock orders the notification after the sleeper's check.
            let _state = shared.state.lock();
            shared.condvar.notify_all();
        });

        let mut state = self.shared.state.lock();
        if deadline <= state.now {
            drop(state);
            return cancel.check();
        }

        let id = state.next_id;
        state.next_id += 1;
        state.parked.insert(id, (deadline, is_bound(self.key())));
        // `advance` may be waiting for us to park.
        self.shared.condvar.notify_all();

        let mut state = self
            .shared
            .condvar
            .wait_while(state, |state| state.now < deadline && !cancel.is_cancelled());
        state.parked.remove(&id);
        self.shared.condvar.notify_all();
        drop(state);

        cancel.check()
    }

    fn enter(&self) -> ClockGuard {
        self.shared.state.lock().participants += 1;
        let shared = self.shared.clone();
        ClockGuard {
            key: Some(self.key()),
            bound: false,
            _release: Some(defer_boxed(move || {
                shared.state.lock().participants -= 1;
                shared.condvar.notify_all();
            })),
        }
    }
}
