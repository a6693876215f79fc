//! A small structured concurrency core: task groups, exclusive regions and cancellable timers.
//!
//! Everything runs on owned OS threads. There is no `async` runtime: suspension points are
//! blocking sleeps on a [`Clock`] that take a [`CancelToken`], and moving work between execution
//! contexts is a message send.
//!
//! # Overview
//!
//! ## Regions
//!
//! [`Region`] moves a value onto a dedicated thread and only allows access to it through closures
//! that are sent there and run one at a time. Like every thread-owning type in this crate, it
//! enforces *structured concurrency*: dropping the [`Region`] runs the closures already queued,
//! then joins the thread, and forwards any panic to the thread doing the dropping.
//!
//! The *main context* is a region holding the [`StateProjector`], the UI-facing state. Writes to
//! it from anywhere else have to hop there first.
//!
//! ## Task groups
//!
//! [`TaskGroupRunner`] runs [`NamedOperation`]s (simulated API calls) either serially or as a
//! group of concurrent children on a [`Pool`], following a [`FailurePolicy`]. A parallel run only
//! returns once every child is done, and cancelling its [`CancelToken`] cancels all of them.
//!
//! ## Subscriptions and deferred callbacks
//!
//! [`Subscription`] is a periodic timer whose ticks are delivered to the main context until it is
//! stopped. [`DeferredScheduler`] runs a callback after a delay, holding its target either
//! strongly or weakly as requested by [`Ownership`].
//!
//! ## Sessions
//!
//! [`Session`] ties all of the above together behind [`Session::invoke`], one [`DemoKind`] per
//! button of the presentation layer, which reads the state through a [`StateFeed`].
//!
//! # Usage
//!
//! Running the serial demo with an injected failure:
//!
//! ```
//! use std::time::Duration;
//! use cooperate::{DemoKind, ErrorKind, Report, Session};
//!
//! let mut session = Session::builder()
//!     .tick(Duration::from_millis(10))
//!     .fail("first", ErrorKind::First)
//!     .build()
//!     .unwrap();
//! let mut feed = session.feed();
//!
//! match session.invoke(DemoKind::SerialCall) {
//!     Report::Group(outcome) => {
//!         assert_eq!(outcome.first_failure(), Some(&("first".to_string(), ErrorKind::First)));
//!         assert_eq!(outcome.skipped, ["second", "third"]);
//!     }
//!     other => panic!("unexpected report: {other:?}"),
//! }
//! assert!(!feed.get().loading);
//! ```
//!
//! A [`Region`] serializes access to its value, no matter how many threads use it:
//!
//! ```
//! use std::thread;
//! use cooperate::Region;
//!
//! let counter = Region::builder().name("counter").spawn(0u64).unwrap();
//!
//! let threads: Vec<_> = (0..4)
//!     .map(|_| {
//!         let counter = counter.handle();
//!         thread::spawn(move || {
//!             for _ in 0..100 {
//!                 counter.mutate(|n| *n += 1).unwrap();
//!             }
//!         })
//!     })
//!     .collect();
//! for thread in threads {
//!     thread.join().unwrap();
//! }
//!
//! assert_eq!(counter.access(|n| *n).unwrap(), 400);
//! ```

mod background;
mod cancel;
mod clock;
mod deferred;
mod drop;
mod error;
mod group;
mod operation;
mod pool;
mod projector;
mod promise;
mod region;
mod session;
mod subscription;
mod sync;
#[cfg(test)]
mod test;

pub use cancel::{CancelListener, CancelToken};
pub use clock::{Clock, ClockGuard, ManualClock, SystemClock, Timestamp};
pub use deferred::{DeferredScheduler, Ownership, Ticket, TicketStatus};
pub use error::{Error, ErrorKind, Result};
pub use group::{FailurePolicy, TaskGroupOutcome, TaskGroupRunner};
pub use operation::{Affinity, NamedOperation, OperationEvent, Outcome};
pub use pool::{Pool, PoolBuilder};
pub use projector::{projector, Disconnected, Observer, StateFeed, StateProjector, ViewState};
pub use region::{current_context, Region, RegionBuilder, RegionHandle};
pub use session::{DemoKind, Report, Session, SessionBuilder};
pub use subscription::Subscription;

/// The region owning the [`StateProjector`].
pub type MainContext = Region<StateProjector>;

/// A handle to the [`MainContext`].
pub type MainHandle = RegionHandle<StateProjector>;

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn contexts_are_send() {
        assert_send::<MainContext>();
        assert_send::<MainHandle>();
        assert_send::<Pool>();
        assert_send::<Subscription>();
        assert_send::<DeferredScheduler>();
        assert_send::<Session>();
    }

    #[test]
    fn handles_are_sync() {
        assert_sync::<MainHandle>();
        assert_sync::<CancelToken>();
        assert_sync::<StateFeed>();
        assert_sync::<Ticket>();
    }
}
