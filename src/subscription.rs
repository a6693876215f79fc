//! A cancellable periodic timer feeding the view state.
//!
//! [`Subscription`] owns a producer thread that wakes up once per period and delivers the tick's
//! [`Timestamp`] to the [`StateProjector`][crate::StateProjector] by hopping onto the main context.
//!
//! Ticks are scheduled against the start time (tick `n` is due at `start + n * period`) rather than
//! against the previous wakeup, so a late wakeup doesn't shift every following tick.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    background::{background, Background},
    sync::Mutex,
    CancelToken, Clock, MainHandle, Result, Timestamp,
};

#[derive(Debug, Default)]
struct Progress {
    active: bool,
    last_value: Option<Timestamp>,
    ticks: u64,
}

/// An owned, running timer subscription.
///
/// Stopping is explicit ([`Subscription::stop`]) or happens on drop. A stopped subscription stays
/// stopped; starting again requires a new [`Subscription`].
pub struct Subscription {
    cancel: CancelToken,
    main: MainHandle,
    progress: Arc<Mutex<Progress>>,
    /// Deliveries that reach the main context after this is cleared are dropped.
    open: Arc<AtomicBool>,
    producer: Option<Background<()>>,
}

impl Subscription {
    /// Starts delivering ticks every `period`, beginning one period from now.
    ///
    /// The producer runs under a child of `parent`, so cancelling `parent` ends the subscription
    /// too, even a detached one.
    pub fn start(
        clock: Arc<dyn Clock>,
        period: Duration,
        parent: &CancelToken,
        main: MainHandle,
    ) -> Result<Subscription> {
        let cancel = parent.child();
        let progress = Arc::new(Mutex::new(Progress {
            active: true,
            ..Progress::default()
        }));
        let open = Arc::new(AtomicBool::new(true));

        let start = clock.now();
        let guard = clock.enter();
        let producer = {
            let cancel = cancel.clone();
            let main = main.clone();
            let progress = progress.clone();
            let open = open.clone();
            background(format!("{}-timer", main.name()), move || {
                let _guard = guard.bind();
                let mut due = start;
                loop {
                    due = due + period;
                    if clock.sleep_until(due, &cancel).is_err() {
                        break;
                    }

                    let tick = due;
                    {
                        let mut progress = progress.lock();
                        progress.last_value = Some(tick);
                        progress.ticks += 1;
                    }
                    let open = open.clone();
                    let delivered = main.dispatch(move |state| {
                        if open.load(Ordering::SeqCst) {
                            log::trace!("tick {tick}");
                            state.set_last_tick(tick);
                        }
                    });
                    if delivered.is_err() {
                        log::debug!("main context is gone, ending timer subscription");
                        break;
                    }
                }
                progress.lock().active = false;
            })?
        };
        log::debug!("timer subscription started, period {period:?}");

        Ok(Subscription {
            cancel,
            main,
            progress,
            open,
            producer: Some(producer),
        })
    }

    /// Stops the subscription. Calling this again, or on a detached subscription, does nothing.
    ///
    /// When this returns, every tick produced before the call has been delivered and no further
    /// tick will be. If called from the main context itself, ticks still queued there are
    /// discarded instead.
    pub fn stop(&mut self) {
        let Some(producer) = self.producer.take() else {
            return;
        };
        self.cancel.cancel();
        producer.join();

        // The producer is gone, so the main context queue holds every remaining delivery.
        if let Err(err) = self.main.flush() {
            log::debug!("not waiting for pending ticks: {err}");
        }
        self.open.store(false, Ordering::SeqCst);

        let mut progress = self.progress.lock();
        progress.active = false;
        log::debug!("timer subscription stopped after {} ticks", progress.ticks);
    }

    /// Gives up ownership of the producer, which keeps running until its parent token is
    /// cancelled.
    pub fn detach(mut self) {
        if let Some(producer) = self.producer.take() {
            producer.detach();
        }
    }

    /// Whether ticks are still being produced.
    pub fn is_active(&self) -> bool {
        self.progress.lock().active
    }

    /// The timestamp of the last tick produced.
    pub fn last_value(&self) -> Option<Timestamp> {
        self.progress.lock().last_value
    }

    /// Number of ticks produced so far.
    pub fn ticks(&self) -> u64 {
        self.progress.lock().ticks
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.progress.lock();
        f.debug_struct("Subscription")
            .field("active", &progress.active)
            .field("last_value", &progress.last_value)
            .field("ticks", &progress.ticks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        test::{main_context, wait_until, TICK},
        ManualClock,
    };

    use super::*;

    fn at(ticks: u32) -> Timestamp {
        Timestamp::ZERO + TICK * ticks
    }

    #[test]
    fn three_ticks_then_stop() {
        let clock = ManualClock::new();
        let (main, feed) = main_context();
        let observer = feed.subscribe();

        let mut sub =
            Subscription::start(Arc::new(clock.clone()), TICK, &CancelToken::new(), main.handle())
                .unwrap();
        assert!(sub.is_active());

        clock.advance(TICK * 3);
        sub.stop();
        clock.advance(TICK * 5);
        main.flush().unwrap();

        let ticks: Vec<_> = observer.drain().iter().map(|s| s.last_tick).collect();
        assert_eq!(ticks, vec![Some(at(1)), Some(at(2)), Some(at(3))]);
        assert!(!sub.is_active());
        assert_eq!(sub.last_value(), Some(at(3)));
        assert_eq!(sub.ticks(), 3);
    }

    #[test]
    fn stop_is_idempotent() {
        let clock = ManualClock::new();
        let (main, feed) = main_context();
        let observer = feed.subscribe();
        let mut sub =
            Subscription::start(Arc::new(clock.clone()), TICK, &CancelToken::new(), main.handle())
                .unwrap();

        clock.advance(TICK);
        sub.stop();
        let after_first = observer.drain().len();
        sub.stop();
        sub.stop();
        clock.advance(TICK * 4);
        main.flush().unwrap();

        assert_eq!(after_first, 1);
        assert!(observer.drain().is_empty());
        assert_eq!(clock.participants(), 0);
    }

    #[test]
    fn stop_before_first_tick() {
        let clock = ManualClock::new();
        let (main, feed) = main_context();
        let observer = feed.subscribe();
        let mut sub =
            Subscription::start(Arc::new(clock.clone()), TICK, &CancelToken::new(), main.handle())
                .unwrap();
        sub.stop();
        clock.advance(TICK * 3);
        main.flush().unwrap();
        assert!(observer.drain().is_empty());
        assert_eq!(sub.last_value(), None);
    }

    #[test]
    fn drop_terminates_producer() {
        let clock = ManualClock::new();
        let (main, _feed) = main_context();
        let sub =
            Subscription::start(Arc::new(clock.clone()), TICK, &CancelToken::new(), main.handle())
                .unwrap();
        assert_eq!(clock.participants(), 1);
        drop(sub);
        assert_eq!(clock.participants(), 0);
    }

    #[test]
    fn detached_subscription_ends_with_parent() {
        let clock = ManualClock::new();
        let (main, feed) = main_context();
        let observer = feed.subscribe();
        let parent = CancelToken::new();
        Subscription::start(Arc::new(clock.clone()), TICK, &parent, main.handle())
            .unwrap()
            .detach();

        clock.advance(TICK * 2);
        main.flush().unwrap();
        assert_eq!(observer.drain().len(), 2);

        parent.cancel();
        wait_until(|| clock.participants() == 0);
        clock.advance(TICK * 2);
        main.flush().unwrap();
        assert!(observer.drain().is_empty());
    }

    #[test]
    fn stop_from_main_context_discards_pending_ticks() {
        let clock = ManualClock::new();
        let (main, feed) = main_context();
        let observer = feed.subscribe();
        let sub =
            Subscription::start(Arc::new(clock.clone()), TICK, &CancelToken::new(), main.handle())
                .unwrap();

        // Hold the main context busy, queue the stop behind it, and only then let the producer
        // run. Its deliveries land behind the stop and must not show up.
        let (release, wait) = crossbeam_channel::bounded::<()>(0);
        main.dispatch(move |_| {
            wait.recv().ok();
        })
        .unwrap();
        let sub = Arc::new(Mutex::new(Some(sub)));
        let s = sub.clone();
        main.dispatch(move |_| {
            if let Some(mut sub) = s.lock().take() {
                sub.stop();
            }
        })
        .unwrap();
        clock.advance(TICK * 2);
        release.send(()).unwrap();
        main.flush().unwrap();

        assert!(observer.drain().is_empty());
        assert!(sub.lock().is_none());
    }
}
