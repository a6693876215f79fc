//! Deferred callbacks with explicit ownership of their target.
//!
//! [`DeferredScheduler::schedule`] runs a payload against an owner object after a delay. Whether
//! the pending callback keeps that owner alive is not left to whatever the closure happens to
//! capture; it is chosen with [`Ownership`]:
//!
//! - [`Ownership::Weak`]: the ticket only holds a [`Weak`] reference. If every other [`Arc`] to the
//!   owner is gone by the time the ticket fires, the payload is skipped.
//! - [`Ownership::Strong`]: the ticket holds an [`Arc`]. The owner stays alive until the payload
//!   has run, even if everybody else has let go of it. If the owner in turn (directly or not)
//!   owns the scheduler, dropping it has to wait for the ticket to fire.
//!
//! Tickets fire on their own threads, which the scheduler owns: dropping the scheduler cancels the
//! pending weak tickets and waits for the pending strong ones.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use crate::{
    background::{background, Background},
    region::current_context,
    sync::Mutex,
    CancelToken, Clock, Result, Timestamp,
};

/// Whether a pending deferred callback keeps its owner alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    Strong,
    #[default]
    Weak,
}

/// Lifecycle of a [`Ticket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Pending,
    /// The payload ran.
    Fired,
    /// The ticket came due, but its weakly held owner was already gone.
    Skipped,
    /// The ticket was cancelled before it came due.
    Cancelled,
}

/// A handle to a scheduled callback.
#[derive(Clone)]
pub struct Ticket {
    id: u64,
    scheduled_at: Timestamp,
    fire_at: Timestamp,
    ownership: Ownership,
    status: Arc<Mutex<TicketStatus>>,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scheduled_at(&self) -> Timestamp {
        self.scheduled_at
    }

    pub fn fire_at(&self) -> Timestamp {
        self.fire_at
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn status(&self) -> TicketStatus {
        *self.status.lock()
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("scheduled_at", &self.scheduled_at)
            .field("fire_at", &self.fire_at)
            .field("ownership", &self.ownership)
            .field("status", &self.status())
            .finish()
    }
}

enum Capture<O> {
    Strong(Arc<O>),
    Weak(Weak<O>),
}

impl<O> Capture<O> {
    fn upgrade(&self) -> Option<Arc<O>> {
        match self {
            Capture::Strong(owner) => Some(owner.clone()),
            Capture::Weak(owner) => owner.upgrade(),
        }
    }
}

struct Pending {
    ticket: Ticket,
    cancel: CancelToken,
    thread: Background<()>,
}

/// Schedules and owns deferred callbacks. See the [module docs](self).
pub struct DeferredScheduler {
    name: String,
    clock: Arc<dyn Clock>,
    pending: Vec<Pending>,
    next_id: u64,
}

impl DeferredScheduler {
    pub fn new<N: Into<String>>(name: N, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            pending: Vec::new(),
            next_id: 0,
        }
    }

    /// Runs `payload` with `owner` once `delay` has elapsed.
    pub fn schedule<O, F>(
        &mut self,
        owner: &Arc<O>,
        delay: Duration,
        ownership: Ownership,
        payload: F,
    ) -> Result<Ticket>
    where
        O: Send + Sync + 'static,
        F: FnOnce(&O) + Send + 'static,
    {
        self.reap();

        let id = self.next_id;
        self.next_id += 1;
        let scheduled_at = self.clock.now();
        let ticket = Ticket {
            id,
            scheduled_at,
            fire_at: scheduled_at + delay,
            ownership,
            status: Arc::new(Mutex::new(TicketStatus::Pending)),
        };
        let capture = match ownership {
            Ownership::Strong => Capture::Strong(owner.clone()),
            Ownership::Weak => Capture::Weak(Arc::downgrade(owner)),
        };

        let cancel = CancelToken::new();
        let guard = self.clock.enter();
        let thread = {
            let clock = self.clock.clone();
            let cancel = cancel.clone();
            let fire_at = ticket.fire_at;
            let status = ticket.status.clone();
            background(format!("{}-{id}", self.name), move || {
                let guard = guard.bind();
                let outcome = match clock.sleep_until(fire_at, &cancel) {
                    Err(_) => TicketStatus::Cancelled,
                    Ok(()) => match capture.upgrade() {
                        Some(owner) => {
                            log::debug!("deferred #{id} firing on {}", current_context());
                            payload(&owner);
                            TicketStatus::Fired
                        }
                        None => {
                            log::debug!("deferred #{id} skipped, owner is gone");
                            TicketStatus::Skipped
                        }
                    },
                };
                // Release the owner before reporting, so a finished ticket never retains it.
                drop(capture);
                *status.lock() = outcome;
                drop(guard);
            })?
        };
        log::debug!("deferred #{id} scheduled for {} ({ownership:?})", ticket.fire_at);

        self.pending.push(Pending {
            ticket: ticket.clone(),
            cancel,
            thread,
        });
        Ok(ticket)
    }

    /// Cancels `ticket` if it has not fired yet, and waits for its thread to exit.
    pub fn cancel(&mut self, ticket: &Ticket) {
        self.reap();
        if let Some(index) = self.pending.iter().position(|p| p.ticket.id == ticket.id) {
            let pending = self.pending.swap_remove(index);
            pending.cancel.cancel();
            pending.thread.join();
        }
    }

    /// Returns the number of tickets whose thread is still running, forgetting the others.
    pub fn pending(&mut self) -> usize {
        self.reap();
        self.pending.len()
    }

    /// Joins the threads of tickets that are done.
    fn reap(&mut self) {
        self.pending.retain(|p| !p.thread.is_finished());
    }
}

impl Drop for DeferredScheduler {
    fn drop(&mut self) {
        for pending in &self.pending {
            if pending.ticket.ownership == Ownership::Weak {
                pending.cancel.cancel();
            }
        }
        // Dropping the threads joins them; strong tickets run until they fire.
        self.pending.clear();
    }
}

impl fmt::Debug for DeferredScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredScheduler")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{
        test::{wait_until, TICK},
        ManualClock,
    };

    use super::*;

    #[derive(Default)]
    struct Owner {
        hits: AtomicUsize,
    }

    fn scheduler() -> (DeferredScheduler, ManualClock) {
        let clock = ManualClock::new();
        (
            DeferredScheduler::new("deferred", Arc::new(clock.clone())),
            clock,
        )
    }

    fn hit(owner: &Owner) {
        owner.hits.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn weak_ticket_fires_while_owner_lives() {
        let (mut scheduler, clock) = scheduler();
        let owner = Arc::new(Owner::default());
        let ticket = scheduler
            .schedule(&owner, TICK * 2, Ownership::Weak, hit)
            .unwrap();
        assert_eq!(ticket.fire_at(), Timestamp::ZERO + TICK * 2);
        assert_eq!(Arc::strong_count(&owner), 1);

        clock.advance(TICK);
        assert_eq!(ticket.status(), TicketStatus::Pending);
        clock.advance(TICK);
        assert_eq!(ticket.status(), TicketStatus::Fired);
        assert_eq!(owner.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn weak_ticket_is_a_no_op_once_owner_is_gone() {
        let (mut scheduler, clock) = scheduler();
        let owner = Arc::new(Owner::default());
        let observed = Arc::new(AtomicUsize::new(0));
        let o = observed.clone();
        let ticket = scheduler
            .schedule(&owner, TICK, Ownership::Weak, move |_: &Owner| {
                o.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let weak = Arc::downgrade(&owner);
        drop(owner);
        // Nothing keeps the owner alive.
        assert!(weak.upgrade().is_none());

        clock.advance(TICK);
        assert_eq!(ticket.status(), TicketStatus::Skipped);
        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn strong_ticket_retains_owner_until_it_fires() {
        let (mut scheduler, clock) = scheduler();
        let owner = Arc::new(Owner::default());
        let ticket = scheduler
            .schedule(&owner, TICK, Ownership::Strong, hit)
            .unwrap();

        let weak = Arc::downgrade(&owner);
        drop(owner);
        // The pending ticket is keeping the owner alive.
        let retained = weak.upgrade().expect("owner should be retained");
        assert_eq!(retained.hits.load(Ordering::SeqCst), 0);
        drop(retained);

        clock.advance(TICK);
        assert_eq!(ticket.status(), TicketStatus::Fired);
        // Released after firing.
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn cancelled_ticket_never_fires() {
        let (mut scheduler, clock) = scheduler();
        let owner = Arc::new(Owner::default());
        let ticket = scheduler
            .schedule(&owner, TICK, Ownership::Strong, hit)
            .unwrap();
        scheduler.cancel(&ticket);
        assert_eq!(ticket.status(), TicketStatus::Cancelled);
        assert_eq!(Arc::strong_count(&owner), 1);

        clock.advance(TICK * 2);
        assert_eq!(owner.hits.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn drop_cancels_weak_tickets() {
        let (mut scheduler, clock) = scheduler();
        let owner = Arc::new(Owner::default());
        let ticket = scheduler
            .schedule(&owner, TICK, Ownership::Weak, hit)
            .unwrap();
        drop(scheduler);
        assert_eq!(ticket.status(), TicketStatus::Cancelled);
        assert_eq!(clock.participants(), 0);
    }

    #[test]
    fn drop_waits_for_strong_tickets() {
        let (mut scheduler, clock) = scheduler();
        let owner = Arc::new(Owner::default());
        let ticket = scheduler
            .schedule(&owner, TICK, Ownership::Strong, hit)
            .unwrap();

        let driver = {
            let clock = clock.clone();
            std::thread::spawn(move || {
                // The scheduler is blocked in drop until the ticket comes due.
                while clock.participants() == 0 {
                    std::thread::yield_now();
                }
                clock.advance(TICK);
            })
        };
        drop(scheduler);
        driver.join().unwrap();

        assert_eq!(ticket.status(), TicketStatus::Fired);
        assert_eq!(owner.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finished_tickets_are_reaped() {
        let (mut scheduler, clock) = scheduler();
        let owner = Arc::new(Owner::default());
        for _ in 0..3 {
            scheduler
                .schedule(&owner, TICK, Ownership::Weak, hit)
                .unwrap();
        }
        assert_eq!(scheduler.pending(), 3);
        clock.advance(TICK);
        assert_eq!(owner.hits.load(Ordering::SeqCst), 3);

        // No further `schedule` call is needed to forget them.
        wait_until(|| scheduler.pending() == 0);
        assert!(scheduler.pending.is_empty());
    }

    #[test]
    fn cancel_reaps_finished_tickets() {
        let (mut scheduler, clock) = scheduler();
        let owner = Arc::new(Owner::default());
        let fired = scheduler
            .schedule(&owner, TICK, Ownership::Weak, hit)
            .unwrap();
        let late = scheduler
            .schedule(&owner, TICK * 5, Ownership::Weak, hit)
            .unwrap();
        clock.advance(TICK);
        assert_eq!(fired.status(), TicketStatus::Fired);
        wait_until(|| scheduler.pending.iter().any(|p| p.thread.is_finished()));

        scheduler.cancel(&late);
        assert_eq!(late.status(), TicketStatus::Cancelled);
        assert!(scheduler.pending.is_empty());
    }
}
