//! The entry point of the presentation layer.
//!
//! A [`Session`] owns every execution context the demos need: the main context holding the
//! [`StateProjector`][crate::StateProjector], a second region holding a flag, the worker pool,
//! the timer subscription and the deferred scheduler. The presentation shell calls
//! [`Session::invoke`] for each button press and renders whatever the [`StateFeed`] reports.
//!
//! Dropping the session tears everything down in a fixed order: pending deferred callbacks
//! first (strongly owned ones are waited for), then the subscription and all background work
//! (cancelled), and the main context last, so that every write already in flight still lands.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use crossbeam_channel::Sender;

use crate::{
    projector, region::current_context, CancelToken, Clock, DeferredScheduler, Error, ErrorKind,
    FailurePolicy, MainContext, MainHandle, NamedOperation, OperationEvent, Ownership, Pool,
    Region, Result, StateFeed, Subscription, SystemClock, TaskGroupOutcome, TaskGroupRunner,
    Ticket,
};

/// The buttons of the demo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemoKind {
    /// Runs `first`, `second` and `third` one after another.
    SerialCall,
    /// Runs `first`, `second`, `second`, `third` and a main-affine `main` as one discarding group.
    ParallelCall,
    /// Hops onto the main context, waits a tick off-main, hops back.
    MainRun,
    /// Like [`DemoKind::MainRun`], but without waiting for the second hop.
    FireAndForgetMain,
    /// Pushes five values through a background stage and a one tick delay back onto the main
    /// context.
    BridgedPublish,
    /// Sets the flag region after a tick, without waiting for it.
    OwnRegionFireAndForget,
    /// Sets the flag region and waits for it.
    OwnRegionAwaited,
    StartSubscription,
    StopSubscription,
    /// Schedules a callback that bumps [`ViewState::deferred_fires`][crate::ViewState].
    ScheduleDeferred,
}

impl DemoKind {
    pub const ALL: [DemoKind; 10] = [
        DemoKind::SerialCall,
        DemoKind::ParallelCall,
        DemoKind::MainRun,
        DemoKind::FireAndForgetMain,
        DemoKind::BridgedPublish,
        DemoKind::OwnRegionFireAndForget,
        DemoKind::OwnRegionAwaited,
        DemoKind::StartSubscription,
        DemoKind::StopSubscription,
        DemoKind::ScheduleDeferred,
    ];
}

/// What a [`Session::invoke`] call did.
#[derive(Debug)]
pub enum Report {
    /// A serial or parallel group ran to completion.
    Group(TaskGroupOutcome),
    /// The demo finished before `invoke` returned.
    Completed,
    /// The demo left work running in the background.
    Spawned,
    /// The subscription state after starting or stopping it.
    Subscription { active: bool },
    Scheduled(Ticket),
    /// The demo could not run. The error has been logged.
    Failed(Error),
}

/// A builder object that can be used to configure and build a [`Session`].
pub struct SessionBuilder {
    name: String,
    workers: usize,
    tick: Duration,
    clock: Option<Arc<dyn Clock>>,
    deferred_delay: Option<Duration>,
    deferred_ownership: Ownership,
    failures: HashMap<String, ErrorKind>,
    probe: Option<Sender<OperationEvent>>,
}

impl SessionBuilder {
    /// Sets the name used for the session's threads.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Sets the number of pool threads running background operations. Defaults to 8.
    ///
    /// # Panics
    ///
    /// [`SessionBuilder::build`] will panic if this is 0.
    pub fn workers(self, workers: usize) -> Self {
        Self { workers, ..self }
    }

    /// Sets the simulated latency of every operation and the timer period. Defaults to 1 second.
    pub fn tick(self, tick: Duration) -> Self {
        Self { tick, ..self }
    }

    /// Sets the time source. Defaults to a [`SystemClock`].
    pub fn clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock: Some(clock),
            ..self
        }
    }

    /// Sets the delay of [`DemoKind::ScheduleDeferred`]. Defaults to one tick.
    pub fn deferred_delay(self, delay: Duration) -> Self {
        Self {
            deferred_delay: Some(delay),
            ..self
        }
    }

    /// Sets whether deferred callbacks keep the session core alive. Defaults to
    /// [`Ownership::Weak`].
    pub fn deferred_ownership(self, ownership: Ownership) -> Self {
        Self {
            deferred_ownership: ownership,
            ..self
        }
    }

    /// Makes the demo operation called `op` fail with `kind`.
    pub fn fail<N: Into<String>>(mut self, op: N, kind: ErrorKind) -> Self {
        self.failures.insert(op.into(), kind);
        self
    }

    /// Reports the progress of every demo operation on `probe`.
    pub fn probe(self, probe: Sender<OperationEvent>) -> Self {
        Self {
            probe: Some(probe),
            ..self
        }
    }

    /// Spawns the session's threads.
    pub fn build(self) -> Result<Session> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        let (projector, feed) = projector();
        let main = Region::builder()
            .name(format!("{}-main", self.name))
            .spawn(projector)?;
        let flag = Region::builder()
            .name(format!("{}-flag", self.name))
            .spawn(false)?;
        let pool = Pool::builder()
            .name(format!("{}-worker", self.name))
            .spawn(self.workers)?;

        let mut runner = TaskGroupRunner::new(clock.clone(), main.handle());
        if let Some(probe) = self.probe {
            runner = runner.with_probe(probe);
        }
        let deferred = DeferredScheduler::new(format!("{}-deferred", self.name), clock.clone());
        let core = Arc::new(Core {
            main: main.handle(),
        });
        log::debug!(
            "session '{}' up with {} workers, tick {:?}",
            self.name,
            pool.size(),
            self.tick
        );

        Ok(Session {
            deferred,
            subscription: None,
            cancel: CancelToken::new(),
            runner,
            pool,
            flag,
            core,
            main,
            feed,
            clock,
            name: self.name,
            tick: self.tick,
            deferred_delay: self.deferred_delay.unwrap_or(self.tick),
            deferred_ownership: self.deferred_ownership,
            failures: self.failures,
        })
    }
}

/// The target of deferred callbacks.
struct Core {
    main: MainHandle,
}

impl Core {
    fn on_deferred_fire(&self) {
        let fired = self.main.dispatch(|state| {
            log::debug!("deferred callback on {}", current_context());
            state.record_deferred_fire();
        });
        if let Err(err) = fired {
            log::debug!("deferred callback dropped: {err}");
        }
    }
}

/// The coordination core behind the demo. See the [module docs](self).
pub struct Session {
    // Fields are dropped in declaration order, which is the teardown order.
    deferred: DeferredScheduler,
    subscription: Option<Subscription>,
    cancel: CancelToken,
    runner: TaskGroupRunner,
    pool: Pool,
    flag: Region<bool>,
    core: Arc<Core>,
    main: MainContext,
    feed: StateFeed,
    clock: Arc<dyn Clock>,
    name: String,
    tick: Duration,
    deferred_delay: Duration,
    deferred_ownership: Ownership,
    failures: HashMap<String, ErrorKind>,
}

impl Session {
    /// Returns a builder that can be used to configure and build a [`Session`].
    pub fn builder() -> SessionBuilder {
        SessionBuilder {
            name: "session".into(),
            workers: 8,
            tick: Duration::from_secs(1),
            clock: None,
            deferred_delay: None,
            deferred_ownership: Ownership::Weak,
            failures: HashMap::new(),
            probe: None,
        }
    }

    /// Runs one demo.
    ///
    /// This never fails: errors are logged and returned as [`Report::Failed`]. Demos that wait
    /// for a region ([`DemoKind::MainRun`], [`DemoKind::OwnRegionAwaited`] and the groups) fail
    /// with [`Error::NestedAccess`] when invoked from a region thread.
    pub fn invoke(&mut self, kind: DemoKind) -> Report {
        log::debug!("{kind:?} invoked on {}", current_context());
        match self.run(kind) {
            Ok(report) => report,
            Err(err) => {
                log::warn!("{kind:?} failed: {err}");
                Report::Failed(err)
            }
        }
    }

    fn run(&mut self, kind: DemoKind) -> Result<Report> {
        match kind {
            DemoKind::SerialCall => {
                let ops = [self.op("first"), self.op("second"), self.op("third")];
                let outcome = self.runner.run_serial(&ops, &self.cancel)?;
                Ok(Report::Group(outcome))
            }
            DemoKind::ParallelCall => {
                let ops = vec![
                    self.op("first"),
                    self.op("second"),
                    self.op("second"),
                    self.op("third"),
                    self.op("main").on_main(),
                ];
                let outcome = self.runner.run_parallel(
                    &self.pool,
                    ops,
                    FailurePolicy::FirstErrorCancelsRest,
                    &self.cancel,
                )?;
                Ok(Report::Group(outcome))
            }
            DemoKind::MainRun => {
                let _guard = self.clock.enter().bind();
                self.main.mutate(|state| {
                    log::debug!("main run: loading on {}", current_context());
                    state.set_loading(true);
                })?;
                let slept = self.clock.sleep(self.tick, &self.cancel);
                log::debug!("main run: woke up on {}", current_context());
                self.main.mutate(|state| {
                    log::debug!("main run: done on {}", current_context());
                    state.set_loading(false);
                })?;
                slept.map(|()| Report::Completed)
            }
            DemoKind::FireAndForgetMain => {
                self.main.dispatch(|state| state.set_loading(true))?;
                let main = self.main.handle();
                self.after_tick(move || {
                    main.dispatch(|state| {
                        log::debug!("fire-and-forget: done on {}", current_context());
                        state.set_loading(false);
                    })
                })?;
                Ok(Report::Spawned)
            }
            DemoKind::BridgedPublish => {
                self.main.mutate(|state| state.set_loading(true))?;
                let values: Vec<u32> = (1..=5).collect();
                let main = self.main.handle();
                self.after_tick_with(
                    move || {
                        for value in &values {
                            log::debug!("publish: received {value} on {}", current_context());
                        }
                        values
                    },
                    move |values: Vec<u32>| {
                        for value in values {
                            main.dispatch(move |state| {
                                log::debug!("publish: sink {value} on {}", current_context());
                                state.set_loading(false);
                            })?;
                        }
                        Ok(())
                    },
                )?;
                Ok(Report::Spawned)
            }
            DemoKind::OwnRegionFireAndForget => {
                let flag = self.flag.handle();
                self.after_tick(move || {
                    flag.dispatch(|flag| {
                        log::debug!("flag set on {}", current_context());
                        *flag = true;
                    })
                })?;
                Ok(Report::Spawned)
            }
            DemoKind::OwnRegionAwaited => {
                self.flag.mutate(|flag| {
                    log::debug!("flag set on {}", current_context());
                    *flag = true;
                })?;
                Ok(Report::Completed)
            }
            DemoKind::StartSubscription => {
                if let Some(mut previous) = self.subscription.take() {
                    previous.stop();
                }
                let subscription = Subscription::start(
                    self.clock.clone(),
                    self.tick,
                    &self.cancel,
                    self.main.handle(),
                )?;
                self.subscription = Some(subscription);
                Ok(Report::Subscription { active: true })
            }
            DemoKind::StopSubscription => {
                if let Some(mut subscription) = self.subscription.take() {
                    subscription.stop();
                }
                Ok(Report::Subscription { active: false })
            }
            DemoKind::ScheduleDeferred => {
                let ticket = self.deferred.schedule(
                    &self.core,
                    self.deferred_delay,
                    self.deferred_ownership,
                    Core::on_deferred_fire,
                )?;
                Ok(Report::Scheduled(ticket))
            }
        }
    }

    /// Returns a new reader of the view state.
    pub fn feed(&self) -> StateFeed {
        self.feed.clone()
    }

    /// Reads the flag region.
    pub fn flag(&self) -> Result<bool> {
        self.flag.access(|flag| *flag)
    }

    /// The running subscription, if any.
    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    /// Lets go of the object deferred callbacks are scheduled against and starts using a new one.
    ///
    /// Weakly owned tickets scheduled before this call have nothing left to fire on and are
    /// skipped when they come due. Strongly owned ones keep the old object alive until they fire.
    pub fn release_deferred_target(&mut self) {
        self.core = Arc::new(Core {
            main: self.main.handle(),
        });
        log::debug!("session '{}' replaced its deferred target", self.name);
    }

    /// Waits until every write queued on the main context and the flag region so far has been
    /// applied.
    pub fn settle(&self) -> Result<()> {
        self.flag.flush()?;
        self.main.flush()
    }

    fn op(&self, name: &str) -> NamedOperation {
        let op = NamedOperation::new(name, self.tick);
        match self.failures.get(name) {
            Some(kind) => op.failing(kind.clone()),
            None => op,
        }
    }

    /// Runs `then` on the pool once a tick has passed, unless the session is torn down first.
    fn after_tick<F>(&self, then: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.after_tick_with(|| (), move |()| then())
    }

    /// Runs `first` on the pool right away, then `then` with its output once a tick has passed.
    fn after_tick_with<T, F, G>(&self, first: F, then: G) -> Result<()>
    where
        F: FnOnce() -> T + Send + 'static,
        G: FnOnce(T) -> Result<()> + Send + 'static,
    {
        // Taken here so that a virtual clock can't move between the call and the sleep.
        let due = self.clock.now() + self.tick;
        let clock = self.clock.clone();
        let cancel = self.cancel.child();
        let guard = clock.enter();
        self.pool.spawn(move || {
            let _guard = guard.bind();
            let value = first();
            let result = clock.sleep_until(due, &cancel).and_then(|()| then(value));
            if let Err(err) = result {
                log::debug!("background step ended early: {err}");
            }
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        log::debug!("tearing down session '{}'", self.name);
        if let Some(mut subscription) = self.subscription.take() {
            subscription.stop();
        }
        self.cancel.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("tick", &self.tick)
            .field("subscription", &self.subscription)
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}
