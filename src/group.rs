//! Running sets of [`NamedOperation`]s, one after another or as a structured group.
//!
//! Both entry points of [`TaskGroupRunner`] bracket their work with exactly two writes to the
//! main context: `loading = true` before the first operation starts, and `loading = false` after
//! the last one has finished or unwound.
//!
//! A parallel run is *structured*: every child runs under a child [`CancelToken`] of the caller's
//! token (the group scope), and [`TaskGroupRunner::run_parallel`] only returns once every child has
//! reported back, whether it succeeded, failed or was cancelled. Nothing started by a run outlives
//! it.

use std::{collections::BTreeSet, sync::Arc};

use crossbeam_channel::Sender;

use crate::{
    operation::OperationContext, CancelToken, Clock, Error, ErrorKind, MainHandle,
    NamedOperation, OperationEvent, Pool, Result,
};

/// How a parallel group reacts to the results of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// The first failure cancels every sibling still in flight and is the only one reported.
    /// Successful results are not retained (a "discarding" group).
    #[default]
    FirstErrorCancelsRest,
    /// Every child runs to completion; all successes and failures are retained.
    CollectAll,
    /// The first success is retained and cancels every sibling still in flight.
    DiscardAfterFirstSuccess,
}

/// What a serial or parallel run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGroupOutcome {
    pub policy: FailurePolicy,
    /// Names of the operations whose success was retained.
    pub completed: BTreeSet<String>,
    /// Failures in the order they were observed.
    pub failures: Vec<(String, ErrorKind)>,
    /// Operations of a serial run that never started because an earlier one failed.
    pub skipped: Vec<String>,
    /// Number of operations that unwound because of cancellation.
    pub cancelled: usize,
}

impl TaskGroupOutcome {
    fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            completed: BTreeSet::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            cancelled: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn first_failure(&self) -> Option<&(String, ErrorKind)> {
        self.failures.first()
    }
}

/// Runs [`NamedOperation`]s serially or concurrently. See the [module docs](self).
#[derive(Clone)]
pub struct TaskGroupRunner {
    ctx: OperationContext,
}

impl TaskGroupRunner {
    pub fn new(clock: Arc<dyn Clock>, main: MainHandle) -> Self {
        Self {
            ctx: OperationContext {
                clock,
                main,
                probe: None,
            },
        }
    }

    /// Reports the progress of every operation on `probe`.
    pub fn with_probe(self, probe: Sender<OperationEvent>) -> Self {
        Self {
            ctx: OperationContext {
                probe: Some(probe),
                ..self.ctx
            },
        }
    }

    /// Runs `ops` one at a time on the calling thread, in order.
    ///
    /// The first failure (or cancellation) ends the run. Its [`ErrorKind`] is recorded and the
    /// remaining operations are listed in [`TaskGroupOutcome::skipped`]; they are never started.
    ///
    /// The calling thread takes part in the clock for the duration of the run, so a virtual
    /// clock waits for it like for any other participant.
    ///
    /// Fails only if the main context is gone.
    pub fn run_serial(
        &self,
        ops: &[NamedOperation],
        cancel: &CancelToken,
    ) -> Result<TaskGroupOutcome> {
        let _guard = self.ctx.clock.enter().bind();
        self.with_loading(|| {
            let mut outcome = TaskGroupOutcome::new(FailurePolicy::FirstErrorCancelsRest);
            let mut remaining = ops.iter();
            for op in remaining.by_ref() {
                match self.ctx.run(op, cancel) {
                    Ok(()) => {
                        outcome.completed.insert(op.name().to_owned());
                    }
                    Err(Error::Cancelled) => {
                        outcome.cancelled += 1;
                        break;
                    }
                    Err(err) => {
                        let kind = err.kind();
                        report_failure(op.name(), &kind);
                        outcome.failures.push((op.name().to_owned(), kind));
                        break;
                    }
                }
            }
            outcome.skipped = remaining.map(|op| op.name().to_owned()).collect();
            outcome
        })
    }

    /// Runs all of `ops` concurrently on `pool`, as children of one scope.
    ///
    /// Results are handled in the order the children finish, according to `policy`. When several
    /// children fail at nearly the same time under [`FailurePolicy::FirstErrorCancelsRest`], the
    /// one whose result arrives first is reported and the others are dropped.
    ///
    /// Cancelling `cancel` cancels every child that has not finished yet.
    ///
    /// Fails only if the main context is gone.
    pub fn run_parallel(
        &self,
        pool: &Pool,
        ops: Vec<NamedOperation>,
        policy: FailurePolicy,
        cancel: &CancelToken,
    ) -> Result<TaskGroupOutcome> {
        self.with_loading(|| {
            let scope = cancel.child();
            let (results, recv) = crossbeam_channel::unbounded();

            for op in ops {
                let name = op.name().to_owned();
                let ctx = self.ctx.clone();
                let child = scope.clone();
                let tx = results.clone();
                let guard = self.ctx.clock.enter();
                let spawned = pool.spawn(move || {
                    let _guard = guard.bind();
                    let result = ctx.run(&op, &child);
                    tx.send((op.name().to_owned(), result)).ok();
                });
                if let Err(err) = spawned {
                    results.send((name, Err(err))).ok();
                }
            }
            // Every child holds a sender; the loop below ends when the last child is done.
            drop(results);

            let mut outcome = TaskGroupOutcome::new(policy);
            let mut settled = false;
            for (name, result) in recv {
                match result {
                    Err(Error::Cancelled) => outcome.cancelled += 1,
                    Ok(()) => match policy {
                        FailurePolicy::FirstErrorCancelsRest => {}
                        FailurePolicy::CollectAll => {
                            outcome.completed.insert(name);
                        }
                        FailurePolicy::DiscardAfterFirstSuccess => {
                            if !settled {
                                settled = true;
                                scope.cancel();
                                outcome.completed.insert(name);
                            }
                        }
                    },
                    Err(err) => {
                        let kind = err.kind();
                        match policy {
                            FailurePolicy::FirstErrorCancelsRest if settled => {
                                log::debug!("suppressing failure of '{name}': {kind}");
                            }
                            FailurePolicy::FirstErrorCancelsRest => {
                                settled = true;
                                scope.cancel();
                                report_failure(&name, &kind);
                                outcome.failures.push((name, kind));
                            }
                            FailurePolicy::CollectAll => {
                                report_failure(&name, &kind);
                                outcome.failures.push((name, kind));
                            }
                            FailurePolicy::DiscardAfterFirstSuccess if settled => {
                                log::debug!("ignoring failure of '{name}' after a success");
                            }
                            FailurePolicy::DiscardAfterFirstSuccess => {
                                report_failure(&name, &kind);
                                outcome.failures.push((name, kind));
                            }
                        }
                    }
                }
            }
            outcome
        })
    }

    fn with_loading<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.ctx.main.mutate(|state| state.set_loading(true))?;
        let r = f();
        self.ctx.main.mutate(|state| state.set_loading(false))?;
        Ok(r)
    }
}

fn report_failure(name: &str, kind: &ErrorKind) {
    match kind {
        ErrorKind::First => log::warn!("'{name}': first api call failed"),
        ErrorKind::Second => log::warn!("'{name}': second api call failed"),
        ErrorKind::Third => log::warn!("'{name}': third api call failed"),
        ErrorKind::Other(reason) => log::warn!("'{name}' failed: {reason}"),
    }
}
