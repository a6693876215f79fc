//! Named operations: the leaf units of simulated work.

use std::{sync::Arc, time::Duration};

use crossbeam_channel::Sender;

use crate::{
    region::current_context, CancelToken, Clock, Error, ErrorKind, MainHandle, Result,
};

/// What a [`NamedOperation`] does once its delay has elapsed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Outcome {
    #[default]
    Success,
    Failure(ErrorKind),
}

/// Where a [`NamedOperation`] finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affinity {
    /// Entirely on the thread that runs it.
    #[default]
    Background,
    /// The delay elapses off-main, then the operation hops onto the main context to finish.
    Main,
}

/// A simulated asynchronous call: a delay followed by a success or failure.
///
/// Operations are built once with the chained constructors below and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedOperation {
    name: String,
    delay: Duration,
    outcome: Outcome,
    affinity: Affinity,
}

impl NamedOperation {
    /// A background operation that succeeds after `delay`.
    pub fn new<N: Into<String>>(name: N, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            outcome: Outcome::Success,
            affinity: Affinity::Background,
        }
    }

    /// Makes the operation fail with `kind` once its delay has elapsed.
    pub fn failing(self, kind: ErrorKind) -> Self {
        Self {
            outcome: Outcome::Failure(kind),
            ..self
        }
    }

    /// Makes the operation finish on the main context.
    pub fn on_main(self) -> Self {
        Self {
            affinity: Affinity::Main,
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }
}

/// Progress of a single [`NamedOperation`], reported on a probe channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEvent {
    Started { name: String },
    Completed { name: String },
    Failed { name: String, kind: ErrorKind },
    Cancelled { name: String },
}

/// Everything an operation needs to run: time, the main context and the optional probe.
#[derive(Clone)]
pub(crate) struct OperationContext {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) main: MainHandle,
    pub(crate) probe: Option<Sender<OperationEvent>>,
}

impl OperationContext {
    /// Runs `op` on the calling thread and reports how it went.
    pub(crate) fn run(&self, op: &NamedOperation, cancel: &CancelToken) -> Result<()> {
        let result = self.execute(op, cancel);
        let name = op.name.clone();
        self.emit(match &result {
            Ok(()) => OperationEvent::Completed { name },
            Err(Error::Cancelled) => OperationEvent::Cancelled { name },
            Err(err) => OperationEvent::Failed {
                name,
                kind: err.kind(),
            },
        });
        result
    }

    fn execute(&self, op: &NamedOperation, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        log::debug!("'{}' started on {}", op.name, current_context());
        self.emit(OperationEvent::Started {
            name: op.name.clone(),
        });

        self.clock.sleep(op.delay, cancel)?;

        match op.affinity {
            Affinity::Background => {
                log::debug!("'{}' finishing on {}", op.name, current_context());
            }
            Affinity::Main => {
                let name = op.name.clone();
                self.main.mutate(move |_| {
                    log::debug!("'{name}' finishing on {}", current_context());
                })?;
                cancel.check()?;
            }
        }

        match &op.outcome {
            Outcome::Success => Ok(()),
            Outcome::Failure(kind) => Err(Error::Operation {
                name: op.name.clone(),
                kind: kind.clone(),
            }),
        }
    }

    fn emit(&self, event: OperationEvent) {
        if let Some(probe) = &self.probe {
            // A probe nobody listens to anymore is not an error.
            probe.send(event).ok();
        }
    }
}
