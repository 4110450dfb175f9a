//! Poller
//!
//! Runs a piece of async work on a jittered interval. Failures marked
//! retriable switch the interval to an exponential backoff until the next
//! success; any other failure ends the poll loop.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;

use crate::backoff::{BackoffClock, JitterFn, default_jitter};
use crate::config::PollerConfig;
use crate::timer::{Timer, TimerId};

/// Failure returned by poll work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PollError {
    /// Transient failures back off and keep polling.
    pub retriable: bool,
    pub message: String,
}

impl PollError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            retriable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retriable: false,
            message: message.into(),
        }
    }
}

type PollWork = Box<dyn Fn() -> LocalBoxFuture<'static, Result<(), PollError>>>;

#[derive(Debug, Default)]
struct PollerState {
    is_running: bool,
    /// Bumped on every start so stale work completions are dropped.
    generation: u64,
    backoff: Option<BackoffClock>,
    last_timeout: Option<TimerId>,
    last_delay: Option<u64>,
    last_error: Option<PollError>,
}

struct PollerInner {
    timer: Timer,
    wait: u64,
    config: PollerConfig,
    work: PollWork,
    jitter: RefCell<JitterFn>,
    state: RefCell<PollerState>,
}

/// Periodic work scheduler.
#[derive(Clone)]
pub struct Poller {
    inner: Rc<PollerInner>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("wait", &self.inner.wait)
            .field("state", &self.inner.state.borrow())
            .finish()
    }
}

impl Poller {
    /// Poll `work` every `wait` milliseconds, with default jitter and backoff.
    pub fn new<F, Fut>(timer: Timer, wait: u64, work: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), PollError>> + 'static,
    {
        Self::with_config(timer, wait, PollerConfig::default(), work)
    }

    pub fn with_config<F, Fut>(timer: Timer, wait: u64, config: PollerConfig, work: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), PollError>> + 'static,
    {
        Self {
            inner: Rc::new(PollerInner {
                timer,
                wait,
                config,
                work: Box::new(move || work().boxed_local()),
                jitter: RefCell::new(default_jitter()),
                state: RefCell::new(PollerState::default()),
            }),
        }
    }

    /// Replace the jitter source for both the interval and the backoff.
    pub fn set_jitter(&self, jitter: JitterFn) {
        *self.inner.jitter.borrow_mut() = jitter;
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.borrow().is_running
    }

    /// Is the poller currently on its failure backoff?
    pub fn is_backing_off(&self) -> bool {
        self.inner.state.borrow().backoff.is_some()
    }

    /// Most recently scheduled delay.
    pub fn last_delay(&self) -> Option<u64> {
        self.inner.state.borrow().last_delay
    }

    /// The non-retriable failure that stopped polling, if any.
    pub fn last_error(&self) -> Option<PollError> {
        self.inner.state.borrow().last_error.clone()
    }

    /// Start polling. With `immediate` the first run happens right away
    /// instead of after one interval. No-op while running.
    pub fn start(&self, immediate: bool) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.is_running {
                return;
            }
            state.is_running = true;
            state.generation += 1;
            state.last_error = None;
        }
        tracing::debug!(wait = self.inner.wait, immediate, "poller started");
        PollerInner::poll(&self.inner, immediate);
    }

    /// Stop polling and cancel the pending run. No-op while stopped.
    pub fn stop(&self) {
        let pending = {
            let mut state = self.inner.state.borrow_mut();
            if !state.is_running {
                return;
            }
            state.is_running = false;
            state.last_timeout.take()
        };
        if let Some(id) = pending {
            self.inner.timer.cancel(id);
        }
        tracing::debug!("poller stopped");
    }
}

impl PollerInner {
    fn next_timeout(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        let delay = match state.backoff.as_mut() {
            Some(backoff) => backoff.next_delay(),
            None => {
                let wait = self.wait as f64;
                let jitter = self.jitter.borrow().clone();
                (wait + jitter(wait, self.config.jitter)).max(0.0).round() as u64
            }
        };
        state.last_delay = Some(delay);
        delay
    }

    fn poll(this: &Rc<Self>, immediate: bool) {
        let generation = this.state.borrow().generation;
        if immediate {
            Self::run_work(this, generation);
            return;
        }

        let delay = this.next_timeout();
        let poller = this.clone();
        let id = this
            .timer
            .delay(move || Self::run_work(&poller, generation), delay);
        this.state.borrow_mut().last_timeout = Some(id);
    }

    fn run_work(this: &Rc<Self>, generation: u64) {
        {
            let mut state = this.state.borrow_mut();
            if !state.is_running || state.generation != generation {
                return;
            }
            state.last_timeout = None;
        }

        let work = (this.work)();
        let poller = this.clone();
        this.timer.spawn_local(async move {
            let result = work.await;
            Self::work_done(&poller, generation, result);
        });
    }

    fn work_done(this: &Rc<Self>, generation: u64, result: Result<(), PollError>) {
        {
            let mut state = this.state.borrow_mut();
            if !state.is_running || state.generation != generation {
                return;
            }
            match result {
                Ok(()) => {
                    if state.backoff.take().is_some() {
                        tracing::debug!("poll recovered, backoff reset");
                    }
                }
                Err(err) if err.retriable => {
                    tracing::warn!(error = %err, "poll failed, backing off");
                    if state.backoff.is_none() {
                        let jitter = this.jitter.borrow().clone();
                        state.backoff = Some(BackoffClock::new(this.config.backoff, jitter));
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "poll failed with a fatal error, polling stopped");
                    state.is_running = false;
                    state.last_error = Some(err);
                    return;
                }
            }
        }
        Self::poll(this, false);
    }
}
