//! Timer
//!
//! Delayed execution on a single-threaded event loop. Zero-delay callbacks
//! run as microtasks on a [`smol::LocalExecutor`]; everything else waits in a
//! deadline queue and runs when [`Timer::tick`] finds it due.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use smol::LocalExecutor;

use crate::clock::{Clock, ManualClock};

const DEFAULT_TIMEOUT_MESSAGE: &str = "timeout";

/// Handle to a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Timer promise failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("timer cancelled")]
    Cancelled,

    #[error("{0}")]
    Timeout(String),
}

type Callback = Box<dyn FnOnce()>;

struct TimerInner {
    clock: Rc<dyn Clock>,
    executor: LocalExecutor<'static>,
    /// (deadline, id); ids are increasing so equal deadlines fire in order.
    queue: RefCell<BinaryHeap<Reverse<(u64, u64)>>>,
    callbacks: RefCell<HashMap<u64, Callback>>,
    next_id: Cell<u64>,
}

impl TimerInner {
    /// Run the callback for `id` if it is still pending.
    fn fire(&self, id: u64) -> bool {
        let callback = self.callbacks.borrow_mut().remove(&id);
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

/// Event-loop timer shared by every service of one document.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("now", &self.now())
            .field("pending", &self.inner.callbacks.borrow().len())
            .finish()
    }
}

impl Timer {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(TimerInner {
                clock,
                executor: LocalExecutor::new(),
                queue: RefCell::new(BinaryHeap::new()),
                callbacks: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// Current time in milliseconds.
    pub fn now(&self) -> u64 {
        self.inner.clock.now()
    }

    /// Run `callback` after `ms` milliseconds.
    ///
    /// A zero delay schedules a microtask instead of a deadline entry, so the
    /// callback runs on the next drain without waiting for a tick.
    pub fn delay<F>(&self, callback: F, ms: u64) -> TimerId
    where
        F: FnOnce() + 'static,
    {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner.callbacks.borrow_mut().insert(id, Box::new(callback));

        if ms == 0 {
            let inner = Rc::downgrade(&self.inner);
            self.inner
                .executor
                .spawn(async move {
                    if let Some(inner) = inner.upgrade() {
                        inner.fire(id);
                    }
                })
                .detach();
        } else {
            let deadline = self.now() + ms;
            self.inner.queue.borrow_mut().push(Reverse((deadline, id)));
        }
        TimerId(id)
    }

    /// Cancel a scheduled callback. Unknown or already-fired ids are ignored.
    pub fn cancel(&self, id: TimerId) {
        let removed = self.inner.callbacks.borrow_mut().remove(&id.0);
        drop(removed);
    }

    /// Is the callback behind `id` still waiting to run?
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.inner.callbacks.borrow().contains_key(&id.0)
    }

    /// Resolve with `value` after `ms`. Cancelling the promise's id rejects
    /// it with [`TimerError::Cancelled`].
    pub fn promise<T: 'static>(&self, ms: u64, value: T) -> TimerPromise<T> {
        let (tx, rx) = smol::channel::bounded(1);
        let id = self.delay(
            move || {
                let _ = tx.try_send(value);
            },
            ms,
        );
        TimerPromise {
            id,
            future: async move { rx.recv().await.map_err(|_| TimerError::Cancelled) }.boxed_local(),
        }
    }

    /// Race `race` against a timeout of `ms`. The timeout rejects with
    /// [`TimerError::Timeout`] carrying `message` (or `"timeout"`).
    pub fn timeout_promise<T, F>(
        &self,
        ms: u64,
        race: F,
        message: Option<&str>,
    ) -> impl Future<Output = Result<T, TimerError>> + use<T, F>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let message = message.unwrap_or(DEFAULT_TIMEOUT_MESSAGE).to_string();
        let timeout = self.promise(ms, ());
        let timeout_id = timeout.id();
        let timer = self.clone();
        async move {
            let result = smol::future::or(async move { Ok(race.await) }, async move {
                match timeout.await {
                    Ok(()) => Err(TimerError::Timeout(message)),
                    Err(err) => Err(err),
                }
            })
            .await;
            timer.cancel(timeout_id);
            result
        }
    }

    /// A promise that always rejects with a timeout after `ms`.
    pub fn timeout(
        &self,
        ms: u64,
        message: Option<&str>,
    ) -> impl Future<Output = Result<(), TimerError>> + use<> {
        let message = message.unwrap_or(DEFAULT_TIMEOUT_MESSAGE).to_string();
        let timeout = self.promise(ms, ());
        async move {
            timeout.await?;
            Err(TimerError::Timeout(message))
        }
    }

    /// Run a future as a microtask on this loop.
    pub fn spawn_local<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.inner.executor.spawn(future).detach();
    }

    /// Drain every runnable microtask.
    pub fn run_microtasks(&self) {
        while self.inner.executor.try_tick() {}
    }

    /// Fire every callback whose deadline has passed, draining microtasks
    /// after each one. Returns how many callbacks ran.
    pub fn tick(&self) -> usize {
        self.run_microtasks();
        let mut fired = 0;
        loop {
            let now = self.now();
            let due = {
                let mut queue = self.inner.queue.borrow_mut();
                match queue.peek() {
                    Some(Reverse((deadline, id))) if *deadline <= now => {
                        let id = *id;
                        queue.pop();
                        Some(id)
                    }
                    _ => None,
                }
            };
            let Some(id) = due else { break };
            if self.inner.fire(id) {
                fired += 1;
            }
            self.run_microtasks();
        }
        fired
    }

    /// Earliest deadline among callbacks that have not been cancelled.
    pub fn next_deadline(&self) -> Option<u64> {
        let callbacks = self.inner.callbacks.borrow();
        let mut queue = self.inner.queue.borrow_mut();
        loop {
            let (deadline, id) = match queue.peek() {
                Some(Reverse(entry)) => *entry,
                None => return None,
            };
            if callbacks.contains_key(&id) {
                return Some(deadline);
            }
            queue.pop();
        }
    }

    /// Step `clock` forward by `ms`, stopping at every deadline on the way.
    ///
    /// `clock` must be the clock this timer was built with.
    pub fn advance(&self, clock: &ManualClock, ms: u64) {
        let target = clock.now() + ms;
        self.run_microtasks();
        while let Some(deadline) = self.next_deadline() {
            if deadline > target {
                break;
            }
            clock.set(deadline);
            self.tick();
        }
        clock.set(target);
        self.tick();
    }

    /// Drive the loop on wall-clock time for `ms` milliseconds.
    pub fn run_for(&self, ms: u64) {
        let end = self.now() + ms;
        loop {
            self.tick();
            let now = self.now();
            if now >= end {
                break;
            }
            let wake = self.next_deadline().map_or(end, |deadline| deadline.min(end));
            let wait = Duration::from_millis(wake.saturating_sub(now));
            smol::block_on(self.inner.executor.run(smol::Timer::after(wait)));
        }
    }
}

/// Future returned by [`Timer::promise`].
pub struct TimerPromise<T> {
    id: TimerId,
    future: LocalBoxFuture<'static, Result<T, TimerError>>,
}

impl<T> TimerPromise<T> {
    /// Id to pass to [`Timer::cancel`].
    pub fn id(&self) -> TimerId {
        self.id
    }
}

impl<T> Future for TimerPromise<T> {
    type Output = Result<T, TimerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for TimerPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerPromise").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Rc<ManualClock>, Timer) {
        let clock = Rc::new(ManualClock::new(0));
        let timer = Timer::new(clock.clone());
        (clock, timer)
    }

    #[test]
    fn test_delay_fires_at_deadline() {
        let (clock, timer) = setup();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        timer.delay(move || counter.set(counter.get() + 1), 100);

        timer.advance(&clock, 99);
        assert_eq!(fired.get(), 0);
        timer.advance(&clock, 1);
        assert_eq!(fired.get(), 1);
        assert_eq!(clock.now(), 100);
    }

    #[test]
    fn test_zero_delay_is_microtask() {
        let (_clock, timer) = setup();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        timer.delay(move || flag.set(true), 0);

        assert_eq!(timer.next_deadline(), None);
        timer.run_microtasks();
        assert!(fired.get());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (clock, timer) = setup();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let id = timer.delay(move || flag.set(true), 50);

        timer.cancel(id);
        timer.cancel(id);
        timer.advance(&clock, 100);
        assert!(!fired.get());

        // Cancelling after firing is a no-op too.
        let id = timer.delay(|| {}, 10);
        timer.advance(&clock, 10);
        assert!(!timer.is_pending(id));
        timer.cancel(id);
    }

    #[test]
    fn test_same_deadline_fires_in_order() {
        let (clock, timer) = setup();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            timer.delay(move || order.borrow_mut().push(i), 20);
        }
        timer.advance(&clock, 20);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let (_clock, timer) = setup();
        let first = timer.delay(|| {}, 10);
        timer.delay(|| {}, 30);
        timer.cancel(first);
        assert_eq!(timer.next_deadline(), Some(30));
    }

    #[test]
    fn test_promise_resolves_with_value() {
        let (clock, timer) = setup();
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        let promise = timer.promise(200, "done");
        timer.spawn_local(async move {
            *slot.borrow_mut() = Some(promise.await);
        });

        timer.advance(&clock, 199);
        assert!(result.borrow().is_none());
        timer.advance(&clock, 1);
        assert_eq!(*result.borrow(), Some(Ok("done")));
    }

    #[test]
    fn test_cancelled_promise_rejects() {
        let (clock, timer) = setup();
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        let promise = timer.promise(200, 1);
        let id = promise.id();
        timer.spawn_local(async move {
            *slot.borrow_mut() = Some(promise.await);
        });

        timer.cancel(id);
        timer.advance(&clock, 500);
        assert_eq!(*result.borrow(), Some(Err(TimerError::Cancelled)));
    }

    #[test]
    fn test_timeout_promise_race_wins() {
        let (clock, timer) = setup();
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        let race = timer.promise(100, 7);
        let raced = timer.timeout_promise(500, async move { race.await.unwrap_or(0) }, None);
        timer.spawn_local(async move {
            *slot.borrow_mut() = Some(raced.await);
        });

        timer.advance(&clock, 100);
        assert_eq!(*result.borrow(), Some(Ok(7)));
        // The losing timeout was cancelled.
        assert_eq!(timer.next_deadline(), None);
    }

    #[test]
    fn test_timeout_promise_times_out() {
        let (clock, timer) = setup();
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        let raced = timer.timeout_promise(50, futures::future::pending::<u32>(), Some("too slow"));
        timer.spawn_local(async move {
            *slot.borrow_mut() = Some(raced.await);
        });

        timer.advance(&clock, 50);
        assert_eq!(
            *result.borrow(),
            Some(Err(TimerError::Timeout("too slow".to_string())))
        );
    }

    #[test]
    fn test_timeout_always_rejects() {
        let (clock, timer) = setup();
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        let timeout = timer.timeout(30, None);
        timer.spawn_local(async move {
            *slot.borrow_mut() = Some(timeout.await);
        });

        timer.advance(&clock, 30);
        assert_eq!(
            *result.borrow(),
            Some(Err(TimerError::Timeout("timeout".to_string())))
        );
    }

    #[test]
    fn test_run_for_on_wall_clock() {
        let timer = Timer::new(Rc::new(crate::clock::SystemClock::new()));
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        timer.delay(move || flag.set(true), 10);

        timer.run_for(20);
        assert!(fired.get());
        assert!(timer.now() >= 20);
    }

    #[test]
    fn test_callbacks_may_schedule_more_work() {
        let (clock, timer) = setup();
        let fired = Rc::new(Cell::new(0));
        let inner_timer = timer.clone();
        let counter = fired.clone();
        timer.delay(
            move || {
                counter.set(counter.get() + 1);
                let counter = counter.clone();
                inner_timer.delay(move || counter.set(counter.get() + 1), 10);
            },
            10,
        );

        timer.advance(&clock, 20);
        assert_eq!(fired.get(), 2);
    }
}
