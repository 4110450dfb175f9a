//! Pass
//!
//! Debounced runner for a handler that must never overlap with itself.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::timer::{Timer, TimerId};

/// A pending run is only replaced by one due at least this much earlier.
const RESCHEDULE_TOLERANCE_MS: u64 = 10;

#[derive(Debug, Default)]
struct PassState {
    scheduled: Option<TimerId>,
    next_time: u64,
}

/// Runs `handler` on the timer, at most once per schedule window.
///
/// Scheduling while a run is pending keeps the pending run unless the new
/// request is due earlier, in which case the pending run is moved up.
pub struct Pass {
    this: Weak<Pass>,
    timer: Timer,
    handler: Box<dyn Fn()>,
    state: RefCell<PassState>,
    running: Cell<bool>,
}

impl std::fmt::Debug for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pass")
            .field("state", &self.state.borrow())
            .field("running", &self.running.get())
            .finish()
    }
}

impl Pass {
    pub fn new(timer: Timer, handler: impl Fn() + 'static) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            timer,
            handler: Box::new(handler),
            state: RefCell::new(PassState::default()),
            running: Cell::new(false),
        })
    }

    /// Request a run in `delay` ms. Returns whether a new run was scheduled.
    pub fn schedule(&self, delay: u64) -> bool {
        let next_time = self.timer.now() + delay;
        let replaced = {
            let state = self.state.borrow();
            match state.scheduled {
                Some(id) if next_time + RESCHEDULE_TOLERANCE_MS < state.next_time => Some(id),
                Some(_) => return false,
                None => None,
            }
        };
        if let Some(id) = replaced {
            self.timer.cancel(id);
        }

        let this = self.this.clone();
        let id = self.timer.delay(
            move || {
                if let Some(pass) = this.upgrade() {
                    pass.run();
                }
            },
            delay,
        );
        let mut state = self.state.borrow_mut();
        state.scheduled = Some(id);
        state.next_time = next_time;
        true
    }

    /// Drop the pending run, if any.
    pub fn cancel(&self) {
        let pending = self.state.borrow_mut().scheduled.take();
        if let Some(id) = pending {
            self.timer.cancel(id);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.borrow().scheduled.is_some()
    }

    /// Is the handler executing right now?
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    fn run(&self) {
        {
            let mut state = self.state.borrow_mut();
            state.scheduled = None;
            state.next_time = 0;
        }
        self.running.set(true);
        (self.handler)();
        self.running.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (Rc<ManualClock>, Timer, Rc<Pass>, Rc<Cell<u32>>) {
        let clock = Rc::new(ManualClock::new(0));
        let timer = Timer::new(clock.clone());
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let pass = Pass::new(timer.clone(), move || counter.set(counter.get() + 1));
        (clock, timer, pass, runs)
    }

    #[test]
    fn test_coalesces_requests() {
        let (clock, timer, pass, runs) = setup();
        assert!(pass.schedule(100));
        assert!(!pass.schedule(100));
        assert!(!pass.schedule(500));
        timer.advance(&clock, 1000);
        assert_eq!(runs.get(), 1);
        assert!(!pass.is_pending());
    }

    #[test]
    fn test_earlier_request_moves_run_up() {
        let (clock, timer, pass, runs) = setup();
        pass.schedule(5000);
        assert!(pass.schedule(100));
        timer.advance(&clock, 100);
        assert_eq!(runs.get(), 1);
        timer.advance(&clock, 10_000);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_handler_may_reschedule() {
        let clock = Rc::new(ManualClock::new(0));
        let timer = Timer::new(clock.clone());
        let runs = Rc::new(Cell::new(0));
        let slot: Rc<RefCell<Option<Rc<Pass>>>> = Rc::new(RefCell::new(None));
        let counter = runs.clone();
        let handle = slot.clone();
        let pass = Pass::new(timer.clone(), move || {
            counter.set(counter.get() + 1);
            if let Some(pass) = handle.borrow().as_ref() {
                assert!(pass.is_running());
                pass.schedule(1000);
            }
        });
        *slot.borrow_mut() = Some(pass.clone());

        pass.schedule(0);
        timer.advance(&clock, 2500);
        assert_eq!(runs.get(), 3);
        assert!(pass.is_pending());
        *slot.borrow_mut() = None;
    }

    #[test]
    fn test_cancel() {
        let (clock, timer, pass, runs) = setup();
        pass.schedule(10);
        pass.cancel();
        timer.advance(&clock, 100);
        assert_eq!(runs.get(), 0);
    }
}
