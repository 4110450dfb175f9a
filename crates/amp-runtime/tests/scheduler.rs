//! Scheduler integration tests
//!
//! Runtime, viewport, resources and poller working together on virtual time.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use amp_runtime::backoff::no_jitter;
use amp_runtime::*;

struct Page {
    clock: Rc<ManualClock>,
    binding: Rc<ManualBinding>,
    page: Rc<SyntheticPage>,
    runtime: Runtime,
}

impl Page {
    /// 400x1000 viewport scrolled to the top.
    fn new() -> Self {
        let clock = Rc::new(ManualClock::new(0));
        let binding = Rc::new(ManualBinding::new(Size::new(400.0, 1000.0)));
        let page = Rc::new(SyntheticPage::new());
        let runtime = Runtime::with_jitter(
            Config::default(),
            clock.clone(),
            binding.clone(),
            page.clone(),
            Rc::new(no_jitter),
        )
        .unwrap();
        Self {
            clock,
            binding,
            page,
            runtime,
        }
    }

    /// `count` stacked elements of `height` starting at the top of the page.
    fn column(&self, count: usize, height: f64) -> Vec<Rc<SyntheticElement>> {
        (0..count)
            .map(|i| self.element(i as f64 * height, height))
            .collect()
    }

    fn element(&self, top: f64, height: f64) -> Rc<SyntheticElement> {
        let order = self.page.len();
        let element = SyntheticElement::new(
            format!("e{order}"),
            order,
            LayoutRect::ltwh(0.0, top, 400.0, height),
            self.binding.clone(),
            self.runtime.timer().clone(),
        );
        self.page.insert(element.clone());
        self.runtime.resources().add(element.clone());
        element
    }

    fn advance(&self, ms: u64) {
        self.runtime.timer().advance(&self.clock, ms);
    }

    /// Jump to `top` and wait for the viewport to settle.
    fn settle_at(&self, top: f64) {
        self.binding.set_scroll_top(top);
        self.runtime.viewport().handle_scroll();
        self.advance(1000);
    }
}

fn loaded(elements: &[Rc<SyntheticElement>]) -> Vec<usize> {
    elements
        .iter()
        .enumerate()
        .filter(|(_, e)| e.load_count() > 0)
        .map(|(i, _)| i)
        .collect()
}

fn active(elements: &[Rc<SyntheticElement>]) -> Vec<usize> {
    elements
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_activated())
        .map(|(i, _)| i)
        .collect()
}

// ============================================================================
// PASS SCHEDULING
// ============================================================================

#[test]
fn test_zero_height_resource_in_viewport_is_ignored() {
    let page = Page::new();
    let flat = page.element(200.0, 0.0);
    let normal = page.element(300.0, 100.0);
    page.runtime.start();
    page.advance(0);

    for top in [0.0, 100.0, 150.0, 0.0] {
        page.settle_at(top);
    }
    page.advance(60_000);

    assert_eq!(flat.load_count(), 0);
    assert_eq!(flat.activation_count(), 0);
    assert_eq!(normal.load_count(), 1);
    assert!(normal.is_activated());
}

#[test]
fn test_loading_follows_scroll() {
    let page = Page::new();
    // 20 blocks of 500px: a 10000px page.
    let column = page.column(20, 500.0);
    page.runtime.start();
    page.advance(0);

    // Viewport 0..1000, load window -1000..2000.
    assert_eq!(loaded(&column), vec![0, 1, 2, 3, 4]);
    // Active window -250..1250.
    assert_eq!(active(&column), vec![0, 1, 2]);

    page.settle_at(4000.0);
    // Load window 3000..6000.
    assert_eq!(loaded(&column), vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    // Active window 3750..5250.
    assert_eq!(active(&column), vec![7, 8, 9, 10]);
    assert_eq!(column[0].deactivation_count(), 1);
}

#[test]
fn test_pass_delay_backs_off_while_idle() {
    let page = Page::new();
    page.element(0.0, 100.0);
    page.runtime.start();
    page.advance(0);
    let report = page.runtime.resources().last_report().unwrap();
    assert_eq!(report.next_pass_delay, 5000);

    // Post-load pass at 1000ms, then progressively sparser passes.
    page.advance(1000);
    page.advance(20_000);
    let report = page.runtime.resources().last_report().unwrap();
    assert!(report.next_pass_delay > 5000);

    page.advance(600_000);
    let report = page.runtime.resources().last_report().unwrap();
    assert_eq!(report.next_pass_delay, 30000);
}

#[test]
fn test_load_retry_then_success() {
    let page = Page::new();
    let element = page.element(0.0, 100.0);
    element.push_load_outcome(Err(LoadError::Network("502".into())));
    page.runtime.start();
    page.advance(0);

    assert!(!element.is_activated());
    page.advance(4999);
    assert_eq!(element.load_count(), 1);
    page.advance(1);
    assert_eq!(element.load_count(), 2);
    assert!(element.is_activated());
}

#[test]
fn test_resize_relayouts_everything() {
    let page = Page::new();
    let column = page.column(3, 200.0);
    page.runtime.start();
    page.advance(0);
    assert!(column.iter().all(|e| e.layout_count() == 1));

    page.binding.set_size(Size::new(800.0, 600.0));
    page.runtime.viewport().handle_resize();
    page.advance(0);
    assert!(column.iter().all(|e| e.layout_count() == 2));
}

#[test]
fn test_two_documents_are_independent() {
    let first = Page::new();
    let second = Page::new();
    let a = first.element(0.0, 100.0);
    let b = second.element(0.0, 100.0);

    first.runtime.start();
    first.advance(0);
    assert_eq!(a.load_count(), 1);
    assert_eq!(b.load_count(), 0);
    assert_eq!(second.runtime.resources().pass_count(), 0);
}

// ============================================================================
// VIEWPORT
// ============================================================================

#[test]
fn test_scroll_burst_notifies_once() {
    let page = Page::new();
    let changes = Rc::new(RefCell::new(Vec::new()));
    let sink = changes.clone();
    let _unlisten = page
        .runtime
        .viewport()
        .on_changed(Box::new(move |change| sink.borrow_mut().push(*change)));

    for top in [10.0, 11.0, 12.0] {
        page.binding.set_scroll_top(top);
        page.runtime.viewport().handle_scroll();
        page.advance(100);
    }
    // Last raw event at 200ms.
    page.advance(399);
    assert!(changes.borrow().is_empty());
    page.advance(1);
    assert_eq!(changes.borrow().len(), 1);
    page.advance(5000);
    assert_eq!(changes.borrow().len(), 1);
}

// ============================================================================
// POLLER
// ============================================================================

#[test]
fn test_poller_backoff_sequence() {
    let page = Page::new();
    let script = Rc::new(RefCell::new(VecDeque::from([
        Err(PollError::retriable("503")),
        Err(PollError::retriable("503")),
        Ok(()),
    ])));
    let runs = Rc::new(RefCell::new(Vec::new()));
    let clock = page.clock.clone();
    let log = runs.clone();
    let poller = page.runtime.poller(5000, move || {
        log.borrow_mut().push(clock.now());
        let next = script.borrow_mut().pop_front().unwrap_or(Ok(()));
        async move { next }
    });

    poller.start(false);
    page.advance(20_000);
    assert_eq!(*runs.borrow(), vec![5000, 5700, 7100, 12100, 17100]);
    assert!(!poller.is_backing_off());
    poller.stop();
}

#[test]
fn test_poller_start_twice_runs_once_per_interval() {
    let page = Page::new();
    let runs = Rc::new(Cell::new(0));
    let counter = runs.clone();
    let poller = page.runtime.poller(1000, move || {
        counter.set(counter.get() + 1);
        async { Ok(()) }
    });

    poller.start(true);
    poller.start(true);
    page.advance(3500);
    assert_eq!(runs.get(), 4);
}
