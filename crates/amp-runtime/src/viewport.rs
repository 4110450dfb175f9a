//! Viewport
//!
//! Tracks scroll position and size, and turns bursts of raw scroll events
//! into a single velocity-aware "changed" notification once the page settles.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::config::ViewportConfig;
use crate::element::{Element, IntersectionEntry, IntersectionSource};
use crate::layout_rect::{LayoutRect, Size};
use crate::observable::{Observable, Unlisten};
use crate::timer::{Timer, TimerId};

/// Host adapter reporting the real scroll position and size.
pub trait ViewportBinding {
    fn scroll_top(&self) -> f64;

    fn scroll_left(&self) -> f64 {
        0.0
    }

    fn size(&self) -> Size;
}

/// Binding whose position and size are set by hand. Used by headless hosts
/// and simulations.
#[derive(Debug, Default)]
pub struct ManualBinding {
    top: Cell<f64>,
    left: Cell<f64>,
    size: Cell<Size>,
}

impl ManualBinding {
    pub fn new(size: Size) -> Self {
        Self {
            top: Cell::new(0.0),
            left: Cell::new(0.0),
            size: Cell::new(size),
        }
    }

    pub fn set_scroll_top(&self, top: f64) {
        self.top.set(top);
    }

    pub fn set_scroll_left(&self, left: f64) {
        self.left.set(left);
    }

    pub fn set_size(&self, size: Size) {
        self.size.set(size);
    }
}

impl ViewportBinding for ManualBinding {
    fn scroll_top(&self) -> f64 {
        self.top.get()
    }

    fn scroll_left(&self) -> f64 {
        self.left.get()
    }

    fn size(&self) -> Size {
        self.size.get()
    }
}

/// Notification fired once scrolling settles or the viewport resizes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportChange {
    /// Every element may have changed size; relayout everything.
    pub rebuild: bool,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    /// Signed scroll speed in px/ms.
    pub velocity: f64,
}

/// What the scheduler and visibility tracker need from a viewport.
pub trait ViewportService {
    /// Last measured scroll offset.
    fn top(&self) -> f64;

    /// Last measured size.
    fn size(&self) -> Size;

    /// The visible area in document coordinates.
    fn rect(&self) -> LayoutRect {
        let size = self.size();
        LayoutRect::ltwh(0.0, self.top(), size.width, size.height)
    }

    /// Convert a viewport-relative box to document coordinates, rounded to
    /// whole pixels.
    fn client_to_layout(&self, client: LayoutRect) -> LayoutRect;

    /// Document-relative box of `element`, rounded to whole pixels.
    fn layout_rect(&self, element: &dyn Element) -> LayoutRect {
        self.client_to_layout(element.bounding_client_rect())
    }

    fn on_changed(&self, handler: Box<dyn Fn(&ViewportChange)>) -> Unlisten;

    /// Raw scroll notifications, before any debouncing.
    fn on_scroll(&self, handler: Box<dyn Fn(&())>) -> Unlisten;
}

#[derive(Debug, Default)]
struct ScrollState {
    top: f64,
    left: f64,
    size: Size,
    scroll_count: u64,
    /// A burst is in progress and has not settled yet.
    tracking: bool,
    measure_top: f64,
    measure_time: u64,
    debounce: Option<TimerId>,
    settle: Option<TimerId>,
}

/// Scroll and size tracker for one document.
pub struct Viewport {
    this: Weak<Viewport>,
    binding: Rc<dyn ViewportBinding>,
    timer: Timer,
    config: ViewportConfig,
    state: RefCell<ScrollState>,
    changed: Observable<ViewportChange>,
    scrolled: Observable<()>,
}

impl std::fmt::Debug for Viewport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viewport")
            .field("config", &self.config)
            .field("state", &self.state.borrow())
            .finish()
    }
}

impl Viewport {
    pub fn new(binding: Rc<dyn ViewportBinding>, timer: Timer, config: ViewportConfig) -> Rc<Self> {
        let state = ScrollState {
            top: binding.scroll_top().max(0.0),
            left: binding.scroll_left(),
            size: binding.size(),
            ..ScrollState::default()
        };
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            binding,
            timer,
            config,
            state: RefCell::new(state),
            changed: Observable::new(),
            scrolled: Observable::new(),
        })
    }

    pub fn scroll_count(&self) -> u64 {
        self.state.borrow().scroll_count
    }

    pub fn has_scrolled(&self) -> bool {
        self.scroll_count() > 0
    }

    /// Feed one raw scroll event from the host.
    ///
    /// Negative offsets are overscroll and are ignored. Every accepted event
    /// restarts the debounce window.
    pub fn handle_scroll(&self) {
        let new_top = self.binding.scroll_top();
        let stale = {
            let mut state = self.state.borrow_mut();
            state.scroll_count += 1;
            if new_top < 0.0 {
                return;
            }
            state.top = new_top;
            state.left = self.binding.scroll_left();
            if !state.tracking {
                state.tracking = true;
                state.measure_top = new_top;
                state.measure_time = self.timer.now();
            }
            [state.debounce.take(), state.settle.take()]
        };
        for id in stale.into_iter().flatten() {
            self.timer.cancel(id);
        }

        self.scrolled.fire(&());

        let this = self.this.clone();
        let id = self.timer.delay(
            move || {
                if let Some(viewport) = this.upgrade() {
                    viewport.scroll_deferred();
                }
            },
            self.config.scroll_debounce_ms,
        );
        self.state.borrow_mut().debounce = Some(id);
    }

    /// Feed a resize from the host. Always fires a rebuild change.
    pub fn handle_resize(&self) {
        let size = self.binding.size();
        self.state.borrow_mut().size = size;
        self.changed(true, 0.0);
    }

    /// Re-read the binding and fire a rebuild change (startup, media-query
    /// reflow).
    pub fn request_rebuild(&self) {
        let top = self.binding.scroll_top();
        {
            let mut state = self.state.borrow_mut();
            if top >= 0.0 {
                state.top = top;
            }
            state.left = self.binding.scroll_left();
            state.size = self.binding.size();
        }
        self.changed(true, 0.0);
    }

    fn scroll_deferred(&self) {
        let new_top = self.binding.scroll_top();
        let now = self.timer.now();
        let velocity = {
            let mut state = self.state.borrow_mut();
            state.debounce = None;
            let new_top = if new_top < 0.0 { state.top } else { new_top };
            let velocity = if now != state.measure_time {
                (new_top - state.measure_top) / (now - state.measure_time) as f64
            } else {
                0.0
            };
            state.top = new_top;
            state.measure_top = new_top;
            state.measure_time = now;
            if velocity.abs() < self.config.min_velocity {
                state.tracking = false;
            }
            velocity
        };
        tracing::trace!(top = new_top, velocity, "scroll measured");

        if velocity.abs() < self.config.min_velocity {
            self.changed(false, velocity);
            return;
        }

        let this = self.this.clone();
        let id = self.timer.delay(
            move || {
                if let Some(viewport) = this.upgrade() {
                    let idle = viewport.state.borrow().debounce.is_none();
                    if idle {
                        viewport.state.borrow_mut().settle = None;
                        viewport.scroll_deferred();
                    }
                }
            },
            self.config.settle_check_ms,
        );
        self.state.borrow_mut().settle = Some(id);
    }

    fn changed(&self, rebuild: bool, velocity: f64) {
        let event = {
            let state = self.state.borrow();
            ViewportChange {
                rebuild,
                top: state.top,
                width: state.size.width,
                height: state.size.height,
                velocity,
            }
        };
        tracing::debug!(
            rebuild,
            top = event.top,
            bottom = event.top + event.height,
            velocity,
            "viewport changed"
        );
        self.changed.fire(&event);
    }
}

impl ViewportService for Viewport {
    fn top(&self) -> f64 {
        self.state.borrow().top
    }

    fn size(&self) -> Size {
        self.state.borrow().size
    }

    fn rect(&self) -> LayoutRect {
        let state = self.state.borrow();
        LayoutRect::ltwh(state.left, state.top, state.size.width, state.size.height)
    }

    fn client_to_layout(&self, client: LayoutRect) -> LayoutRect {
        let state = self.state.borrow();
        client.translate(state.left, state.top).rounded()
    }

    fn on_changed(&self, handler: Box<dyn Fn(&ViewportChange)>) -> Unlisten {
        self.changed.add(handler)
    }

    fn on_scroll(&self, handler: Box<dyn Fn(&())>) -> Unlisten {
        self.scrolled.add(handler)
    }
}

impl IntersectionSource for Viewport {
    fn intersection(&self, element: &dyn Element) -> IntersectionEntry {
        let size = self.size();
        let root = LayoutRect::ltwh(0.0, 0.0, size.width, size.height);
        IntersectionEntry::compute(element.bounding_client_rect(), root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    struct Fixed(LayoutRect);

    impl Element for Fixed {
        fn bounding_client_rect(&self) -> LayoutRect {
            self.0
        }
    }

    fn setup() -> (Rc<ManualClock>, Timer, Rc<ManualBinding>, Rc<Viewport>, Rc<RefCell<Vec<ViewportChange>>>) {
        let clock = Rc::new(ManualClock::new(0));
        let timer = Timer::new(clock.clone());
        let binding = Rc::new(ManualBinding::new(Size::new(400.0, 800.0)));
        let viewport = Viewport::new(binding.clone(), timer.clone(), ViewportConfig::default());
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        let _listen = viewport.on_changed(Box::new(move |event| sink.borrow_mut().push(*event)));
        (clock, timer, binding, viewport, events)
    }

    #[test]
    fn test_scroll_burst_fires_once_after_debounce() {
        let (clock, timer, binding, viewport, events) = setup();
        for (at, top) in [(0, 10.0), (100, 12.0), (200, 14.0)] {
            clock.set(at);
            binding.set_scroll_top(top);
            viewport.handle_scroll();
        }

        timer.advance(&clock, 499);
        assert!(events.borrow().is_empty());
        timer.advance(&clock, 1);
        assert_eq!(events.borrow().len(), 1);
        assert_eq!(clock.now(), 700);

        let event = events.borrow()[0];
        assert!(!event.rebuild);
        assert_eq!(event.top, 14.0);
        assert!(event.velocity > 0.0);

        timer.advance(&clock, 5000);
        assert_eq!(events.borrow().len(), 1);
    }

    #[test]
    fn test_fast_scroll_waits_until_settled() {
        let (clock, timer, binding, viewport, events) = setup();
        binding.set_scroll_top(0.0);
        viewport.handle_scroll();
        binding.set_scroll_top(2000.0);
        viewport.handle_scroll();

        // 2000px over 500ms is far above the settle threshold.
        timer.advance(&clock, 500);
        assert!(events.borrow().is_empty());

        timer.advance(&clock, 250);
        assert_eq!(events.borrow().len(), 1);
        assert_eq!(events.borrow()[0].velocity, 0.0);
        assert_eq!(events.borrow()[0].top, 2000.0);
    }

    #[test]
    fn test_overscroll_is_ignored() {
        let (clock, timer, binding, viewport, events) = setup();
        binding.set_scroll_top(-30.0);
        viewport.handle_scroll();
        assert_eq!(viewport.top(), 0.0);
        timer.advance(&clock, 1000);
        assert!(events.borrow().is_empty());
        assert!(viewport.has_scrolled());
    }

    #[test]
    fn test_resize_fires_rebuild_immediately() {
        let (_clock, _timer, binding, viewport, events) = setup();
        binding.set_size(Size::new(800.0, 600.0));
        viewport.handle_resize();

        let event = events.borrow()[0];
        assert!(event.rebuild);
        assert_eq!(event.width, 800.0);
        assert_eq!(event.height, 600.0);
        assert_eq!(viewport.size(), Size::new(800.0, 600.0));
    }

    #[test]
    fn test_layout_rect_adds_scroll_and_rounds() {
        let (_clock, _timer, binding, viewport, _events) = setup();
        binding.set_scroll_top(100.0);
        viewport.handle_scroll();

        let element = Fixed(LayoutRect::ltwh(10.2, 20.6, 99.5, 49.4));
        let rect = viewport.layout_rect(&element);
        assert_eq!(rect, LayoutRect::ltwh(10.0, 121.0, 100.0, 49.0));
    }

    #[test]
    fn test_raw_scroll_observers() {
        let (_clock, _timer, binding, viewport, _events) = setup();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let _unlisten = viewport.on_scroll(Box::new(move |_| counter.set(counter.get() + 1)));

        binding.set_scroll_top(5.0);
        viewport.handle_scroll();
        viewport.handle_scroll();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_intersection_uses_viewport_size() {
        let (_clock, _timer, _binding, viewport, _events) = setup();
        let element = Fixed(LayoutRect::ltwh(0.0, 700.0, 400.0, 200.0));
        let entry = viewport.intersection(&element);
        assert_eq!(entry.visible_percentage(), 50.0);
    }
}
