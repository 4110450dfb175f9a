//! Visibility Tracker
//!
//! Watches elements against time and visible-percentage thresholds and fires
//! a one-shot callback once every threshold of a listener holds at the same
//! time.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use crate::config::VisibilityConfig;
use crate::element::{Document, Element, IntersectionSource};
use crate::layout_rect::LayoutRect;
use crate::observable::Unlisten;
use crate::timer::{Timer, TimerId};
use crate::viewport::ViewportService;

/// Visibility spec error
#[derive(Debug, thiserror::Error)]
pub enum VisibilityError {
    #[error("Invalid visibility spec JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("selector must be an id selector such as '#ad', got '{0}'")]
    InvalidSelector(String),

    #[error("no element matches selector '{0}'")]
    ElementNotFound(String),

    #[error("{field} must be a non-negative number, got {value}")]
    InvalidTime { field: &'static str, value: f64 },

    #[error("{0} can only be judged at unload; set `unload: true`")]
    MaxTimeWithoutUnload(&'static str),

    #[error("{max_field} must not be less than {min_field}")]
    MaxBelowMin {
        min_field: &'static str,
        max_field: &'static str,
    },

    #[error("{field} must be within 0..=100, got {value}")]
    InvalidPercentage { field: &'static str, value: f64 },
}

/// Conditions for one visibility listener. Times are in milliseconds,
/// percentages in 0..=100. Unset bounds never constrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VisibilitySpec {
    pub selector: String,
    pub continuous_time_min: Option<f64>,
    pub continuous_time_max: Option<f64>,
    pub total_time_min: Option<f64>,
    pub total_time_max: Option<f64>,
    pub visible_percentage_min: Option<f64>,
    pub visible_percentage_max: Option<f64>,
    /// Judge the listener only when the page unloads.
    pub unload: bool,
}

impl VisibilitySpec {
    /// Parse and validate the analytics JSON form.
    pub fn from_json(json: &str) -> Result<Self, VisibilityError> {
        let spec: VisibilitySpec = serde_json::from_str(json)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), VisibilityError> {
        let id = self.selector.strip_prefix('#').unwrap_or_default();
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(VisibilityError::InvalidSelector(self.selector.clone()));
        }

        let times = [
            ("continuousTimeMin", self.continuous_time_min),
            ("continuousTimeMax", self.continuous_time_max),
            ("totalTimeMin", self.total_time_min),
            ("totalTimeMax", self.total_time_max),
        ];
        for (field, value) in times {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(VisibilityError::InvalidTime { field, value });
                }
            }
        }
        if self.continuous_time_max.is_some() && !self.unload {
            return Err(VisibilityError::MaxTimeWithoutUnload("continuousTimeMax"));
        }
        if self.total_time_max.is_some() && !self.unload {
            return Err(VisibilityError::MaxTimeWithoutUnload("totalTimeMax"));
        }
        check_order(
            "continuousTimeMin",
            self.continuous_time_min,
            "continuousTimeMax",
            self.continuous_time_max,
        )?;
        check_order("totalTimeMin", self.total_time_min, "totalTimeMax", self.total_time_max)?;

        let percentages = [
            ("visiblePercentageMin", self.visible_percentage_min),
            ("visiblePercentageMax", self.visible_percentage_max),
        ];
        for (field, value) in percentages {
            if let Some(value) = value {
                if !(0.0..=100.0).contains(&value) {
                    return Err(VisibilityError::InvalidPercentage { field, value });
                }
            }
        }
        check_order(
            "visiblePercentageMin",
            self.visible_percentage_min,
            "visiblePercentageMax",
            self.visible_percentage_max,
        )
    }

    /// Element id the selector points at.
    pub fn element_id(&self) -> &str {
        self.selector.strip_prefix('#').unwrap_or(&self.selector)
    }

    /// Does `visible` (0..=100) count as in view?
    ///
    /// The range is `(min, max]`, except that a min of 100 matches only full
    /// visibility and a max of 0 matches only none.
    pub fn matches_percentage(&self, visible: f64) -> bool {
        if self.visible_percentage_min == Some(100.0) {
            return visible >= 100.0;
        }
        if self.visible_percentage_max == Some(0.0) {
            return visible <= 0.0;
        }
        visible > self.visible_percentage_min.unwrap_or(0.0)
            && visible <= self.visible_percentage_max.unwrap_or(100.0)
    }
}

fn check_order(
    min_field: &'static str,
    min: Option<f64>,
    max_field: &'static str,
    max: Option<f64>,
) -> Result<(), VisibilityError> {
    match (min, max) {
        (Some(min), Some(max)) if max < min => Err(VisibilityError::MaxBelowMin { min_field, max_field }),
        _ => Ok(()),
    }
}

/// What a listener reports when it fires. Times are milliseconds since the
/// listener was registered; percentages are 0..=100.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityReport {
    pub first_seen_time: u64,
    pub last_seen_time: u64,
    pub first_visible_time: u64,
    pub last_visible_time: u64,
    pub total_visible_time: u64,
    pub max_continuous_visible_time: u64,
    pub min_visible_percentage: f64,
    pub max_visible_percentage: f64,
    pub load_time_visibility: f64,
    pub element_x: f64,
    pub element_y: f64,
    pub element_width: f64,
    pub element_height: f64,
}

/// Per-listener accumulators.
#[derive(Debug, Clone, Default)]
struct ListenerState {
    created: u64,
    /// Start of the current in-view stretch. `None` exactly while out of view.
    last_update: Option<u64>,
    in_viewport: bool,
    ever_in_view: bool,
    continuous_time: u64,
    total_visible_time: u64,
    max_continuous_time: u64,
    first_seen_time: Option<u64>,
    last_seen_time: Option<u64>,
    first_visible_time: Option<u64>,
    last_visible_time: Option<u64>,
    min_visible_percentage: f64,
    max_visible_percentage: f64,
    load_time_visibility: f64,
}

impl ListenerState {
    fn new(created: u64) -> Self {
        Self {
            created,
            ..Self::default()
        }
    }

    /// Fold one observation of `visible` percent at `now` into the counters.
    fn update(&mut self, spec: &VisibilitySpec, visible: f64, now: u64, load_time_window: u64) {
        if visible > 0.0 {
            self.first_seen_time.get_or_insert(now);
            self.last_seen_time = Some(now);
            if self.load_time_visibility == 0.0 && now.saturating_sub(self.created) < load_time_window {
                self.load_time_visibility = visible;
            }
        }

        let was_in_view = self.in_viewport;
        self.in_viewport = spec.matches_percentage(visible);

        if self.in_viewport {
            self.ever_in_view = true;
            match self.last_update {
                Some(last) if was_in_view => {
                    let elapsed = now.saturating_sub(last);
                    self.total_visible_time += elapsed;
                    self.continuous_time += elapsed;
                    self.max_continuous_time = self.max_continuous_time.max(self.continuous_time);
                }
                _ => {
                    self.first_visible_time.get_or_insert(now);
                }
            }
            self.last_update = Some(now);
            self.min_visible_percentage = if self.min_visible_percentage > 0.0 {
                self.min_visible_percentage.min(visible)
            } else {
                visible
            };
            self.max_visible_percentage = self.max_visible_percentage.max(visible);
            self.last_visible_time = Some(now);
        } else if was_in_view {
            let last = self.last_update.take();
            assert!(last.is_some(), "listener left view without an in-view stretch");
            let elapsed = now.saturating_sub(last.unwrap_or(now));
            self.max_continuous_time = self.max_continuous_time.max(self.continuous_time + elapsed);
            self.total_visible_time += elapsed;
            self.continuous_time = 0;
            self.last_visible_time = Some(now);
        }
    }

    /// Outside unload, the element must also be in view right now.
    fn is_satisfied(&self, spec: &VisibilitySpec) -> bool {
        let total = self.total_visible_time as f64;
        let continuous = self.max_continuous_time as f64;
        self.ever_in_view
            && (spec.unload || self.in_viewport)
            && spec.total_time_min.is_none_or(|min| total >= min)
            && spec.total_time_max.is_none_or(|max| total <= max)
            && spec.continuous_time_min.is_none_or(|min| continuous >= min)
            && spec.continuous_time_max.is_none_or(|max| continuous <= max)
    }

    /// Time until the nearest unmet time minimum could be met, assuming the
    /// element stays in view. `None` when no minimum is pending.
    fn time_to_wait(&self, spec: &VisibilitySpec) -> Option<u64> {
        let wait_continuous = (spec.continuous_time_min.unwrap_or(0.0) - self.continuous_time as f64).max(0.0);
        let wait_total = (spec.total_time_min.unwrap_or(0.0) - self.total_visible_time as f64).max(0.0);
        [wait_continuous, wait_total]
            .into_iter()
            .filter(|wait| *wait > 0.0)
            .min_by(f64::total_cmp)
            .map(|wait| wait.ceil() as u64)
    }

    fn report(&self, rect: LayoutRect) -> VisibilityReport {
        let since = |time: Option<u64>| time.map_or(0, |time| time.saturating_sub(self.created));
        VisibilityReport {
            first_seen_time: since(self.first_seen_time),
            last_seen_time: since(self.last_seen_time),
            first_visible_time: since(self.first_visible_time),
            last_visible_time: since(self.last_visible_time),
            total_visible_time: self.total_visible_time,
            max_continuous_visible_time: self.max_continuous_time,
            min_visible_percentage: self.min_visible_percentage,
            max_visible_percentage: self.max_visible_percentage,
            load_time_visibility: self.load_time_visibility,
            element_x: rect.left,
            element_y: rect.top,
            element_width: rect.width,
            element_height: rect.height,
        }
    }
}

/// Handle to a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

type Callback = Box<dyn FnOnce(VisibilityReport)>;

struct Listener {
    id: ListenerId,
    spec: VisibilitySpec,
    element: Rc<dyn Element>,
    state: ListenerState,
    /// Set once the initial delay has passed.
    armed: bool,
    callback: Callback,
}

/// Tracks visibility listeners for one document.
pub struct VisibilityTracker {
    this: Weak<VisibilityTracker>,
    timer: Timer,
    viewport: Rc<dyn ViewportService>,
    intersections: Rc<dyn IntersectionSource>,
    document: Rc<dyn Document>,
    config: VisibilityConfig,
    listeners: RefCell<Vec<Listener>>,
    next_id: Cell<u64>,
    /// Coalesces scroll-driven checks into one microtask.
    check_pending: Cell<bool>,
    /// Timed re-check for listeners waiting on a time minimum.
    timed_check: Cell<Option<TimerId>>,
    unlisten: RefCell<Vec<Unlisten>>,
}

impl fmt::Debug for VisibilityTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilityTracker")
            .field("listeners", &self.listeners.borrow().len())
            .field("timed_check", &self.timed_check.get())
            .finish()
    }
}

impl VisibilityTracker {
    pub fn new(
        timer: Timer,
        viewport: Rc<dyn ViewportService>,
        intersections: Rc<dyn IntersectionSource>,
        document: Rc<dyn Document>,
        config: VisibilityConfig,
    ) -> Rc<Self> {
        let tracker = Rc::new_cyclic(|this| Self {
            this: this.clone(),
            timer,
            viewport: viewport.clone(),
            intersections,
            document,
            config,
            listeners: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
            check_pending: Cell::new(false),
            timed_check: Cell::new(None),
            unlisten: RefCell::new(Vec::new()),
        });

        let weak = Rc::downgrade(&tracker);
        let on_scroll = viewport.on_scroll(Box::new(move |_| {
            if let Some(tracker) = weak.upgrade() {
                tracker.schedule_check();
            }
        }));
        let weak = Rc::downgrade(&tracker);
        let on_changed = viewport.on_changed(Box::new(move |_| {
            if let Some(tracker) = weak.upgrade() {
                tracker.schedule_check();
            }
        }));
        tracker.unlisten.borrow_mut().extend([on_scroll, on_changed]);
        tracker
    }

    /// Register a one-shot listener. The spec is validated and its element
    /// resolved up front; nothing is registered on failure.
    pub fn listen_once<F>(&self, spec: VisibilitySpec, callback: F) -> Result<ListenerId, VisibilityError>
    where
        F: FnOnce(VisibilityReport) + 'static,
    {
        if let Err(err) = spec.validate() {
            tracing::warn!(selector = %spec.selector, error = %err, "visibility spec rejected");
            return Err(err);
        }
        let Some(element) = self.document.element_by_id(spec.element_id()) else {
            tracing::warn!(selector = %spec.selector, "visibility spec rejected, no such element");
            return Err(VisibilityError::ElementNotFound(spec.selector));
        };

        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push(Listener {
            id,
            spec,
            element,
            state: ListenerState::new(self.timer.now()),
            armed: false,
            callback: Box::new(callback),
        });
        tracing::debug!(listener = %id, "visibility listener added");

        let this = self.this.clone();
        self.timer.delay(
            move || {
                if let Some(tracker) = this.upgrade() {
                    tracker.arm(id);
                }
            },
            self.config.initial_delay_ms,
        );
        Ok(id)
    }

    /// Parse `json` as a spec and register it.
    pub fn listen_once_json<F>(&self, json: &str, callback: F) -> Result<ListenerId, VisibilityError>
    where
        F: FnOnce(VisibilityReport) + 'static,
    {
        let spec: VisibilitySpec = serde_json::from_str(json)?;
        self.listen_once(spec, callback)
    }

    /// Drop a listener without firing it.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        before != listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Final evaluation at page unload. Unload listeners whose conditions
    /// hold fire now; the rest are dropped. Returns how many fired.
    pub fn unload(&self) -> usize {
        let fired = self.evaluate(true);
        let dropped = {
            let mut listeners = self.listeners.borrow_mut();
            let before = listeners.len();
            listeners.retain(|l| !l.spec.unload);
            before - listeners.len()
        };
        tracing::debug!(fired, dropped, "visibility unload");
        fired
    }

    /// Stop tracking: unsubscribe from the viewport, cancel pending checks
    /// and drop every listener.
    pub fn dispose(&self) {
        for unlisten in self.unlisten.borrow_mut().drain(..) {
            unlisten.call();
        }
        if let Some(id) = self.timed_check.take() {
            self.timer.cancel(id);
        }
        self.listeners.borrow_mut().clear();
    }

    fn arm(&self, id: ListenerId) {
        let armed = {
            let mut listeners = self.listeners.borrow_mut();
            match listeners.iter_mut().find(|l| l.id == id) {
                Some(listener) => {
                    listener.armed = true;
                    true
                }
                None => false,
            }
        };
        if armed {
            self.evaluate(false);
        }
    }

    fn schedule_check(&self) {
        if self.check_pending.replace(true) {
            return;
        }
        let this = self.this.clone();
        self.timer.delay(
            move || {
                if let Some(tracker) = this.upgrade() {
                    tracker.check_pending.set(false);
                    tracker.evaluate(false);
                }
            },
            0,
        );
    }

    /// Update every armed listener and fire the satisfied ones. Unload
    /// listeners only fire when `unloading`.
    fn evaluate(&self, unloading: bool) -> usize {
        let now = self.timer.now();
        let targets: Vec<(ListenerId, Rc<dyn Element>)> = self
            .listeners
            .borrow()
            .iter()
            .filter(|l| l.armed)
            .map(|l| (l.id, l.element.clone()))
            .collect();
        let observed: Vec<(ListenerId, f64)> = targets
            .into_iter()
            .map(|(id, element)| {
                let visible = self.intersections.intersection(element.as_ref()).visible_percentage();
                (id, visible)
            })
            .collect();

        let mut satisfied = Vec::new();
        let mut next_wait: Option<u64> = None;
        {
            let mut listeners = self.listeners.borrow_mut();
            let mut index = 0;
            while index < listeners.len() {
                let listener = &mut listeners[index];
                let Some(&(_, visible)) = observed.iter().find(|(id, _)| *id == listener.id) else {
                    index += 1;
                    continue;
                };
                listener.state.update(&listener.spec, visible, now, self.config.load_time_window_ms);
                let may_fire = !listener.spec.unload || unloading;
                if may_fire && listener.state.is_satisfied(&listener.spec) {
                    satisfied.push(listeners.remove(index));
                    continue;
                }
                if listener.state.in_viewport {
                    if let Some(wait) = listener.state.time_to_wait(&listener.spec) {
                        next_wait = Some(next_wait.map_or(wait, |current| current.min(wait)));
                    }
                }
                index += 1;
            }
        }

        self.reschedule(next_wait);

        let fired = satisfied.len();
        for listener in satisfied {
            let rect = self.viewport.layout_rect(listener.element.as_ref());
            let report = listener.state.report(rect);
            tracing::debug!(
                listener = %listener.id,
                total_visible_time = report.total_visible_time,
                max_continuous_visible_time = report.max_continuous_visible_time,
                "visibility conditions met"
            );
            (listener.callback)(report);
        }
        fired
    }

    fn reschedule(&self, wait: Option<u64>) {
        if let Some(id) = self.timed_check.take() {
            self.timer.cancel(id);
        }
        let Some(wait) = wait else { return };
        let this = self.this.clone();
        let id = self.timer.delay(
            move || {
                if let Some(tracker) = this.upgrade() {
                    tracker.timed_check.set(None);
                    tracker.evaluate(false);
                }
            },
            wait.max(1),
        );
        self.timed_check.set(Some(id));
    }
}
