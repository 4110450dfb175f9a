//! Resources
//!
//! The pass-based scheduler. Each pass relayouts and remeasures what needs
//! it, starts loads inside the load window, toggles the active state at the
//! active window boundary, tops up with idle loads and schedules the next
//! pass.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::backoff::{JitterFn, default_jitter};
use crate::config::ResourcesConfig;
use crate::element::{AmpElement, same_element};
use crate::observable::Unlisten;
use crate::pass::Pass;
use crate::resource::{Resource, ResourceId};
use crate::timer::Timer;
use crate::viewport::ViewportService;

/// Visibility of the whole document to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DocumentState {
    #[default]
    Visible,
    /// Nothing loads and nothing is active.
    Hidden,
    /// Only resources overlapping the viewport load; nothing is active.
    Prerender,
}

/// Decides when the scheduler should load beyond the load window.
#[derive(Debug, Clone)]
pub struct IdleLoadPolicy {
    timeout_ms: u64,
    batch: usize,
    last_load_start: u64,
}

impl IdleLoadPolicy {
    pub fn new(timeout_ms: u64, batch: usize, now: u64) -> Self {
        Self {
            timeout_ms,
            batch,
            last_load_start: now,
        }
    }

    pub fn record_load_start(&mut self, now: u64) {
        self.last_load_start = self.last_load_start.max(now);
    }

    /// Has no load started for at least the idle timeout?
    pub fn is_idle(&self, now: u64) -> bool {
        now.saturating_sub(self.last_load_start) >= self.timeout_ms
    }

    /// Most resources one idle scan may start.
    pub fn batch(&self) -> usize {
        self.batch
    }
}

/// Spaces passes further apart the longer nothing has been loading.
#[derive(Debug, Clone)]
pub struct PassDelayPolicy {
    min_ms: u64,
    max_ms: u64,
    last_activity: u64,
}

impl PassDelayPolicy {
    pub fn new(min_ms: u64, max_ms: u64, now: u64) -> Self {
        Self {
            min_ms,
            max_ms,
            last_activity: now,
        }
    }

    /// A load started or settled at `now`.
    pub fn record_activity(&mut self, now: u64) {
        self.last_activity = self.last_activity.max(now);
    }

    /// Twice the time since the last loading activity, clamped.
    pub fn next_delay(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity)
            .saturating_mul(2)
            .clamp(self.min_ms, self.max_ms)
    }
}

/// Load and active windows of one pass, in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassWindows {
    pub load_top: f64,
    pub load_bottom: f64,
    pub active_top: f64,
    pub active_bottom: f64,
}

impl PassWindows {
    /// Windows around a viewport at `top` with height `height`, biased by the
    /// sign of `velocity`.
    pub fn compute(config: &ResourcesConfig, top: f64, height: f64, velocity: f64) -> Self {
        let bottom = top + height;
        let mut load_top = top - height * config.load_margin;
        let mut load_bottom = bottom + height * config.load_margin;
        if velocity > 0.0 {
            load_bottom += height * config.scroll_extension;
        } else if velocity < 0.0 {
            load_top -= height * config.scroll_extension;
        }
        Self {
            load_top,
            load_bottom,
            active_top: top - height * config.active_margin,
            active_bottom: bottom + height * config.active_margin,
        }
    }
}

/// Summary of one pass, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub relayouts: usize,
    pub loads_started: usize,
    pub idle_loads_started: usize,
    pub activated: usize,
    pub deactivated: usize,
    pub next_pass_delay: u64,
}

/// Resource scheduler for one document.
pub struct Resources {
    this: Weak<Resources>,
    timer: Timer,
    viewport: Rc<dyn ViewportService>,
    config: ResourcesConfig,
    jitter: JitterFn,
    resources: RefCell<Vec<Rc<Resource>>>,
    next_id: Cell<u64>,
    pass: Rc<Pass>,
    rebuild: Cell<bool>,
    velocity: Cell<f64>,
    document_state: Cell<DocumentState>,
    idle: RefCell<IdleLoadPolicy>,
    pass_delay: RefCell<PassDelayPolicy>,
    pass_count: Cell<u64>,
    last_report: Cell<Option<PassReport>>,
    unlisten: RefCell<Option<Unlisten>>,
    disposed: Cell<bool>,
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("resources", &self.resources.borrow().len())
            .field("document_state", &self.document_state.get())
            .field("pass_count", &self.pass_count.get())
            .finish()
    }
}

impl Resources {
    pub fn new(timer: Timer, viewport: Rc<dyn ViewportService>, config: ResourcesConfig) -> Rc<Self> {
        Self::with_jitter(timer, viewport, config, default_jitter())
    }

    /// Like [`new`](Self::new), with the jitter used between load retries.
    pub fn with_jitter(
        timer: Timer,
        viewport: Rc<dyn ViewportService>,
        config: ResourcesConfig,
        jitter: JitterFn,
    ) -> Rc<Self> {
        let now = timer.now();
        let resources = Rc::new_cyclic(|this: &Weak<Resources>| {
            let weak = this.clone();
            let pass = Pass::new(timer.clone(), move || {
                if let Some(resources) = weak.upgrade() {
                    resources.do_pass();
                }
            });
            Self {
                this: this.clone(),
                timer,
                viewport: viewport.clone(),
                idle: RefCell::new(IdleLoadPolicy::new(config.idle_timeout_ms, config.idle_batch, now)),
                pass_delay: RefCell::new(PassDelayPolicy::new(
                    config.min_pass_delay_ms,
                    config.max_pass_delay_ms,
                    now,
                )),
                config,
                jitter,
                resources: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
                pass,
                rebuild: Cell::new(false),
                velocity: Cell::new(0.0),
                document_state: Cell::new(DocumentState::Visible),
                pass_count: Cell::new(0),
                last_report: Cell::new(None),
                unlisten: RefCell::new(None),
                disposed: Cell::new(false),
            }
        });

        let weak = Rc::downgrade(&resources);
        let unlisten = viewport.on_changed(Box::new(move |change| {
            if let Some(resources) = weak.upgrade() {
                resources.velocity.set(change.velocity);
                resources.schedule_pass(change.rebuild, 0);
            }
        }));
        *resources.unlisten.borrow_mut() = Some(unlisten);
        resources
    }

    /// Register `element`. The next pass lays it out and measures it.
    pub fn add(&self, element: Rc<dyn AmpElement>) -> ResourceId {
        let id = ResourceId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let resource = Resource::new(
            id,
            element,
            self.timer.clone(),
            self.config.load_retry,
            self.jitter.clone(),
        );
        self.resources.borrow_mut().push(resource);
        tracing::debug!(resource = %id, "resource added");
        self.schedule_pass(false, 0);
        id
    }

    /// Unregister `element`, deactivating it first. Returns whether it was
    /// registered.
    pub fn remove(&self, element: &Rc<dyn AmpElement>) -> bool {
        let removed = {
            let mut list = self.resources.borrow_mut();
            list.iter()
                .position(|r| same_element(r.element(), element))
                .map(|index| list.remove(index))
        };
        match removed {
            Some(resource) => {
                resource.set_active(false);
                tracing::debug!(resource = %resource.id(), "resource removed");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, element: &Rc<dyn AmpElement>) -> Option<Rc<Resource>> {
        self.resources
            .borrow()
            .iter()
            .find(|r| same_element(r.element(), element))
            .cloned()
    }

    pub fn get_by_id(&self, id: ResourceId) -> Option<Rc<Resource>> {
        self.resources.borrow().iter().find(|r| r.id() == id).cloned()
    }

    /// Snapshot of the registered resources, top to bottom once measured.
    pub fn resources(&self) -> Vec<Rc<Resource>> {
        self.resources.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.resources.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.borrow().is_empty()
    }

    /// Request a pass in `delay` ms. Rebuild requests accumulate until the
    /// pass runs. Ignored once disposed.
    pub fn schedule_pass(&self, rebuild: bool, delay: u64) {
        if self.disposed.get() {
            return;
        }
        if rebuild {
            self.rebuild.set(true);
        }
        self.pass.schedule(delay);
    }

    pub fn is_pass_scheduled(&self) -> bool {
        self.pass.is_pending()
    }

    /// Passes run so far.
    pub fn pass_count(&self) -> u64 {
        self.pass_count.get()
    }

    pub fn last_report(&self) -> Option<PassReport> {
        self.last_report.get()
    }

    pub fn document_state(&self) -> DocumentState {
        self.document_state.get()
    }

    pub fn set_document_state(&self, state: DocumentState) {
        let previous = self.document_state.replace(state);
        if previous == state {
            return;
        }
        tracing::debug!(?previous, ?state, "document state changed");
        if state != DocumentState::Visible {
            for resource in self.resources() {
                resource.set_active(false);
            }
        }
        self.schedule_pass(false, 0);
    }

    /// Stop listening to the viewport and drop the pending pass. No pass
    /// runs afterwards, even when an in-flight load settles.
    pub fn dispose(&self) {
        self.disposed.set(true);
        if let Some(unlisten) = self.unlisten.borrow_mut().take() {
            unlisten.call();
        }
        self.pass.cancel();
    }

    fn start_load(&self, resource: &Rc<Resource>) {
        let now = self.timer.now();
        self.idle.borrow_mut().record_load_start(now);
        self.pass_delay.borrow_mut().record_activity(now);

        let pending = resource.load();
        let this = self.this.clone();
        self.timer.spawn_local(async move {
            let _ = pending.await;
            if let Some(resources) = this.upgrade() {
                let now = resources.timer.now();
                resources.pass_delay.borrow_mut().record_activity(now);
                resources.schedule_pass(false, resources.config.post_load_pass_delay_ms);
            }
        });
    }

    fn do_pass(&self) {
        let rebuild = self.rebuild.replace(false);
        let pass = self.pass_count.get() + 1;
        self.pass_count.set(pass);
        let now = self.timer.now();
        let state = self.document_state.get();
        let mut report = PassReport::default();

        // Phase 1: relayout.
        let mut resources = self.resources();
        for r in &resources {
            if rebuild || !r.is_layout_ready() {
                r.layout();
                report.relayouts += 1;
            }
        }

        // Phase 2: remeasure and sort top to bottom. Resources added during
        // layout are measured next pass and sort last until then.
        if report.relayouts > 0 {
            for r in &resources {
                r.measure(self.viewport.as_ref());
            }
            let top = |r: &Rc<Resource>| r.try_layout_box().map_or(f64::INFINITY, |rect| rect.top);
            let mut list = self.resources.borrow_mut();
            list.sort_by(|a, b| {
                top(a)
                    .total_cmp(&top(b))
                    .then_with(|| a.element().document_order().cmp(&b.element().document_order()))
            });
            resources = list.clone();
        }

        let viewport = self.viewport.rect();
        let windows = PassWindows::compute(&self.config, viewport.top, viewport.height, self.velocity.get());
        tracing::debug!(
            pass,
            rebuild,
            ?state,
            relayouts = report.relayouts,
            load_top = windows.load_top,
            load_bottom = windows.load_bottom,
            "pass started"
        );

        // Phase 3: load window.
        let (load_top, load_bottom) = match state {
            DocumentState::Visible => (windows.load_top, windows.load_bottom),
            DocumentState::Prerender => (viewport.top, viewport.bottom()),
            DocumentState::Hidden => (f64::INFINITY, f64::NEG_INFINITY),
        };
        for r in &resources {
            if r.is_displayed() && r.can_load() && r.layout_box().overlaps_band(load_top, load_bottom) {
                tracing::trace!(resource = %r.id(), "in load window");
                self.start_load(r);
                report.loads_started += 1;
            }
        }

        // Phase 4: active window.
        for r in &resources {
            let should_be_active = state == DocumentState::Visible
                && r.is_displayed()
                && !r.is_loading_failed()
                && r.layout_box().overlaps_band(windows.active_top, windows.active_bottom);
            if r.is_active() != should_be_active {
                r.set_active(should_be_active);
                if should_be_active {
                    report.activated += 1;
                } else {
                    report.deactivated += 1;
                }
            }
        }

        // Phase 5: idle load.
        let idle = state == DocumentState::Visible && self.idle.borrow().is_idle(now);
        if idle {
            let batch = self.idle.borrow().batch();
            for r in &resources {
                if report.idle_loads_started >= batch {
                    break;
                }
                if r.is_displayed() && r.can_load() {
                    tracing::trace!(resource = %r.id(), "idle load");
                    self.start_load(r);
                    report.idle_loads_started += 1;
                }
            }
        }

        // Phase 6: reschedule.
        report.next_pass_delay = self.pass_delay.borrow().next_delay(now);
        self.last_report.set(Some(report));
        tracing::debug!(
            pass,
            loads = report.loads_started,
            idle_loads = report.idle_loads_started,
            activated = report.activated,
            deactivated = report.deactivated,
            next_pass_delay = report.next_pass_delay,
            "pass finished"
        );
        self.schedule_pass(false, report.next_pass_delay);
    }
}
