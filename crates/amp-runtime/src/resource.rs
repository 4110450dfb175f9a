//! Resource
//!
//! The scheduler's wrapper around one managed element: layout readiness,
//! the measured document box, the load state machine and the active flag.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use futures::FutureExt;
use futures::future::{self, LocalBoxFuture, Shared};

use crate::backoff::{JitterFn, RetryPolicy, with_retry};
use crate::element::{AmpElement, LoadError};
use crate::layout_rect::LayoutRect;
use crate::timer::Timer;
use crate::viewport::ViewportService;

/// Identifies a resource within its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// In-flight load shared by every caller of [`Resource::load`].
pub type LoadFuture = Shared<LocalBoxFuture<'static, Result<(), LoadError>>>;

enum LoadState {
    NotLoaded,
    Loading(LoadFuture),
    Loaded,
    Failed(LoadError),
}

/// One managed element.
pub struct Resource {
    id: ResourceId,
    this: Weak<Resource>,
    element: Rc<dyn AmpElement>,
    timer: Timer,
    retry: RetryPolicy,
    jitter: JitterFn,
    layout_ready: Cell<bool>,
    /// Cleared on every layout; set by the next measure.
    layout_box: Cell<Option<LayoutRect>>,
    load: RefCell<LoadState>,
    active: Cell<bool>,
    activating: Cell<bool>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("layout_ready", &self.layout_ready.get())
            .field("layout_box", &self.layout_box.get())
            .field("loaded", &self.is_loaded())
            .field("loading", &self.is_loading())
            .field("failed", &self.is_loading_failed())
            .field("active", &self.active.get())
            .finish()
    }
}

impl Resource {
    pub fn new(
        id: ResourceId,
        element: Rc<dyn AmpElement>,
        timer: Timer,
        retry: RetryPolicy,
        jitter: JitterFn,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            element,
            timer,
            retry,
            jitter,
            layout_ready: Cell::new(false),
            layout_box: Cell::new(None),
            load: RefCell::new(LoadState::NotLoaded),
            active: Cell::new(false),
            activating: Cell::new(false),
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn element(&self) -> &Rc<dyn AmpElement> {
        &self.element
    }

    pub fn is_layout_ready(&self) -> bool {
        self.layout_ready.get()
    }

    /// Apply media queries and sizes. The box must be measured again
    /// afterwards.
    pub fn layout(&self) {
        self.element.apply_media_query();
        self.element.layout();
        self.layout_ready.set(true);
        self.layout_box.set(None);
    }

    /// Read the element's document box.
    ///
    /// # Panics
    /// If the resource has not been laid out.
    pub fn measure(&self, viewport: &dyn ViewportService) {
        assert!(
            self.layout_ready.get(),
            "resource {} measured before layout",
            self.id
        );
        let rect = viewport.client_to_layout(self.element.bounding_client_rect());
        self.layout_box.set(Some(rect));
    }

    /// Is there a box measured since the last layout?
    pub fn is_measured(&self) -> bool {
        self.layout_box.get().is_some()
    }

    /// The measured document box.
    ///
    /// # Panics
    /// If no measure has run since the resource was last laid out.
    pub fn layout_box(&self) -> LayoutRect {
        match self.layout_box.get() {
            Some(rect) => rect,
            None => panic!("layout box of resource {} read before measure", self.id),
        }
    }

    /// The measured box, or `None` before the first measure.
    pub fn try_layout_box(&self) -> Option<LayoutRect> {
        self.layout_box.get()
    }

    /// Zero-height boxes are never loaded or activated by the scheduler.
    pub fn is_displayed(&self) -> bool {
        self.layout_box.get().is_some_and(|rect| rect.height > 0.0)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.load.borrow(), LoadState::Loaded)
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.load.borrow(), LoadState::Loading(_))
    }

    pub fn is_loading_failed(&self) -> bool {
        matches!(*self.load.borrow(), LoadState::Failed(_))
    }

    /// Not loaded, not loading and not failed.
    pub fn can_load(&self) -> bool {
        matches!(*self.load.borrow(), LoadState::NotLoaded)
    }

    pub fn load_error(&self) -> Option<LoadError> {
        match &*self.load.borrow() {
            LoadState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Start loading, retrying per the resource's policy.
    ///
    /// Calls made while a load is in flight return the same future. Once
    /// settled, the outcome is returned without loading again.
    pub fn load(&self) -> LoadFuture {
        match &*self.load.borrow() {
            LoadState::Loading(pending) => return pending.clone(),
            LoadState::Loaded => return future::ready(Ok(())).boxed_local().shared(),
            LoadState::Failed(err) => return future::ready(Err(err.clone())).boxed_local().shared(),
            LoadState::NotLoaded => {}
        }

        tracing::debug!(resource = %self.id, "load started");
        let element = self.element.clone();
        let timer = self.timer.clone();
        let retry = self.retry;
        let jitter = self.jitter.clone();
        let this = self.this.clone();
        let pending = async move {
            let result = with_retry(&retry, &timer, &jitter, || element.load()).await;
            if let Some(resource) = this.upgrade() {
                resource.load_settled(&result);
            }
            result
        }
        .boxed_local()
        .shared();

        *self.load.borrow_mut() = LoadState::Loading(pending.clone());
        self.timer.spawn_local(pending.clone().map(|_| ()));
        pending
    }

    fn load_settled(&self, result: &Result<(), LoadError>) {
        let state = match result {
            Ok(()) => {
                tracing::debug!(resource = %self.id, "loaded");
                LoadState::Loaded
            }
            Err(err) => {
                tracing::warn!(resource = %self.id, error = %err, "load failed, giving up");
                LoadState::Failed(err.clone())
            }
        };
        *self.load.borrow_mut() = state;
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Is an activation waiting on a load?
    pub fn is_activating(&self) -> bool {
        self.activating.get()
    }

    /// Move the resource in or out of the active state. No-op if the state
    /// already matches.
    ///
    /// Activating an unloaded resource loads it first and activates once the
    /// load succeeds, provided the resource is still active by then.
    pub fn set_active(&self, active: bool) {
        if self.active.get() == active {
            return;
        }
        self.active.set(active);

        if !active {
            self.activating.set(false);
            if self.is_loaded() {
                self.element.deactivate();
            }
            tracing::trace!(resource = %self.id, "deactivated");
            return;
        }

        if self.is_loaded() {
            self.activate_now();
        } else if self.is_loading_failed() {
            tracing::trace!(resource = %self.id, "not activating, load failed");
        } else {
            self.activating.set(true);
            let load = self.load();
            let this = self.this.clone();
            self.timer.spawn_local(async move {
                let loaded = load.await.is_ok();
                let Some(resource) = this.upgrade() else { return };
                if !resource.activating.replace(false) {
                    return;
                }
                if loaded && resource.active.get() {
                    resource.activate_now();
                }
            });
        }
    }

    fn activate_now(&self) {
        match self.element.activate() {
            Ok(()) => tracing::trace!(resource = %self.id, "activated"),
            Err(err) => tracing::trace!(resource = %self.id, error = %err, "activation failed"),
        }
    }
}
