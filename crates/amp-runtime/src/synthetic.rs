//! Synthetic Page
//!
//! Scriptable elements and documents for headless hosts: the simulator and
//! the test suites drive the runtime through these instead of a real DOM.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use futures::FutureExt;
use futures::future::{self, LocalBoxFuture};

use crate::element::{ActivateError, AmpElement, Document, Element, LoadError};
use crate::layout_rect::LayoutRect;
use crate::timer::Timer;
use crate::viewport::ViewportBinding;

/// Element with a fixed document box and scripted load behaviour.
pub struct SyntheticElement {
    id: String,
    order: usize,
    binding: Rc<dyn ViewportBinding>,
    timer: Timer,
    rect: Cell<LayoutRect>,
    load_time_ms: Cell<u64>,
    outcomes: RefCell<VecDeque<Result<(), LoadError>>>,
    fail_activate: Cell<bool>,
    activated: Cell<bool>,
    layouts: Cell<u32>,
    loads: Cell<u32>,
    activations: Cell<u32>,
    deactivations: Cell<u32>,
}

impl std::fmt::Debug for SyntheticElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticElement")
            .field("id", &self.id)
            .field("rect", &self.rect.get())
            .field("loads", &self.loads.get())
            .field("activated", &self.activated.get())
            .finish()
    }
}

impl SyntheticElement {
    /// `rect` is in document coordinates.
    pub fn new(
        id: impl Into<String>,
        order: usize,
        rect: LayoutRect,
        binding: Rc<dyn ViewportBinding>,
        timer: Timer,
    ) -> Rc<Self> {
        Rc::new(Self {
            id: id.into(),
            order,
            binding,
            timer,
            rect: Cell::new(rect),
            load_time_ms: Cell::new(0),
            outcomes: RefCell::new(VecDeque::new()),
            fail_activate: Cell::new(false),
            activated: Cell::new(false),
            layouts: Cell::new(0),
            loads: Cell::new(0),
            activations: Cell::new(0),
            deactivations: Cell::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn document_rect(&self) -> LayoutRect {
        self.rect.get()
    }

    pub fn set_document_rect(&self, rect: LayoutRect) {
        self.rect.set(rect);
    }

    /// How long each load attempt takes. Zero settles on the next microtask.
    pub fn set_load_time(&self, ms: u64) {
        self.load_time_ms.set(ms);
    }

    /// Queue outcomes for upcoming load attempts. Attempts past the end of
    /// the queue succeed.
    pub fn push_load_outcome(&self, outcome: Result<(), LoadError>) {
        self.outcomes.borrow_mut().push_back(outcome);
    }

    pub fn set_fail_activate(&self, fail: bool) {
        self.fail_activate.set(fail);
    }

    /// Is the element between a successful activate and a deactivate?
    pub fn is_activated(&self) -> bool {
        self.activated.get()
    }

    pub fn layout_count(&self) -> u32 {
        self.layouts.get()
    }

    pub fn load_count(&self) -> u32 {
        self.loads.get()
    }

    pub fn activation_count(&self) -> u32 {
        self.activations.get()
    }

    pub fn deactivation_count(&self) -> u32 {
        self.deactivations.get()
    }
}

impl Element for SyntheticElement {
    fn bounding_client_rect(&self) -> LayoutRect {
        self.rect
            .get()
            .translate(-self.binding.scroll_left(), -self.binding.scroll_top())
    }

    fn document_order(&self) -> usize {
        self.order
    }
}

impl AmpElement for SyntheticElement {
    fn layout(&self) {
        self.layouts.set(self.layouts.get() + 1);
    }

    fn load(&self) -> LocalBoxFuture<'static, Result<(), LoadError>> {
        self.loads.set(self.loads.get() + 1);
        let outcome = self.outcomes.borrow_mut().pop_front().unwrap_or(Ok(()));
        let wait = self.load_time_ms.get();
        if wait == 0 {
            return future::ready(outcome).boxed_local();
        }
        let settle = self.timer.promise(wait, ());
        async move {
            settle
                .await
                .map_err(|err| LoadError::Failed(err.to_string()))?;
            outcome
        }
        .boxed_local()
    }

    fn activate(&self) -> Result<(), ActivateError> {
        self.activations.set(self.activations.get() + 1);
        if self.fail_activate.get() {
            return Err(ActivateError(format!("{} refused to activate", self.id)));
        }
        self.activated.set(true);
        Ok(())
    }

    fn deactivate(&self) {
        self.deactivations.set(self.deactivations.get() + 1);
        self.activated.set(false);
    }
}

/// Id-indexed collection of synthetic elements.
#[derive(Debug, Default)]
pub struct SyntheticPage {
    elements: RefCell<Vec<Rc<SyntheticElement>>>,
    by_id: RefCell<HashMap<String, Rc<SyntheticElement>>>,
}

impl SyntheticPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, element: Rc<SyntheticElement>) {
        self.by_id
            .borrow_mut()
            .insert(element.id().to_string(), element.clone());
        self.elements.borrow_mut().push(element);
    }

    pub fn get(&self, id: &str) -> Option<Rc<SyntheticElement>> {
        self.by_id.borrow().get(id).cloned()
    }

    /// Elements in insertion order.
    pub fn elements(&self) -> Vec<Rc<SyntheticElement>> {
        self.elements.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.elements.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.borrow().is_empty()
    }
}

impl Document for SyntheticPage {
    fn element_by_id(&self, id: &str) -> Option<Rc<dyn Element>> {
        self.get(id).map(|element| element as Rc<dyn Element>)
    }
}
