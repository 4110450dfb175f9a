//! Runtime - per-document wiring

use std::future::Future;
use std::rc::Rc;

use crate::backoff::{JitterFn, default_jitter};
use crate::clock::Clock;
use crate::config::{Config, ConfigError};
use crate::element::Document;
use crate::poller::{PollError, Poller};
use crate::resources::Resources;
use crate::timer::Timer;
use crate::viewport::{Viewport, ViewportBinding};
use crate::visibility::VisibilityTracker;

/// One document's timer, viewport, scheduler and visibility tracker.
///
/// Every service is built here and handed its dependencies explicitly, so
/// several documents can live side by side.
pub struct Runtime {
    config: Config,
    jitter: JitterFn,
    timer: Timer,
    viewport: Rc<Viewport>,
    resources: Rc<Resources>,
    visibility: Rc<VisibilityTracker>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("timer", &self.timer)
            .field("viewport", &self.viewport)
            .field("resources", &self.resources)
            .field("visibility", &self.visibility)
            .finish()
    }
}

impl Runtime {
    /// Create a runtime for one document.
    pub fn new(
        config: Config,
        clock: Rc<dyn Clock>,
        binding: Rc<dyn ViewportBinding>,
        document: Rc<dyn Document>,
    ) -> Result<Self, ConfigError> {
        Self::with_jitter(config, clock, binding, document, default_jitter())
    }

    /// Like [`new`](Self::new), with a fixed jitter source for load retries
    /// and pollers.
    pub fn with_jitter(
        config: Config,
        clock: Rc<dyn Clock>,
        binding: Rc<dyn ViewportBinding>,
        document: Rc<dyn Document>,
        jitter: JitterFn,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let timer = Timer::new(clock);
        let viewport = Viewport::new(binding, timer.clone(), config.viewport.clone());
        let resources = Resources::with_jitter(
            timer.clone(),
            viewport.clone(),
            config.resources.clone(),
            jitter.clone(),
        );
        let visibility = VisibilityTracker::new(
            timer.clone(),
            viewport.clone(),
            viewport.clone(),
            document,
            config.visibility.clone(),
        );

        tracing::info!("AMP runtime {} initialized", crate::VERSION);
        Ok(Self {
            config,
            jitter,
            timer,
            viewport,
            resources,
            visibility,
        })
    }

    /// Fire the initial rebuild so the first pass lays out every resource.
    pub fn start(&self) {
        tracing::info!("runtime started");
        self.viewport.request_rebuild();
    }

    /// A poller on this document's timer, using the configured jitter and
    /// backoff.
    pub fn poller<F, Fut>(&self, wait: u64, work: F) -> Poller
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), PollError>> + 'static,
    {
        let poller = Poller::with_config(self.timer.clone(), wait, self.config.poller.clone(), work);
        poller.set_jitter(self.jitter.clone());
        poller
    }

    /// Tear down subscriptions and pending work.
    pub fn dispose(&self) {
        self.visibility.dispose();
        self.resources.dispose();
        tracing::info!("runtime disposed");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn viewport(&self) -> &Rc<Viewport> {
        &self.viewport
    }

    pub fn resources(&self) -> &Rc<Resources> {
        &self.resources
    }

    pub fn visibility(&self) -> &Rc<VisibilityTracker> {
        &self.visibility
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::no_jitter;
    use crate::clock::ManualClock;
    use crate::layout_rect::{LayoutRect, Size};
    use crate::synthetic::{SyntheticElement, SyntheticPage};
    use crate::viewport::ManualBinding;

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = Config::default();
        config.resources.min_pass_delay_ms = 60_000;
        let result = Runtime::new(
            config,
            Rc::new(ManualClock::new(0)),
            Rc::new(ManualBinding::new(Size::new(400.0, 800.0))),
            Rc::new(SyntheticPage::new()),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_start_lays_out_registered_resources() {
        let clock = Rc::new(ManualClock::new(0));
        let binding = Rc::new(ManualBinding::new(Size::new(400.0, 800.0)));
        let page = Rc::new(SyntheticPage::new());
        let runtime = Runtime::with_jitter(
            Config::default(),
            clock.clone(),
            binding.clone(),
            page.clone(),
            Rc::new(no_jitter),
        )
        .unwrap();

        let element = SyntheticElement::new(
            "hero",
            0,
            LayoutRect::ltwh(0.0, 0.0, 400.0, 300.0),
            binding,
            runtime.timer().clone(),
        );
        page.insert(element.clone());
        runtime.resources().add(element.clone());
        runtime.start();
        runtime.timer().advance(&clock, 0);

        assert_eq!(element.layout_count(), 1);
        assert!(element.is_activated());
        assert_eq!(runtime.resources().pass_count(), 1);

        runtime.dispose();
        assert!(!runtime.resources().is_pass_scheduled());
    }
}
