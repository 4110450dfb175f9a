//! AMP Runtime
//!
//! The scheduling core of the AMP HTML runtime: a pass-based resource
//! scheduler driven by viewport position and scroll velocity, a visibility
//! tracker for time and percentage thresholds, and a backoff-aware poller.
//!
//! Everything runs on one thread. Each document gets its own [`Runtime`],
//! which owns the [`Timer`] every other service schedules on.
//!
//! # Example
//! ```rust,ignore
//! use amp_runtime::{Config, ManualBinding, ManualClock, Runtime, Size, SyntheticPage};
//!
//! let clock = Rc::new(ManualClock::new(0));
//! let binding = Rc::new(ManualBinding::new(Size::new(400.0, 800.0)));
//! let runtime = Runtime::new(Config::default(), clock.clone(), binding, Rc::new(SyntheticPage::new()))?;
//! runtime.start();
//! runtime.timer().advance(&clock, 1000);
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod element;
pub mod layout_rect;
pub mod observable;
mod pass;
pub mod poller;
pub mod resource;
pub mod resources;
mod runtime;
pub mod synthetic;
pub mod timer;
pub mod viewport;
pub mod visibility;

pub use backoff::{BackoffClock, BackoffConfig, JitterFn, RetryOutcome, RetryPolicy, with_retry, with_retry_outcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError, PollerConfig, ResourcesConfig, ViewportConfig, VisibilityConfig};
pub use element::{ActivateError, AmpElement, Document, Element, IntersectionEntry, IntersectionSource, LoadError};
pub use layout_rect::{LayoutRect, Size};
pub use observable::{Observable, Unlisten};
pub use pass::Pass;
pub use poller::{PollError, Poller};
pub use resource::{Resource, ResourceId};
pub use resources::{DocumentState, IdleLoadPolicy, PassDelayPolicy, PassReport, PassWindows, Resources};
pub use runtime::Runtime;
pub use synthetic::{SyntheticElement, SyntheticPage};
pub use timer::{Timer, TimerError, TimerId, TimerPromise};
pub use viewport::{ManualBinding, Viewport, ViewportBinding, ViewportChange, ViewportService};
pub use visibility::{ListenerId, VisibilityError, VisibilityReport, VisibilitySpec, VisibilityTracker};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
