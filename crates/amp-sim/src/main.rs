//! AMP Sim - Main Entry Point
//!
//! Scrolls a synthetic page on virtual time and logs what the scheduler does.

use std::rc::Rc;

use amp_runtime::{
    Clock, Config, LayoutRect, LoadError, ManualBinding, ManualClock, Runtime, Size,
    SyntheticElement, SyntheticPage, VisibilitySpec,
};
use anyhow::Context;

const VIEWPORT: Size = Size::new(400.0, 900.0);
const BLOCKS: usize = 30;
const BLOCK_HEIGHT: f64 = 450.0;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Optional JSON config path
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            Config::from_json(&json).with_context(|| format!("parsing config {path}"))?
        }
        None => Config::default(),
    };

    let clock = Rc::new(ManualClock::new(0));
    let binding = Rc::new(ManualBinding::new(VIEWPORT));
    let page = Rc::new(SyntheticPage::new());
    let runtime = Runtime::new(config, clock.clone(), binding.clone(), page.clone())?;

    for i in 0..BLOCKS {
        let element = SyntheticElement::new(
            format!("block-{i}"),
            i,
            LayoutRect::ltwh(0.0, i as f64 * BLOCK_HEIGHT, VIEWPORT.width, BLOCK_HEIGHT),
            binding.clone(),
            runtime.timer().clone(),
        );
        element.set_load_time(80 + (i as u64 % 5) * 40);
        if i % 7 == 6 {
            element.push_load_outcome(Err(LoadError::Network("connection reset".into())));
        }
        page.insert(element.clone());
        runtime.resources().add(element);
    }

    let ad = VisibilitySpec {
        selector: "#block-8".into(),
        total_time_min: Some(1000.0),
        visible_percentage_min: Some(50.0),
        ..VisibilitySpec::default()
    };
    let report_clock = clock.clone();
    runtime.visibility().listen_once(ad, move |report| {
        tracing::info!(
            at = report_clock.now(),
            total_visible_time = report.total_visible_time,
            max_continuous_visible_time = report.max_continuous_visible_time,
            "ad visibility reached"
        );
    })?;

    runtime.start();
    runtime.timer().advance(&clock, 2000);

    // Flick down the page in small steps, then read for a while.
    for step in 1..=40 {
        binding.set_scroll_top(step as f64 * 100.0);
        runtime.viewport().handle_scroll();
        runtime.timer().advance(&clock, 16);
    }
    runtime.timer().advance(&clock, 8000);

    binding.set_scroll_top(2200.0);
    runtime.viewport().handle_scroll();
    runtime.timer().advance(&clock, 20_000);

    let resources = runtime.resources();
    let loaded = page.elements().iter().filter(|e| e.load_count() > 0).count();
    let active: Vec<_> = page
        .elements()
        .iter()
        .filter(|e| e.is_activated())
        .map(|e| e.id().to_string())
        .collect();
    let failed = resources
        .resources()
        .iter()
        .filter(|r| r.is_loading_failed())
        .count();
    tracing::info!(
        elapsed_ms = clock.now(),
        passes = resources.pass_count(),
        loaded,
        failed,
        ?active,
        "simulation finished"
    );

    runtime.dispose();
    Ok(())
}
