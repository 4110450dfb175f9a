//! Property tests
//!
//! Rounding, backoff growth and load window invariants over generated inputs.

use std::rc::Rc;

use amp_runtime::backoff::no_jitter;
use amp_runtime::*;
use proptest::prelude::*;

struct Fixed(LayoutRect);

impl Element for Fixed {
    fn bounding_client_rect(&self) -> LayoutRect {
        self.0
    }
}

fn is_integer(value: f64) -> bool {
    value.fract() == 0.0
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn layout_rect_is_always_integer(
        left in -2000.0f64..2000.0,
        top in -2000.0f64..2000.0,
        width in 0.0f64..2000.0,
        height in 0.0f64..2000.0,
        scroll in 0.0f64..10_000.0,
    ) {
        let clock = Rc::new(ManualClock::new(0));
        let timer = Timer::new(clock);
        let binding = Rc::new(ManualBinding::new(Size::new(400.0, 800.0)));
        binding.set_scroll_top(scroll);
        let viewport = Viewport::new(binding, timer, ViewportConfig::default());

        let rect = viewport.layout_rect(&Fixed(LayoutRect::ltwh(left, top, width, height)));
        prop_assert!(is_integer(rect.top));
        prop_assert!(is_integer(rect.bottom()));
        prop_assert!(is_integer(rect.width));
        prop_assert!(is_integer(rect.height));
    }

    #[test]
    fn backoff_delays_never_shrink(
        base_ms in 1.0f64..5000.0,
        factor in 1.0f64..4.0,
        steps in 1usize..20,
    ) {
        let config = BackoffConfig { base_ms, factor, jitter: 0.0 };
        let mut clock = BackoffClock::new(config, Rc::new(no_jitter));
        let mut previous = clock.next_delay();
        for _ in 0..steps {
            let next = clock.next_delay();
            prop_assert!(next >= previous);
            previous = next;
        }
    }

    #[test]
    fn load_window_decides_first_pass_loads(
        boxes in prop::collection::vec((0.0f64..8000.0, 0.0f64..600.0), 1..24),
        scroll in 0.0f64..4000.0,
    ) {
        let clock = Rc::new(ManualClock::new(0));
        let timer = Timer::new(clock.clone());
        let binding = Rc::new(ManualBinding::new(Size::new(400.0, 1000.0)));
        binding.set_scroll_top(scroll.round());
        let viewport = Viewport::new(binding.clone(), timer.clone(), ViewportConfig::default());
        let config = ResourcesConfig::default();
        let resources = Resources::with_jitter(
            timer.clone(),
            viewport.clone(),
            config.clone(),
            Rc::new(no_jitter),
        );

        let elements: Vec<_> = boxes
            .iter()
            .enumerate()
            .map(|(i, (top, height))| {
                let element = SyntheticElement::new(
                    format!("e{i}"),
                    i,
                    LayoutRect::ltwh(0.0, top.round(), 400.0, height.round()),
                    binding.clone(),
                    timer.clone(),
                );
                resources.add(element.clone());
                element
            })
            .collect();
        timer.advance(&clock, 0);

        let top = viewport.top();
        let windows = PassWindows::compute(&config, top, 1000.0, 0.0);
        for element in &elements {
            let rect = element.document_rect();
            let expected = rect.height != 0.0 && rect.overlaps_band(windows.load_top, windows.load_bottom);
            prop_assert_eq!(element.load_count() == 1, expected, "element at {:?}", rect);
        }
    }
}
