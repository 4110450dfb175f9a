//! Layout Rectangles
//!
//! Document-relative boxes and the small amount of geometry the scheduler
//! needs: overlap tests, margins, intersections.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl LayoutRect {
    /// Rectangle from left, top, width and height.
    pub const fn ltwh(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self { left, top, width, height }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Inclusive overlap on both axes. Touching edges count as overlapping.
    pub fn overlaps(&self, other: &LayoutRect) -> bool {
        self.top <= other.bottom()
            && other.top <= self.bottom()
            && self.left <= other.right()
            && other.left <= self.right()
    }

    /// Does this box reach into the vertical band `[top, bottom]`?
    pub fn overlaps_band(&self, top: f64, bottom: f64) -> bool {
        self.top <= bottom && top <= self.bottom()
    }

    /// Intersection with another rect, if they share any area.
    pub fn intersect(&self, other: &LayoutRect) -> Option<LayoutRect> {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if right > left && bottom > top {
            Some(LayoutRect::ltwh(left, top, right - left, bottom - top))
        } else {
            None
        }
    }

    /// Grow by `dw` widths horizontally and `dh` heights vertically on each
    /// side.
    pub fn expand(&self, dw: f64, dh: f64) -> LayoutRect {
        let dx = self.width * dw;
        let dy = self.height * dh;
        LayoutRect::ltwh(
            self.left - dx,
            self.top - dy,
            self.width + dx * 2.0,
            self.height + dy * 2.0,
        )
    }

    /// Shift by `dx`, `dy`.
    pub fn translate(&self, dx: f64, dy: f64) -> LayoutRect {
        LayoutRect::ltwh(self.left + dx, self.top + dy, self.width, self.height)
    }

    /// Every coordinate rounded to the nearest integer.
    pub fn rounded(&self) -> LayoutRect {
        LayoutRect::ltwh(
            self.left.round(),
            self.top.round(),
            self.width.round(),
            self.height.round(),
        )
    }
}

/// Viewport size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}
