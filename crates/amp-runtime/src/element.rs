//! Host Element Contracts
//!
//! The runtime never touches the DOM directly. Hosts hand it elements through
//! these traits: plain geometry for anything the visibility tracker watches,
//! plus layout/load/activation hooks for elements the scheduler manages.

use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::layout_rect::LayoutRect;

/// Failure reported by [`AmpElement::load`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("load failed: {0}")]
    Failed(String),
}

/// Failure reported by [`AmpElement::activate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("activation failed: {0}")]
pub struct ActivateError(pub String);

/// Anything with a position on the page.
pub trait Element {
    /// Box relative to the viewport's top-left corner.
    fn bounding_client_rect(&self) -> LayoutRect;

    /// Position in document order. Breaks ties between boxes with the same
    /// top edge.
    fn document_order(&self) -> usize {
        0
    }
}

/// An element whose layout, loading and activation the scheduler drives.
pub trait AmpElement: Element {
    /// Re-evaluate `media` attributes before layout.
    fn apply_media_query(&self) {}

    /// Apply sizes so the element can be measured.
    fn layout(&self);

    /// Fetch whatever the element needs to render.
    fn load(&self) -> LocalBoxFuture<'static, Result<(), LoadError>>;

    /// Called when the element enters the active window after loading.
    fn activate(&self) -> Result<(), ActivateError>;

    /// Called when the element leaves the active window.
    fn deactivate(&self);
}

/// Looks elements up by id.
pub trait Document {
    fn element_by_id(&self, id: &str) -> Option<Rc<dyn Element>>;
}

/// Geometry of one element against its root, as an intersection observer
/// would report it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IntersectionEntry {
    pub bounding_client_rect: LayoutRect,
    pub intersection_rect: LayoutRect,
    pub root_bounds: LayoutRect,
}

impl IntersectionEntry {
    /// Compute the entry for `bounding_client_rect` inside `root_bounds`.
    pub fn compute(bounding_client_rect: LayoutRect, root_bounds: LayoutRect) -> Self {
        Self {
            bounding_client_rect,
            intersection_rect: bounding_client_rect
                .intersect(&root_bounds)
                .unwrap_or_default(),
            root_bounds,
        }
    }

    /// Share of the element's area inside the root, 0 to 100.
    pub fn visible_percentage(&self) -> f64 {
        let area = self.bounding_client_rect.area();
        if area <= 0.0 {
            return 0.0;
        }
        (self.intersection_rect.area() / area * 100.0).clamp(0.0, 100.0)
    }
}

/// Produces intersection entries for elements.
pub trait IntersectionSource {
    fn intersection(&self, element: &dyn Element) -> IntersectionEntry;
}

/// Do two handles point at the same element?
pub fn same_element<A: ?Sized, B: ?Sized>(a: &Rc<A>, b: &Rc<B>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_percentage() {
        let root = LayoutRect::ltwh(0.0, 0.0, 100.0, 100.0);
        let half = IntersectionEntry::compute(LayoutRect::ltwh(0.0, 50.0, 100.0, 100.0), root);
        assert_eq!(half.visible_percentage(), 50.0);

        let outside = IntersectionEntry::compute(LayoutRect::ltwh(0.0, 200.0, 100.0, 100.0), root);
        assert_eq!(outside.visible_percentage(), 0.0);
    }

    #[test]
    fn test_zero_area_is_invisible() {
        let root = LayoutRect::ltwh(0.0, 0.0, 100.0, 100.0);
        let flat = IntersectionEntry::compute(LayoutRect::ltwh(0.0, 10.0, 100.0, 0.0), root);
        assert_eq!(flat.visible_percentage(), 0.0);
    }
}
