//! Per-connection dirty-region tracking (C3).
//!
//! Each connection owns one [`DamageRegion`]. The hub pushes marks into every connection's
//! region independently, so a slow client accumulating an unbounded backlog never affects a
//! fast one. Coalescing rectangles is a quality-of-service nicety, not a correctness
//! requirement: sending more, smaller rectangles than strictly necessary is fine; sending too
//! few (losing damage) is not.

use std::sync::Mutex;

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub w: u16,
    /// Height in pixels.
    pub h: u16,
}

impl Rect {
    /// Constructs a rectangle, clamping zero-area rectangles down to `(0, 0, 0, 0)` so callers
    /// don't need to special-case them.
    #[must_use]
    pub fn new(x: u16, y: u16, w: u16, h: u16) -> Self {
        if w == 0 || h == 0 {
            Self { x: 0, y: 0, w: 0, h: 0 }
        } else {
            Self { x, y, w, h }
        }
    }

    /// True if this rectangle covers no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Clips this rectangle to `bounds`, returning `None` if the intersection is empty.
    #[must_use]
    pub fn clip(&self, bounds: Rect) -> Option<Rect> {
        let x0 = self.x.max(bounds.x);
        let y0 = self.y.max(bounds.y);
        let x1 = (u32::from(self.x) + u32::from(self.w)).min(u32::from(bounds.x) + u32::from(bounds.w));
        let y1 = (u32::from(self.y) + u32::from(self.h)).min(u32::from(bounds.y) + u32::from(bounds.h));
        if u32::from(x0) >= x1 || u32::from(y0) >= y1 {
            return None;
        }
        Some(Rect::new(x0, y0, (x1 - u32::from(x0)) as u16, (y1 - u32::from(y0)) as u16))
    }
}

/// The set of rectangles a connection has not yet been sent, approximating the union of all
/// damage since its last drain.
#[derive(Default)]
pub struct DamageRegion {
    rects: Mutex<Vec<Rect>>,
}

impl DamageRegion {
    /// Creates an empty region.
    #[must_use]
    pub fn new() -> Self {
        Self { rects: Mutex::new(Vec::new()) }
    }

    /// Unions `rect` into the region. Adjacent/overlapping rectangles are merged opportunistically
    /// (a simple bounding-box merge with whatever the last mark was) to keep fragmentation down
    /// without needing a general region algebra.
    pub fn mark(&self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut rects = self.rects.lock().unwrap();
        if let Some(last) = rects.last_mut() {
            if rects_touch(*last, rect) {
                *last = bounding_box(*last, rect);
                return;
            }
        }
        rects.push(rect);
    }

    /// Replaces the region with a single rectangle covering the whole surface.
    pub fn mark_all(&self, surface_bounds: Rect) {
        let mut rects = self.rects.lock().unwrap();
        rects.clear();
        if !surface_bounds.is_empty() {
            rects.push(surface_bounds);
        }
    }

    /// Drains the region, returning every pending rectangle clipped to `surface_bounds`. The
    /// region is empty after this call. Rectangles that fall entirely outside the current
    /// surface (e.g. after a shrinking `change_surface`) are silently dropped.
    pub fn drain_intersect(&self, surface_bounds: Rect) -> Vec<Rect> {
        let mut rects = self.rects.lock().unwrap();
        rects
            .drain(..)
            .filter_map(|r| r.clip(surface_bounds))
            .collect()
    }

    /// True if there is no pending damage.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rects.lock().unwrap().is_empty()
    }
}

/// True if `a` and `b` overlap or share a border, i.e. merging them into their bounding box
/// adds no area that belongs to neither rectangle's immediate neighbourhood.
fn rects_touch(a: Rect, b: Rect) -> bool {
    let (ax0, ay0, ax1, ay1) = span(a);
    let (bx0, by0, bx1, by1) = span(b);
    ax0 <= bx1 && bx0 <= ax1 && ay0 <= by1 && by0 <= ay1
}

fn span(r: Rect) -> (u32, u32, u32, u32) {
    (
        u32::from(r.x),
        u32::from(r.y),
        u32::from(r.x) + u32::from(r.w),
        u32::from(r.y) + u32::from(r.h),
    )
}

fn bounding_box(a: Rect, b: Rect) -> Rect {
    let x0 = a.x.min(b.x);
    let y0 = a.y.min(b.y);
    let x1 = (u32::from(a.x) + u32::from(a.w)).max(u32::from(b.x) + u32::from(b.w));
    let y1 = (u32::from(a.y) + u32::from(a.h)).max(u32::from(b.y) + u32::from(b.h));
    Rect::new(x0, y0, (x1 - u32::from(x0)) as u16, (y1 - u32::from(y0)) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_drain_round_trips_a_single_rect() {
        let region = DamageRegion::new();
        region.mark(Rect::new(1, 2, 3, 4));
        let bounds = Rect::new(0, 0, 100, 100);
        let drained = region.drain_intersect(bounds);
        assert_eq!(drained, vec![Rect::new(1, 2, 3, 4)]);
        assert!(region.is_empty());
    }

    #[test]
    fn drain_clips_to_shrunk_surface() {
        let region = DamageRegion::new();
        region.mark(Rect::new(40, 40, 50, 50));
        let drained = region.drain_intersect(Rect::new(0, 0, 50, 50));
        assert_eq!(drained, vec![Rect::new(40, 40, 10, 10)]);
    }

    #[test]
    fn drain_drops_damage_entirely_outside_surface() {
        let region = DamageRegion::new();
        region.mark(Rect::new(200, 200, 10, 10));
        let drained = region.drain_intersect(Rect::new(0, 0, 50, 50));
        assert!(drained.is_empty());
    }

    #[test]
    fn mark_all_covers_the_full_surface() {
        let region = DamageRegion::new();
        let bounds = Rect::new(0, 0, 100, 80);
        region.mark_all(bounds);
        let drained = region.drain_intersect(bounds);
        assert_eq!(drained, vec![bounds]);
    }
}
