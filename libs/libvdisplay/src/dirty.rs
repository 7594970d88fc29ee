//! Dirty-Region Tracker
//!
//! Tracks changed screen area as a single bounding rectangle. Adding never
//! fragments the region; the result is an over-approximation of what
//! actually changed.

/// Rectangle with exclusive right/bottom edges
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    /// Left edge
    pub left: i32,
    /// Top edge
    pub top: i32,
    /// Right edge (exclusive)
    pub right: i32,
    /// Bottom edge (exclusive)
    pub bottom: i32,
}

impl Rect {
    /// Construct from edges
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Construct from origin and size
    pub const fn from_size(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::new(x, y, x.saturating_add(width), y.saturating_add(height))
    }

    /// Width, zero if inverted
    pub fn width(&self) -> i32 {
        self.right.saturating_sub(self.left).max(0)
    }

    /// Height, zero if inverted
    pub fn height(&self) -> i32 {
        self.bottom.saturating_sub(self.top).max(0)
    }

    /// Covers no pixels
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Smallest rectangle covering both
    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Share at least one pixel
    pub fn intersects(&self, other: &Rect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }

    /// `other` lies entirely inside `self`
    pub fn contains(&self, other: &Rect) -> bool {
        self.left <= other.left
            && self.right >= other.right
            && self.top <= other.top
            && self.bottom >= other.bottom
    }

    /// Shift by an offset, clamping at the coordinate limits
    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(
            self.left.saturating_add(dx),
            self.top.saturating_add(dy),
            self.right.saturating_add(dx),
            self.bottom.saturating_add(dy),
        )
    }
}

/// One bounding rectangle plus a validity flag
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirtyRegion {
    rect: Rect,
    valid: bool,
}

impl DirtyRegion {
    /// An empty (invalid) region
    pub const fn new() -> Self {
        Self {
            rect: Rect::new(0, 0, 0, 0),
            valid: false,
        }
    }

    /// Whether the region tracks anything
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Tracked rectangle, if any
    pub fn rect(&self) -> Option<Rect> {
        self.valid.then_some(self.rect)
    }

    /// Replace the region; an empty rectangle invalidates it
    pub fn set(&mut self, rect: Rect) {
        if rect.is_empty() {
            self.valid = false;
        } else {
            self.rect = rect;
            self.valid = true;
        }
    }

    /// Grow the region to cover `rect`
    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        if self.valid {
            self.rect = self.rect.union(&rect);
        } else {
            self.set(rect);
        }
    }

    /// Merge another region into this one
    pub fn unite(&mut self, other: &DirtyRegion) {
        if let Some(rect) = other.rect() {
            self.add(rect);
        }
    }

    /// Narrow the region to `rect` along the one axis `rect` fully spans
    ///
    /// If the region's horizontal span lies within `rect`, its vertical span
    /// becomes the intersection with `rect`; symmetric for the vertical case.
    /// An empty intersection invalidates the region.
    pub fn try_substitute(&mut self, rect: &Rect) {
        if !self.valid {
            return;
        }

        if self.rect.left >= rect.left && self.rect.right <= rect.right {
            let top = self.rect.top.max(rect.top);
            let bottom = self.rect.bottom.min(rect.bottom);
            if top < bottom {
                self.rect.top = top;
                self.rect.bottom = bottom;
            } else {
                self.valid = false;
            }
        } else if self.rect.top >= rect.top && self.rect.bottom <= rect.bottom {
            let left = self.rect.left.max(rect.left);
            let right = self.rect.right.min(rect.right);
            if left < right {
                self.rect.left = left;
                self.rect.right = right;
            } else {
                self.valid = false;
            }
        }
    }

    /// Region overlaps `rect`
    pub fn intersects(&self, rect: &Rect) -> bool {
        self.valid && self.rect.intersects(rect)
    }

    /// Region covers all of `rect`
    pub fn includes(&self, rect: &Rect) -> bool {
        self.valid && self.rect.contains(rect)
    }

    /// Region lies inside `rect`; trivially true for an invalid region
    pub fn included_by(&self, rect: &Rect) -> bool {
        !self.valid || rect.contains(&self.rect)
    }

    /// Invalidate the region
    pub fn clear(&mut self) {
        self.valid = false;
    }
}
