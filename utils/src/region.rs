// Region tracking helpers
//
// Austin Shafer - 2020

use serde::{Deserialize, Serialize};

use std::cmp::PartialOrd;
use std::ops::Add;

use crate::{partial_max, partial_min};

/// A rectangular region
///
/// This can be used to track paint regions,
/// damage boxes, etc. It is determinined by
/// the corders of a rectangle:
///   r_start: the upper left corner's position on the output
///   r_size:  the distance from the left to the lower right
#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(C)]
pub struct Rect<T: PartialOrd + Copy + Add + Add<Output = T>> {
    pub r_pos: (T, T),
    pub r_size: (T, T),
}

impl<T: PartialOrd + Copy + Add + Add<Output = T>> Rect<T> {
    pub fn new(x: T, y: T, width: T, height: T) -> Rect<T> {
        Rect {
            r_pos: (x, y),
            r_size: (width, height),
        }
    }

    /// Checks if the point (x,y) is contained within this
    /// Rectangle.
    pub fn intersects(&self, x: T, y: T) -> bool {
        x > self.r_pos.0
            && y > self.r_pos.1
            && x < self.r_pos.0 + self.r_size.0
            && y < self.r_pos.1 + self.r_size.1
    }

    /// The lower right corner
    pub fn end(&self) -> (T, T) {
        (self.r_pos.0 + self.r_size.0, self.r_pos.1 + self.r_size.1)
    }
}

impl Rect<i32> {
    /// Build a rect from its two corners, (x1, y1) inclusive and
    /// (x2, y2) exclusive.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    /// The corner form `[x1, y1, x2, y2]` that the shaders consume
    pub fn corners(&self) -> [i32; 4] {
        let end = self.end();
        [self.r_pos.0, self.r_pos.1, end.0, end.1]
    }

    pub fn is_empty(&self) -> bool {
        self.r_size.0 <= 0 || self.r_size.1 <= 0
    }

    /// The area covered by both `self` and `other`
    ///
    /// Returns None if they do not overlap.
    pub fn intersection(&self, other: &Rect<i32>) -> Option<Rect<i32>> {
        let (end, other_end) = (self.end(), other.end());
        let ret = Self::from_corners(
            partial_max(self.r_pos.0, other.r_pos.0),
            partial_max(self.r_pos.1, other.r_pos.1),
            partial_min(end.0, other_end.0),
            partial_min(end.1, other_end.1),
        );

        match ret.is_empty() {
            true => None,
            false => Some(ret),
        }
    }
}

/// A set of disjoint rectangles
///
/// This is what gets handed to us as the paint or damage area of a
/// frame. The rectangles are expected to not overlap, we do not
/// coalesce or split them.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Region {
    r_rects: Vec<Rect<i32>>,
}

impl Region {
    pub fn new() -> Self {
        Self {
            r_rects: Vec::new(),
        }
    }

    pub fn from_rects(rects: &[Rect<i32>]) -> Self {
        let mut ret = Self::new();
        for r in rects.iter() {
            ret.add(*r);
        }
        ret
    }

    /// Add a rectangle to this region. Empty rectangles are dropped.
    pub fn add(&mut self, rect: Rect<i32>) {
        if !rect.is_empty() {
            self.r_rects.push(rect);
        }
    }

    pub fn clear(&mut self) {
        self.r_rects.clear();
    }

    pub fn rects(&self) -> &[Rect<i32>] {
        self.r_rects.as_slice()
    }

    pub fn len(&self) -> usize {
        self.r_rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.r_rects.is_empty()
    }

    /// The parts of this region inside `rect`
    ///
    /// Intersecting disjoint rectangles with one rectangle keeps them
    /// disjoint.
    pub fn intersect(&self, rect: &Rect<i32>) -> Region {
        Region {
            r_rects: self
                .r_rects
                .iter()
                .filter_map(|r| r.intersection(rect))
                .collect(),
        }
    }

    /// The bounding rectangle of every rect in this region
    ///
    /// Returns None if the region is empty.
    pub fn extents(&self) -> Option<Rect<i32>> {
        let first = self.r_rects.first()?;
        let (mut x1, mut y1) = first.r_pos;
        let (mut x2, mut y2) = first.end();

        for r in self.r_rects.iter().skip(1) {
            let end = r.end();
            x1 = partial_min(x1, r.r_pos.0);
            y1 = partial_min(y1, r.r_pos.1);
            x2 = partial_max(x2, end.0);
            y2 = partial_max(y2, end.1);
        }

        Some(Rect::from_corners(x1, y1, x2, y2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_region_has_no_extents() {
        let reg = Region::new();
        assert!(reg.is_empty());
        assert_eq!(reg.extents(), None);
    }

    #[test]
    fn extents_cover_all_rects() {
        let reg = Region::from_rects(&[
            Rect::new(10, 10, 20, 20),
            Rect::new(100, 5, 10, 10),
            Rect::new(0, 50, 5, 5),
        ]);

        assert_eq!(reg.len(), 3);
        assert_eq!(reg.extents(), Some(Rect::from_corners(0, 5, 110, 55)));
    }

    #[test]
    fn zero_sized_rects_are_dropped() {
        let mut reg = Region::new();
        reg.add(Rect::new(4, 4, 0, 10));
        reg.add(Rect::new(4, 4, 10, -1));
        assert!(reg.is_empty());
    }

    #[test]
    fn rect_intersection() {
        let a = Rect::new(0, 0, 100, 100);
        assert_eq!(
            a.intersection(&Rect::new(50, 60, 100, 100)),
            Some(Rect::from_corners(50, 60, 100, 100))
        );
        assert_eq!(a.intersection(&Rect::new(10, 10, 5, 5)), Some(Rect::new(10, 10, 5, 5)));
        // touching edges share nothing
        assert_eq!(a.intersection(&Rect::new(100, 0, 10, 10)), None);
        assert_eq!(a.intersection(&Rect::new(-50, 200, 10, 10)), None);
    }

    #[test]
    fn region_limited_to_window() {
        let damage = Region::from_rects(&[Rect::new(0, 0, 800, 300), Rect::new(0, 300, 800, 300)]);
        let window = Rect::new(100, 250, 128, 128);

        let paint = damage.intersect(&window);
        assert_eq!(
            paint.rects(),
            &[
                Rect::from_corners(100, 250, 228, 300),
                Rect::from_corners(100, 300, 228, 378)
            ]
        );
        assert_eq!(paint.extents(), Some(window));

        assert!(damage.intersect(&Rect::new(900, 0, 10, 10)).is_empty());
    }

    #[test]
    fn corners() {
        let r = Rect::new(3, 4, 10, 20);
        assert_eq!(r.corners(), [3, 4, 13, 24]);
        assert_eq!(Rect::from_corners(3, 4, 13, 24), r);
        assert!(r.intersects(5, 5));
        assert!(!r.intersects(13, 5));
    }
}
