// Copyright 2026 The prismvnc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Buffer orientation transforms.
//!
//! Producers may hand over framebuffers that are rotated or mirrored relative
//! to the logical desktop, in the manner of Wayland output transforms. The
//! compositor undoes the transform while rendering; damage rectangles travel
//! through the same mapping.

use crate::damage::{Rect, Region};

/// Rotation/mirror applied to a framebuffer's content.
///
/// Rotations are counter-clockwise, matching the Wayland convention; the
/// flipped variants mirror around the vertical axis before rotating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    /// No transform.
    #[default]
    Normal,
    /// 90 degrees counter-clockwise.
    Rot90,
    /// 180 degrees.
    Rot180,
    /// 270 degrees counter-clockwise.
    Rot270,
    /// Mirrored around the vertical axis.
    Flipped,
    /// Mirrored, then rotated 90 degrees.
    Flipped90,
    /// Mirrored, then rotated 180 degrees.
    Flipped180,
    /// Mirrored, then rotated 270 degrees.
    Flipped270,
}

impl Transform {
    /// True when the transform swaps width and height.
    #[must_use]
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Transform::Rot90 | Transform::Rot270 | Transform::Flipped90 | Transform::Flipped270
        )
    }

    /// Dimensions of the transformed image given source dimensions.
    #[must_use]
    pub fn apply_dimensions(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Maps a source point into transformed coordinates.
    ///
    /// `width` and `height` are the source dimensions.
    #[must_use]
    pub fn apply_point(self, x: i32, y: i32, width: i32, height: i32) -> (i32, i32) {
        match self {
            Transform::Normal => (x, y),
            Transform::Rot90 => (y, width - 1 - x),
            Transform::Rot180 => (width - 1 - x, height - 1 - y),
            Transform::Rot270 => (height - 1 - y, x),
            Transform::Flipped => (width - 1 - x, y),
            Transform::Flipped90 => (y, x),
            Transform::Flipped180 => (x, height - 1 - y),
            Transform::Flipped270 => (height - 1 - y, width - 1 - x),
        }
    }

    /// The transform that undoes this one.
    #[must_use]
    pub fn inverse(self) -> Transform {
        match self {
            Transform::Rot90 => Transform::Rot270,
            Transform::Rot270 => Transform::Rot90,
            other => other,
        }
    }

    /// Maps a source-space rectangle into transformed coordinates.
    #[must_use]
    pub fn apply_rect(self, rect: &Rect, width: i32, height: i32) -> Rect {
        let (ax, ay) = self.apply_point(rect.x1, rect.y1, width, height);
        let (bx, by) = self.apply_point(rect.x2 - 1, rect.y2 - 1, width, height);
        Rect {
            x1: ax.min(bx),
            y1: ay.min(by),
            x2: ax.max(bx) + 1,
            y2: ay.max(by) + 1,
        }
    }

    /// Maps a source-space damage region into transformed coordinates.
    #[must_use]
    pub fn apply_region(self, region: &Region, width: i32, height: i32) -> Region {
        if self == Transform::Normal {
            return region.clone();
        }
        let mut out = Region::new();
        for rect in region.rects() {
            out.union_rect(&self.apply_rect(rect, width, height));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_is_identity() {
        assert_eq!(Transform::Normal.apply_point(3, 4, 10, 10), (3, 4));
    }

    #[test]
    fn rot90_maps_corners() {
        // 10x20 source; top-right corner lands at the origin.
        assert_eq!(Transform::Rot90.apply_point(9, 0, 10, 20), (0, 0));
        assert_eq!(Transform::Rot90.apply_dimensions(10, 20), (20, 10));
    }

    #[test]
    fn rot180_maps_origin_to_far_corner() {
        assert_eq!(Transform::Rot180.apply_point(0, 0, 10, 20), (9, 19));
    }

    #[test]
    fn inverse_round_trips_points() {
        let cases = [
            Transform::Normal,
            Transform::Rot90,
            Transform::Rot180,
            Transform::Rot270,
            Transform::Flipped,
            Transform::Flipped90,
            Transform::Flipped180,
            Transform::Flipped270,
        ];
        for t in cases {
            let (w, h) = (13, 7);
            let (tx, ty) = t.apply_point(5, 2, w, h);
            let (tw, th) = t.apply_dimensions(w as u32, h as u32);
            let (bx, by) = t.inverse().apply_point(tx, ty, tw as i32, th as i32);
            assert_eq!((bx, by), (5, 2), "{t:?}");
        }
    }

    #[test]
    fn rect_transform_preserves_area() {
        let rect = Rect::new(1, 2, 3, 4);
        let out = Transform::Rot90.apply_rect(&rect, 10, 10);
        assert_eq!(out.area(), rect.area());
    }
}
