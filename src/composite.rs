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

//! Composite framebuffers: the logical screen assembled from source buffers.
//!
//! A [`CompositeFb`] is an ordered sequence of placed framebuffers forming
//! one desktop. Most deployments have a single buffer at the origin; multiple
//! buffers appear with multi-head layouts. Invariants enforced at
//! construction: at least one buffer, at most [`COMPOSITE_MAX`], no two
//! buffers overlap, and the bounding box starts at (0,0).

use std::sync::Arc;

use crate::damage::Rect;
use crate::error::{Result, VncError};
use crate::fb::{Framebuffer, NO_PTS};

/// Maximum number of buffers in one composite.
pub const COMPOSITE_MAX: usize = 64;

/// A framebuffer placed at an offset within the composite.
#[derive(Debug, Clone)]
pub struct PlacedFb {
    /// The source buffer.
    pub fb: Arc<Framebuffer>,
    /// Horizontal placement in logical coordinates.
    pub x_off: i32,
    /// Vertical placement in logical coordinates.
    pub y_off: i32,
}

impl PlacedFb {
    /// The logical-coordinate rectangle this buffer covers.
    #[must_use]
    pub fn logical_rect(&self) -> Rect {
        Rect::new(
            self.x_off,
            self.y_off,
            self.fb.logical_width() as i32,
            self.fb.logical_height() as i32,
        )
    }
}

/// An ordered set of placed framebuffers forming one logical screen.
#[derive(Debug, Clone)]
pub struct CompositeFb {
    fbs: Vec<PlacedFb>,
}

impl CompositeFb {
    /// Builds a composite from placed buffers, validating the invariants.
    ///
    /// # Errors
    ///
    /// Rejects empty input, more than [`COMPOSITE_MAX`] buffers, overlapping
    /// placements, and bounding boxes that do not start at the origin.
    pub fn new(fbs: Vec<PlacedFb>) -> Result<Self> {
        if fbs.is_empty() {
            return Err(VncError::InvalidOperation(
                "composite framebuffer needs at least one buffer".into(),
            ));
        }
        if fbs.len() > COMPOSITE_MAX {
            return Err(VncError::InvalidOperation(format!(
                "composite framebuffer limited to {COMPOSITE_MAX} buffers"
            )));
        }

        for (i, a) in fbs.iter().enumerate() {
            for b in &fbs[i + 1..] {
                if a.logical_rect().overlaps(&b.logical_rect()) {
                    return Err(VncError::InvalidOperation(
                        "composite framebuffer members overlap".into(),
                    ));
                }
            }
        }

        let min_x = fbs.iter().map(|p| p.x_off).min().unwrap_or(0);
        let min_y = fbs.iter().map(|p| p.y_off).min().unwrap_or(0);
        if min_x != 0 || min_y != 0 {
            return Err(VncError::InvalidOperation(
                "composite framebuffer must start at the origin".into(),
            ));
        }

        Ok(Self { fbs })
    }

    /// Wraps a single buffer at the origin.
    #[must_use]
    pub fn single(fb: Arc<Framebuffer>) -> Self {
        Self {
            fbs: vec![PlacedFb { fb, x_off: 0, y_off: 0 }],
        }
    }

    /// The placed buffers in order.
    #[must_use]
    pub fn fbs(&self) -> &[PlacedFb] {
        &self.fbs
    }

    /// Number of member buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fbs.len()
    }

    /// Always false; composites carry at least one buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fbs.is_empty()
    }

    /// Composite width: the right edge of the furthest buffer.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.fbs
            .iter()
            .map(|p| p.x_off + p.fb.logical_width() as i32)
            .max()
            .unwrap_or(0)
            .max(0) as u32
    }

    /// Composite height: the bottom edge of the furthest buffer.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.fbs
            .iter()
            .map(|p| p.y_off + p.fb.logical_height() as i32)
            .max()
            .unwrap_or(0)
            .max(0) as u32
    }

    /// Earliest presentation timestamp among the members, or [`NO_PTS`].
    #[must_use]
    pub fn pts(&self) -> u64 {
        self.fbs.iter().map(|p| p.fb.pts()).min().unwrap_or(NO_PTS)
    }

    /// Holds every member buffer.
    pub fn hold_all(&self) {
        for placed in &self.fbs {
            placed.fb.hold();
        }
    }

    /// Releases every member buffer.
    pub fn release_all(&self) {
        for placed in &self.fbs {
            placed.fb.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::FOURCC_XRGB8888;

    fn fb(w: u32, h: u32) -> Arc<Framebuffer> {
        Framebuffer::new(w, h, FOURCC_XRGB8888, w).unwrap()
    }

    #[test]
    fn empty_composite_is_rejected() {
        assert!(CompositeFb::new(Vec::new()).is_err());
    }

    #[test]
    fn overlapping_members_are_rejected() {
        let result = CompositeFb::new(vec![
            PlacedFb { fb: fb(100, 100), x_off: 0, y_off: 0 },
            PlacedFb { fb: fb(100, 100), x_off: 50, y_off: 0 },
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn bounding_box_must_start_at_origin() {
        let result = CompositeFb::new(vec![PlacedFb { fb: fb(10, 10), x_off: 5, y_off: 0 }]);
        assert!(result.is_err());
    }

    #[test]
    fn dimensions_cover_all_members() {
        let cfb = CompositeFb::new(vec![
            PlacedFb { fb: fb(100, 200), x_off: 0, y_off: 0 },
            PlacedFb { fb: fb(150, 100), x_off: 100, y_off: 0 },
        ])
        .unwrap();
        assert_eq!(cfb.width(), 250);
        assert_eq!(cfb.height(), 200);
    }

    #[test]
    fn hold_release_reaches_every_member() {
        let a = fb(10, 10);
        let b = fb(10, 10);
        let cfb = CompositeFb::new(vec![
            PlacedFb { fb: a.clone(), x_off: 0, y_off: 0 },
            PlacedFb { fb: b.clone(), x_off: 10, y_off: 0 },
        ])
        .unwrap();
        cfb.hold_all();
        assert_eq!(a.hold_count(), 1);
        assert_eq!(b.hold_count(), 1);
        cfb.release_all();
        assert_eq!(a.hold_count(), 0);
        assert_eq!(b.hold_count(), 0);
    }

    #[test]
    fn pts_is_earliest_member_pts() {
        let a = fb(10, 10);
        a.set_pts(2_000);
        let b = fb(10, 10);
        b.set_pts(1_000);
        let cfb = CompositeFb::new(vec![
            PlacedFb { fb: a, x_off: 0, y_off: 0 },
            PlacedFb { fb: b, x_off: 10, y_off: 0 },
        ])
        .unwrap();
        assert_eq!(cfb.pts(), 1_000);
    }
}
