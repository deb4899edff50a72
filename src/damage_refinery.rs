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

//! Content-hash damage refinement.
//!
//! Producers report damage conservatively; re-sending unchanged pixels is
//! pure waste. The refinery keeps a 64-bit xxh3 hash per 32x32-pixel tile
//! and, given a damage hint, re-hashes exactly the tiles the hint touches,
//! reporting only those whose content actually changed since the last call.

use std::collections::HashSet;

use crate::damage::Region;
use crate::fb::Framebuffer;

/// Tile side length in pixels.
pub const TILE_SIZE: u32 = 32;

/// Per-tile hash grid tracking the last transmitted content.
pub struct DamageRefinery {
    width: u32,
    height: u32,
    hashes: Vec<u64>,
}

impl DamageRefinery {
    /// Creates a refinery for a surface of the given size.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        let twidth = width.div_ceil(TILE_SIZE);
        let theight = height.div_ceil(TILE_SIZE);
        Self {
            width,
            height,
            hashes: vec![0; (twidth * theight) as usize],
        }
    }

    /// Adapts to a new surface size. A no-op when the size is unchanged;
    /// otherwise all stored hashes are discarded.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == self.width && height == self.height {
            return;
        }
        *self = Self::new(width, height);
    }

    fn hash_tile(&self, tx: u32, ty: u32, pixels: &[u8], stride: usize, bpp: usize) -> u64 {
        let x_start = (tx * TILE_SIZE) as usize;
        let x_stop = ((tx + 1) * TILE_SIZE).min(self.width) as usize;
        let y_start = (ty * TILE_SIZE) as usize;
        let y_stop = ((ty + 1) * TILE_SIZE).min(self.height) as usize;

        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        let byte_stride = stride * bpp;
        for y in y_start..y_stop {
            let row = y * byte_stride + x_start * bpp;
            hasher.update(&pixels[row..row + (x_stop - x_start) * bpp]);
        }
        hasher.digest()
    }

    /// Re-hashes the tiles intersecting `hint` and returns the region of
    /// tiles whose content changed, clipped to the buffer bounds.
    ///
    /// The buffer must match the refinery's size; feed the composited output
    /// buffer, not individual sources.
    pub fn refine(&mut self, hint: &Region, fb: &Framebuffer) -> Region {
        debug_assert_eq!(self.width, fb.width());
        debug_assert_eq!(self.height, fb.height());

        let twidth = self.width.div_ceil(TILE_SIZE);
        let theight = self.height.div_ceil(TILE_SIZE);

        let mut tiles = HashSet::new();
        for rect in hint.rects() {
            let tx1 = (rect.x1.max(0) as u32) / TILE_SIZE;
            let ty1 = (rect.y1.max(0) as u32) / TILE_SIZE;
            let tx2 = (rect.x2.max(0) as u32).div_ceil(TILE_SIZE).min(twidth);
            let ty2 = (rect.y2.max(0) as u32).div_ceil(TILE_SIZE).min(theight);
            for ty in ty1..ty2 {
                for tx in tx1..tx2 {
                    tiles.insert((tx, ty));
                }
            }
        }

        let pixels = fb.map();
        let stride = fb.stride() as usize;
        let bpp = fb.bytes_per_pixel();

        let mut refined = Region::new();
        for (tx, ty) in tiles {
            let hash = self.hash_tile(tx, ty, &pixels, stride, bpp);
            let slot = &mut self.hashes[(tx + ty * twidth) as usize];
            if *slot != hash {
                *slot = hash;
                refined.union_xywh(
                    (tx * TILE_SIZE) as i32,
                    (ty * TILE_SIZE) as i32,
                    TILE_SIZE as i32,
                    TILE_SIZE as i32,
                );
            }
        }

        refined.intersect_rect(&crate::damage::Rect::new(
            0,
            0,
            self.width as i32,
            self.height as i32,
        ));
        refined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::Rect;
    use crate::pixels::FOURCC_XRGB8888;

    fn full_region(w: i32, h: i32) -> Region {
        Region::from_rect(Rect::new(0, 0, w, h))
    }

    #[test]
    fn first_refine_reports_everything_second_nothing() {
        let fb = Framebuffer::new(100, 100, FOURCC_XRGB8888, 100).unwrap();
        fb.map_mut().fill(0x7f);
        let mut refinery = DamageRefinery::new(100, 100);

        let first = refinery.refine(&full_region(100, 100), &fb);
        assert_eq!(first.extents(), Rect::new(0, 0, 100, 100));

        let second = refinery.refine(&full_region(100, 100), &fb);
        assert!(second.is_empty());
    }

    #[test]
    fn single_pixel_change_marks_exactly_one_tile() {
        let fb = Framebuffer::new(128, 128, FOURCC_XRGB8888, 128).unwrap();
        let mut refinery = DamageRefinery::new(128, 128);
        refinery.refine(&full_region(128, 128), &fb);

        // Pixel (70, 40) lives in tile (2, 1).
        let offset = (40 * 128 + 70) * 4;
        fb.map_mut()[offset] ^= 0xff;

        let refined = refinery.refine(&full_region(128, 128), &fb);
        assert_eq!(refined.extents(), Rect::new(64, 32, 32, 32));
        assert_eq!(refined.area(), 32 * 32);
    }

    #[test]
    fn changes_outside_the_hint_are_not_seen() {
        let fb = Framebuffer::new(128, 128, FOURCC_XRGB8888, 128).unwrap();
        let mut refinery = DamageRefinery::new(128, 128);
        refinery.refine(&full_region(128, 128), &fb);

        fb.map_mut()[0] ^= 0xff; // tile (0, 0)

        let hint = Region::from_rect(Rect::new(64, 64, 64, 64));
        assert!(refinery.refine(&hint, &fb).is_empty());
    }

    #[test]
    fn refined_region_is_clipped_to_buffer_bounds() {
        let fb = Framebuffer::new(50, 50, FOURCC_XRGB8888, 50).unwrap();
        fb.map_mut().fill(1);
        let mut refinery = DamageRefinery::new(50, 50);
        let refined = refinery.refine(&full_region(50, 50), &fb);
        assert_eq!(refined.extents(), Rect::new(0, 0, 50, 50));
    }

    #[test]
    fn resize_forgets_history() {
        let fb = Framebuffer::new(64, 64, FOURCC_XRGB8888, 64).unwrap();
        let mut refinery = DamageRefinery::new(64, 64);
        refinery.refine(&full_region(64, 64), &fb);

        refinery.resize(64, 64); // same size: history kept
        assert!(refinery.refine(&full_region(64, 64), &fb).is_empty());

        refinery.resize(32, 32);
        refinery.resize(64, 64);
        assert!(!refinery.refine(&full_region(64, 64), &fb).is_empty());
    }
}
