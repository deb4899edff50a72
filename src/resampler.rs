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

//! The compositor: turns a multi-buffer composite with transforms and
//! scaling into a single plain buffer the encoders can walk.
//!
//! Fast path: when every source buffer is untransformed and unscaled, the
//! composite passes through untouched. This avoids any pixel copy for the
//! overwhelmingly common single-output case. Scaled buffers always take
//! the resample path so encoders and clients agree on logical coordinates.
//!
//! Slow path: an output buffer of the composite's bounding box is acquired
//! from an internal pool and every source is resampled onto it (nearest
//! neighbour) with its transform applied. Each pooled buffer accumulates
//! the damage that happened while it was out of rotation, so a recycled
//! buffer repaints exactly what it missed.
//!
//! Completion order matches submission order: jobs are awaited in sequence
//! on the session task, with the pixel work on a blocking worker.

use std::collections::HashMap;
use std::sync::Arc;

use crate::composite::{CompositeFb, PlacedFb};
use crate::damage::{Rect, Region};
use crate::error::{Result, VncError};
use crate::fb::Framebuffer;
use crate::fb_pool::FbPool;
use crate::pixels::{pixfmt_from_fourcc, FOURCC_XRGB8888};
use crate::protocol::PixelFormat;
use crate::transform::Transform;

/// Compositor with a pooled output buffer and per-buffer damage memory.
pub struct Resampler {
    pool: Arc<FbPool>,
    pool_width: u32,
    pool_height: u32,
    buffer_damage: HashMap<u64, Region>,
    /// Output buffers handed out and not yet reclaimed.
    outstanding: Vec<Arc<Framebuffer>>,
}

impl Resampler {
    /// Creates a compositor; the output pool sizes itself on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: Arc::new(FbPool::new(0, 0, FOURCC_XRGB8888, 0)),
            pool_width: 0,
            pool_height: 0,
            buffer_damage: HashMap::new(),
            outstanding: Vec::new(),
        }
    }

    /// Returns idle output buffers to the pool.
    fn reclaim(&mut self) {
        let (idle, busy): (Vec<_>, Vec<_>) = self
            .outstanding
            .drain(..)
            .partition(|fb| fb.hold_count() == 0);
        for fb in idle {
            self.pool.release(fb);
        }
        self.outstanding = busy;
    }

    /// Composes the input into a single-buffer composite plus
    /// buffer-coordinate damage.
    ///
    /// # Errors
    ///
    /// Propagates allocation and pixel-format failures.
    pub async fn compose(
        &mut self,
        cfb: &CompositeFb,
        damage: &Region,
    ) -> Result<(CompositeFb, Region)> {
        if let Some(result) = fast_path(cfb, damage) {
            return Ok(result);
        }

        self.reclaim();

        let width = cfb.width();
        let height = cfb.height();
        if width != self.pool_width || height != self.pool_height {
            self.pool.resize(width, height, FOURCC_XRGB8888, width);
            self.pool_width = width;
            self.pool_height = height;
            self.buffer_damage.clear();
        }

        let output = self.pool.acquire()?;

        // Buffers that sat in the pool missed this frame's damage; the one
        // going out paints everything it accumulated.
        let mut paint = self
            .buffer_damage
            .remove(&output.id())
            .unwrap_or_else(|| {
                Region::from_rect(Rect::new(0, 0, width as i32, height as i32))
            });
        paint.union(damage);
        paint.intersect_rect(&Rect::new(0, 0, width as i32, height as i32));
        for accumulated in self.buffer_damage.values_mut() {
            accumulated.union(damage);
        }

        self.outstanding.push(output.clone());

        let sources = cfb.clone();
        let job_output = output.clone();
        let job_paint = paint.clone();
        sources.hold_all();
        let joined = tokio::task::spawn_blocking(move || {
            let result = render(&job_output, &sources, &job_paint);
            sources.release_all();
            result
        })
        .await;

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                return Err(VncError::Encoding(format!("compositor worker died: {e}")))
            }
        }

        self.buffer_damage.insert(output.id(), Region::new());
        output.set_pts(cfb.pts());
        let mut out_damage = damage.clone();
        out_damage.intersect_rect(&Rect::new(0, 0, width as i32, height as i32));
        Ok((CompositeFb::single(output), out_damage))
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Pass-through check: every buffer untransformed and unscaled, so wire
/// coordinates equal buffer coordinates and no pixel needs copying.
fn fast_path(cfb: &CompositeFb, damage: &Region) -> Option<(CompositeFb, Region)> {
    for placed in cfb.fbs() {
        let fb = &placed.fb;
        if fb.transform() != Transform::Normal {
            return None;
        }
        if fb.width() != fb.logical_width() || fb.height() != fb.logical_height() {
            return None;
        }
    }

    Some((cfb.clone(), damage.clone()))
}

fn render(output: &Arc<Framebuffer>, sources: &CompositeFb, paint: &Region) -> Result<()> {
    let dst_fmt = pixfmt_from_fourcc(output.fourcc()).ok_or(VncError::InvalidPixelFormat)?;
    let dst_stride = output.stride() as usize;
    let dst_bpp = dst_fmt.bytes_per_pixel();
    let mut dst = output.map_mut();

    for placed in sources.fbs() {
        let src_fmt =
            pixfmt_from_fourcc(placed.fb.fourcc()).ok_or(VncError::InvalidPixelFormat)?;
        let clip = paint.intersection_with_rect(&placed.logical_rect());
        if clip.is_empty() {
            continue;
        }
        render_buffer(&mut dst, &dst_fmt, dst_stride, dst_bpp, placed, &src_fmt, &clip);
    }

    Ok(())
}

fn render_buffer(
    dst: &mut [u8],
    dst_fmt: &PixelFormat,
    dst_stride: usize,
    dst_bpp: usize,
    placed: &PlacedFb,
    src_fmt: &PixelFormat,
    clip: &Region,
) {
    let fb = &placed.fb;
    let transform = fb.transform();
    let src = fb.map();
    let src_stride = fb.stride() as usize;
    let src_bpp = src_fmt.bytes_per_pixel();

    let (sw, sh) = (fb.width() as i32, fb.height() as i32);
    let (tw, th) = transform.apply_dimensions(fb.width(), fb.height());
    let (tw, th) = (tw as i32, th as i32);
    let (lw, lh) = (fb.logical_width() as i32, fb.logical_height() as i32);
    let inverse = transform.inverse();

    let mut pixel = bytes::BytesMut::with_capacity(4);

    for rect in clip.rects() {
        for y in rect.y1..rect.y2 {
            for x in rect.x1..rect.x2 {
                // Logical -> transformed-buffer coordinates (descale), then
                // undo the transform to find the source texel.
                let lx = x - placed.x_off;
                let ly = y - placed.y_off;
                let bx = (lx * tw / lw).clamp(0, tw - 1);
                let by = (ly * th / lh).clamp(0, th - 1);
                let (sx, sy) = inverse.apply_point(bx, by, tw, th);
                let (sx, sy) = (sx.clamp(0, sw - 1) as usize, sy.clamp(0, sh - 1) as usize);

                let src_off = (sy * src_stride + sx) * src_bpp;
                pixel.clear();
                crate::translate::translate_pixels(
                    &mut pixel,
                    dst_fmt,
                    &src[src_off..src_off + src_bpp],
                    src_fmt,
                    1,
                );
                let dst_off = (y as usize * dst_stride + x as usize) * dst_bpp;
                dst[dst_off..dst_off + dst_bpp].copy_from_slice(&pixel);
            }
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

    #[tokio::test]
    async fn untransformed_composite_passes_through() {
        let source = fb(64, 64);
        let cfb = CompositeFb::single(source.clone());
        let damage = Region::from_rect(Rect::new(0, 0, 64, 64));

        let mut resampler = Resampler::new();
        let (out, out_damage) = resampler.compose(&cfb, &damage).await.unwrap();

        assert_eq!(out.fbs()[0].fb.id(), source.id());
        assert_eq!(out_damage, damage);
    }

    #[tokio::test]
    async fn scaled_buffer_is_resampled_to_logical_size() {
        // 128x128 buffer presented as a 64x64 logical surface.
        let source = fb(128, 128);
        source.set_logical_size(64, 64);
        source.map_mut().fill(0x33);
        let cfb = CompositeFb::single(source.clone());
        let damage = Region::from_rect(Rect::new(0, 0, 64, 64));

        let mut resampler = Resampler::new();
        let (out, out_damage) = resampler.compose(&cfb, &damage).await.unwrap();

        let output = &out.fbs()[0].fb;
        assert_ne!(output.id(), source.id());
        assert_eq!(output.width(), 64);
        assert_eq!(output.height(), 64);
        assert_eq!(out_damage.extents(), Rect::new(0, 0, 64, 64));
        assert_eq!(output.map()[0], 0x33);
    }

    #[tokio::test]
    async fn rotated_buffer_is_rendered() {
        // 4x2 source rotated 90 degrees CCW becomes 2x4 logical.
        let source = fb(4, 2);
        source.set_transform(Transform::Rot90);
        source.set_logical_size(2, 4);
        {
            let mut pixels = source.map_mut();
            // Mark source pixel (3, 0) red; after Rot90 it lands at (0, 0).
            let off = 3 * 4;
            pixels[off] = 0x00;
            pixels[off + 1] = 0x00;
            pixels[off + 2] = 0xff;
        }

        let cfb = CompositeFb::single(source);
        let damage = Region::from_rect(Rect::new(0, 0, 2, 4));
        let mut resampler = Resampler::new();
        let (out, _) = resampler.compose(&cfb, &damage).await.unwrap();

        let output = &out.fbs()[0].fb;
        assert_eq!(output.width(), 2);
        assert_eq!(output.height(), 4);
        let pixels = output.map();
        assert_eq!(&pixels[0..3], &[0x00, 0x00, 0xff]);
    }

    #[tokio::test]
    async fn side_by_side_buffers_compose() {
        let left = fb(4, 4);
        left.map_mut().fill(0x11);
        let right = fb(4, 4);
        right.map_mut().fill(0x22);
        // A transform on one buffer forces the slow path.
        right.set_transform(Transform::Rot180);

        let cfb = CompositeFb::new(vec![
            PlacedFb { fb: left, x_off: 0, y_off: 0 },
            PlacedFb { fb: right, x_off: 4, y_off: 0 },
        ])
        .unwrap();
        let damage = Region::from_rect(Rect::new(0, 0, 8, 4));

        let mut resampler = Resampler::new();
        let (out, _) = resampler.compose(&cfb, &damage).await.unwrap();
        let output = &out.fbs()[0].fb;
        assert_eq!(output.width(), 8);
        let pixels = output.map();
        assert_eq!(pixels[0], 0x11);
        assert_eq!(pixels[4 * 4], 0x22);
    }
}
