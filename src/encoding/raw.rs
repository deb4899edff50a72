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

//! Raw encoding: uncompressed pixels in the client's format.

use bytes::BytesMut;

use crate::composite::CompositeFb;
use crate::damage::Region;
use crate::error::Result;
use crate::pixels::pixfmt_from_fourcc;
use crate::protocol::{PixelFormat, ENCODING_RAW};
use crate::translate::translate_rect;

use super::util::{per_fb_damage, put_rect_head, EncodedFrame};

/// The Raw encoder. Stateless apart from the negotiated output format.
pub struct RawEncoder {
    output_format: PixelFormat,
}

impl RawEncoder {
    /// Creates a Raw encoder producing the server-native format until told
    /// otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self { output_format: PixelFormat::rgbx8888() }
    }

    /// Declares the pixel layout the peer expects.
    pub fn set_output_format(&mut self, fmt: &PixelFormat) {
        self.output_format = fmt.clone();
    }

    /// Encodes the damaged parts of the composite on a worker thread.
    pub(super) async fn encode(
        &mut self,
        cfb: CompositeFb,
        damage: Region,
    ) -> Result<EncodedFrame> {
        let dst_fmt = self.output_format.clone();
        cfb.hold_all();
        let joined = tokio::task::spawn_blocking(move || {
            let result = encode_frame(&dst_fmt, &cfb, &damage);
            cfb.release_all();
            result
        })
        .await;
        joined.unwrap_or_else(|e| {
            Err(crate::error::VncError::Encoding(format!("raw worker died: {e}")))
        })
    }
}

fn encode_frame(
    dst_fmt: &PixelFormat,
    cfb: &CompositeFb,
    damage: &Region,
) -> Result<EncodedFrame> {
    // The update message counts rectangles in 16 bits; overly fragmented
    // damage collapses to its single extent rectangle.
    let collapsed;
    let damage = if damage.n_rects() > usize::from(u16::MAX) {
        collapsed = Region::from_rect(damage.extents());
        &collapsed
    } else {
        damage
    };

    let subregions = per_fb_damage(cfb, damage);

    let mut out = BytesMut::new();
    let mut n_rects: u32 = 0;

    for (placed, region) in cfb.fbs().iter().zip(&subregions) {
        let src_fmt = pixfmt_from_fourcc(placed.fb.fourcc())
            .ok_or(crate::error::VncError::InvalidPixelFormat)?;
        let pixels = placed.fb.map();
        let stride = placed.fb.stride() as usize;

        for rect in region.rects() {
            let local_x = (rect.x1 - placed.x_off) as usize;
            let local_y = (rect.y1 - placed.y_off) as usize;
            let width = rect.width() as usize;
            let height = rect.height() as usize;

            put_rect_head(
                &mut out,
                ENCODING_RAW,
                rect.x1 as u16,
                rect.y1 as u16,
                rect.width() as u16,
                rect.height() as u16,
            );
            translate_rect(
                &mut out,
                dst_fmt,
                &pixels,
                &src_fmt,
                stride,
                local_x,
                local_y,
                width,
                height,
            );
            n_rects += 1;
        }
    }

    Ok(EncodedFrame {
        buf: out.freeze(),
        n_rects,
        width: cfb.width() as u16,
        height: cfb.height() as u16,
        pts: cfb.pts(),
    })
}

impl Default for RawEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::Rect;
    use crate::fb::Framebuffer;
    use crate::pixels::FOURCC_XRGB8888;

    #[test]
    fn raw_rect_layout() {
        let fb = Framebuffer::new(8, 8, FOURCC_XRGB8888, 8).unwrap();
        {
            let mut pixels = fb.map_mut();
            // Pixel (1, 0) becomes red: X R G B little-endian is B G R X.
            pixels[4] = 0x00;
            pixels[5] = 0x00;
            pixels[6] = 0xff;
        }
        let cfb = CompositeFb::single(fb);
        let damage = Region::from_rect(Rect::new(0, 0, 2, 1));

        let dst_fmt = pixfmt_from_fourcc(FOURCC_XRGB8888).unwrap();
        let frame = encode_frame(&dst_fmt, &cfb, &damage).unwrap();

        assert_eq!(frame.n_rects, 1);
        // 12-byte header + 2 pixels * 4 bytes.
        assert_eq!(frame.buf.len(), 12 + 8);
        assert_eq!(&frame.buf[..4], &[0, 0, 0, 0]); // x, y
        assert_eq!(&frame.buf[4..8], &[0, 2, 0, 1]); // w, h
        assert_eq!(&frame.buf[8..12], &0i32.to_be_bytes()); // encoding
        assert_eq!(&frame.buf[12..20], &[0, 0, 0, 0, 0, 0, 0xff, 0]);
    }

    #[test]
    fn damage_outside_buffer_produces_nothing() {
        let fb = Framebuffer::new(8, 8, FOURCC_XRGB8888, 8).unwrap();
        let cfb = CompositeFb::single(fb);
        let damage = Region::from_rect(Rect::new(100, 100, 4, 4));

        let frame = encode_frame(&PixelFormat::rgbx8888(), &cfb, &damage).unwrap();
        assert_eq!(frame.n_rects, 0);
        assert!(frame.buf.is_empty());
    }

    #[test]
    fn fragmented_damage_collapses_to_one_extent_rect() {
        let fb = Framebuffer::new(64, 64, FOURCC_XRGB8888, 64).unwrap();
        let cfb = CompositeFb::single(fb);

        // Far more single-pixel rectangles than a u16 can count, spread over
        // a large virtual area whose extent covers the buffer.
        let rects: Vec<Rect> = (0..70_000)
            .map(|i| Rect::new((i % 1000) * 2, (i / 1000) * 2, 1, 1))
            .collect();
        let damage = Region::from_disjoint_rects(rects);
        assert!(damage.n_rects() > usize::from(u16::MAX));

        let dst_fmt = pixfmt_from_fourcc(FOURCC_XRGB8888).unwrap();
        let frame = encode_frame(&dst_fmt, &cfb, &damage).unwrap();

        // One rectangle: the damage extent clipped to the buffer.
        assert_eq!(frame.n_rects, 1);
        assert_eq!(&frame.buf[..4], &[0, 0, 0, 0]);
        assert_eq!(&frame.buf[4..8], &[0, 64, 0, 64]);
        assert_eq!(frame.buf.len(), 12 + 64 * 64 * 4);
    }
}
