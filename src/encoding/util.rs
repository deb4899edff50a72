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

//! Shared helpers for the encoder implementations.

use bytes::{BufMut, Bytes, BytesMut};

use crate::composite::CompositeFb;
use crate::damage::Region;
use crate::protocol::Rectangle;

/// A fully encoded framebuffer update: the rectangle payloads of one frame.
///
/// The buffer holds the rectangle headers and data; the session prepends the
/// FramebufferUpdate message header (and appends pseudo-encoding rectangles)
/// when transmitting. `Bytes` makes the frame cheaply shareable.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Encoded rectangle stream.
    pub buf: Bytes,
    /// Number of rectangles in `buf`.
    pub n_rects: u32,
    /// Frame width at encode time.
    pub width: u16,
    /// Frame height at encode time.
    pub height: u16,
    /// Presentation timestamp carried over from the source buffers.
    pub pts: u64,
}

/// Appends a rectangle header for an encoding.
pub fn put_rect_head(dst: &mut BytesMut, encoding: i32, x: u16, y: u16, width: u16, height: u16) {
    Rectangle { x, y, width, height, encoding }.write_header(dst);
}

/// Splits composite-coordinate damage into per-source-buffer regions.
///
/// Each returned region is clipped to its buffer's placement and stays in
/// composite coordinates. Overflow of the update message's 16-bit rectangle
/// counter is the caller's concern: each encoder applies its own collapse
/// policy before or after the split.
#[must_use]
pub fn per_fb_damage(cfb: &CompositeFb, damage: &Region) -> Vec<Region> {
    cfb.fbs()
        .iter()
        .map(|placed| damage.intersection_with_rect(&placed.logical_rect()))
        .collect()
}

/// Writes the Tight variable-length size: 7 bits per byte with a
/// continuation flag, up to 22 bits.
pub fn put_tight_length(dst: &mut BytesMut, len: usize) {
    if len < 0x80 {
        dst.put_u8(len as u8);
    } else if len < 0x4000 {
        dst.put_u8(((len & 0x7f) | 0x80) as u8);
        dst.put_u8((len >> 7) as u8);
    } else {
        dst.put_u8(((len & 0x7f) | 0x80) as u8);
        dst.put_u8((((len >> 7) & 0x7f) | 0x80) as u8);
        dst.put_u8((len >> 14) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::PlacedFb;
    use crate::damage::Rect;
    use crate::fb::Framebuffer;
    use crate::pixels::FOURCC_XRGB8888;

    #[test]
    fn tight_length_boundaries() {
        let mut buf = BytesMut::new();
        put_tight_length(&mut buf, 0x7f);
        assert_eq!(&buf[..], &[0x7f]);

        buf.clear();
        put_tight_length(&mut buf, 0x80);
        assert_eq!(&buf[..], &[0x80, 0x01]);

        buf.clear();
        put_tight_length(&mut buf, 0x3fff);
        assert_eq!(&buf[..], &[0xff, 0x7f]);

        buf.clear();
        put_tight_length(&mut buf, 0x4000);
        assert_eq!(&buf[..], &[0x80, 0x80, 0x01]);
    }

    #[test]
    fn per_fb_damage_clips_to_each_buffer() {
        let left = Framebuffer::new(100, 100, FOURCC_XRGB8888, 100).unwrap();
        let right = Framebuffer::new(100, 100, FOURCC_XRGB8888, 100).unwrap();
        let cfb = CompositeFb::new(vec![
            PlacedFb { fb: left, x_off: 0, y_off: 0 },
            PlacedFb { fb: right, x_off: 100, y_off: 0 },
        ])
        .unwrap();

        let damage = Region::from_rect(Rect::new(90, 10, 20, 20));
        let split = per_fb_damage(&cfb, &damage);
        assert_eq!(split[0].extents(), Rect::new(90, 10, 10, 20));
        assert_eq!(split[1].extents(), Rect::new(100, 10, 10, 20));
    }
}
