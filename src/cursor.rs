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

//! Cursor shape updates via the Cursor pseudo-encoding.
//!
//! When the host sets a cursor image and a client has negotiated the Cursor
//! pseudo-encoding, the next update carries a synthetic rectangle: hotspot
//! in the position fields, pixels in the client's format, then a packed
//! 1-bit transparency mask, one `ceil(width / 8)`-byte row per pixel row.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::error::{Result, VncError};
use crate::fb::Framebuffer;
use crate::pixels::{
    pixfmt_from_fourcc, FOURCC_ABGR8888, FOURCC_ARGB8888, FOURCC_BGRA8888, FOURCC_RGBA8888,
};
use crate::protocol::{PixelFormat, ENCODING_CURSOR};
use crate::translate::translate_pixels;

use super::encoding::util::put_rect_head;

/// A cursor image with its hotspot.
#[derive(Debug, Clone)]
pub struct Cursor {
    /// The cursor pixels.
    pub fb: Arc<Framebuffer>,
    /// Hotspot X offset within the image.
    pub hotspot_x: u16,
    /// Hotspot Y offset within the image.
    pub hotspot_y: u16,
}

/// Byte offset of the alpha channel within a little-endian 32-bit pixel,
/// for the formats that carry one.
fn alpha_offset(fourcc: u32) -> Option<usize> {
    match fourcc {
        f if f == FOURCC_ARGB8888 || f == FOURCC_ABGR8888 => Some(3),
        f if f == FOURCC_RGBA8888 || f == FOURCC_BGRA8888 => Some(0),
        _ => None,
    }
}

/// Appends the cursor rectangle to an update in progress.
///
/// # Errors
///
/// Fails for cursors in unsupported pixel formats.
pub fn encode_cursor_rect(
    dst: &mut BytesMut,
    cursor: &Cursor,
    client_format: &PixelFormat,
) -> Result<()> {
    let fb = &cursor.fb;
    let src_fmt = pixfmt_from_fourcc(fb.fourcc()).ok_or(VncError::InvalidPixelFormat)?;
    let width = fb.width() as usize;
    let height = fb.height() as usize;
    let stride = fb.stride() as usize;
    let src_bpp = src_fmt.bytes_per_pixel();

    put_rect_head(
        dst,
        ENCODING_CURSOR,
        cursor.hotspot_x,
        cursor.hotspot_y,
        width as u16,
        height as u16,
    );

    fb.hold();
    let pixels = fb.map();

    for row in 0..height {
        let off = row * stride * src_bpp;
        translate_pixels(
            dst,
            client_format,
            &pixels[off..off + width * src_bpp],
            &src_fmt,
            width,
        );
    }

    // Transparency mask: alpha >= 0x80 is opaque; formats without alpha are
    // fully opaque.
    let alpha = alpha_offset(fb.fourcc());
    let mask_stride = width.div_ceil(8);
    for row in 0..height {
        let mut mask_row = vec![0u8; mask_stride];
        for col in 0..width {
            let opaque = match alpha {
                Some(offset) => {
                    let px = (row * stride + col) * src_bpp;
                    pixels[px + offset] >= 0x80
                }
                None => true,
            };
            if opaque {
                mask_row[col / 8] |= 0x80 >> (col % 8);
            }
        }
        dst.put_slice(&mask_row);
    }

    drop(pixels);
    fb.release();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::FOURCC_XRGB8888;

    #[test]
    fn cursor_rect_layout() {
        let fb = Framebuffer::new(9, 2, FOURCC_XRGB8888, 9).unwrap();
        let cursor = Cursor { fb, hotspot_x: 3, hotspot_y: 1 };
        let fmt = pixfmt_from_fourcc(FOURCC_XRGB8888).unwrap();

        let mut dst = BytesMut::new();
        encode_cursor_rect(&mut dst, &cursor, &fmt).unwrap();

        // Header: hotspot, dims, encoding.
        assert_eq!(u16::from_be_bytes([dst[0], dst[1]]), 3);
        assert_eq!(u16::from_be_bytes([dst[2], dst[3]]), 1);
        assert_eq!(u16::from_be_bytes([dst[4], dst[5]]), 9);
        assert_eq!(u16::from_be_bytes([dst[6], dst[7]]), 2);
        assert_eq!(
            i32::from_be_bytes([dst[8], dst[9], dst[10], dst[11]]),
            ENCODING_CURSOR
        );

        // 12 header + 9*2*4 pixels + 2 rows * ceil(9/8) mask bytes.
        assert_eq!(dst.len(), 12 + 72 + 2 * 2);

        // No alpha channel: every mask bit within the width is set.
        let mask = &dst[12 + 72..];
        assert_eq!(mask[0], 0xff);
        assert_eq!(mask[1], 0x80);
    }

    #[test]
    fn alpha_formats_mask_transparent_pixels() {
        let fb = Framebuffer::new(8, 1, FOURCC_ARGB8888, 8).unwrap();
        {
            let mut pixels = fb.map_mut();
            // Make pixel 0 opaque, leave the rest transparent.
            pixels[3] = 0xff;
        }
        let cursor = Cursor { fb, hotspot_x: 0, hotspot_y: 0 };
        let fmt = pixfmt_from_fourcc(FOURCC_XRGB8888).unwrap();

        let mut dst = BytesMut::new();
        encode_cursor_rect(&mut dst, &cursor, &fmt).unwrap();
        let mask = dst[dst.len() - 1];
        assert_eq!(mask, 0x80);
    }
}
