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

//! Open H.264 encoding.
//!
//! One H.264 context per source-buffer origin on the composite. Each frame
//! produces one rectangle per context: a 4-byte big-endian payload length, a
//! 4-byte flags word (bit 0 = reset context), and the Annex-B bitstream. A
//! context is torn down and recreated (with the reset flag raised) whenever
//! its buffer's size, format or the quality setting changes. H.264 carries
//! its own inter-frame state, so the encoder ignores damage and feeds whole
//! frames.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use openh264::encoder::{Encoder as H264Context, EncoderConfig};
use openh264::formats::YUVBuffer;

use crate::composite::CompositeFb;
use crate::damage::Region;
use crate::error::{Result, VncError};
use crate::pixels::pixfmt_from_fourcc;
use crate::protocol::{PixelFormat, ENCODING_OPEN_H264};
use crate::translate::translate_pixels;

use super::util::{put_rect_head, EncodedFrame};

/// Rectangle flag: the client must reset this context before decoding.
const FLAG_RESET_CONTEXT: u32 = 1 << 0;

struct Context {
    encoder: H264Context,
    width: u32,
    height: u32,
    quality: u8,
    needs_reset: bool,
}

/// The Open H.264 encoder: a context per composite origin.
pub struct OpenH264Encoder {
    contexts: HashMap<(i32, i32), Context>,
    quality: u8,
    force_key_frame: bool,
}

impl OpenH264Encoder {
    /// Creates an encoder with no contexts; they appear on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            contexts: HashMap::new(),
            quality: 0,
            force_key_frame: false,
        }
    }

    /// Sets the quality level, recreating contexts on the next frame.
    pub fn set_quality(&mut self, quality: u8) {
        self.quality = quality.min(10);
    }

    /// Forces the next frame of every context to be a keyframe and marks
    /// the contexts for reset.
    pub fn request_key_frame(&mut self) {
        self.force_key_frame = true;
    }

    fn context_for(
        &mut self,
        origin: (i32, i32),
        width: u32,
        height: u32,
    ) -> Result<&mut Context> {
        let stale = self.contexts.get(&origin).is_some_and(|ctx| {
            ctx.width != width || ctx.height != height || ctx.quality != self.quality
        });
        if stale {
            self.contexts.remove(&origin);
        }

        if !self.contexts.contains_key(&origin) {
            // Map quality 1..=10 to a bitrate ladder; 0 (lossless elsewhere)
            // gets the top rung, H.264 being inherently lossy.
            let level = if self.quality == 0 { 10 } else { u32::from(self.quality) };
            let bitrate = 512_000 + level * 1_024_000;

            let config = EncoderConfig::new(width, height).set_bitrate_bps(bitrate);
            let encoder = H264Context::with_config(config)
                .map_err(|e| VncError::Encoding(format!("H.264 context failed: {e}")))?;

            self.contexts.insert(
                origin,
                Context {
                    encoder,
                    width,
                    height,
                    quality: self.quality,
                    needs_reset: true,
                },
            );
        }

        Ok(self.contexts.get_mut(&origin).expect("just inserted"))
    }

    /// Encodes every source buffer of the composite; damage is ignored.
    pub(super) async fn encode(
        &mut self,
        cfb: CompositeFb,
        _damage: Region,
    ) -> Result<EncodedFrame> {
        // Contexts must not be shared with a worker while a second encode
        // could start, so frame assembly runs inline; the H.264 library does
        // its own threading underneath.
        cfb.hold_all();
        let result = self.encode_frames(&cfb);
        cfb.release_all();
        result
    }

    fn encode_frames(&mut self, cfb: &CompositeFb) -> Result<EncodedFrame> {
        let mut out = BytesMut::new();
        let mut n_rects: u32 = 0;
        let force_key = std::mem::take(&mut self.force_key_frame);

        for placed in cfb.fbs() {
            let fb = &placed.fb;
            let src_fmt = pixfmt_from_fourcc(fb.fourcc())
                .ok_or(VncError::InvalidPixelFormat)?;
            let width = fb.width();
            let height = fb.height();

            let quality = self.quality;
            let ctx = self.context_for((placed.x_off, placed.y_off), width, height)?;
            debug_assert_eq!(ctx.quality, quality);
            if force_key {
                ctx.encoder.force_intra_frame(true);
                ctx.needs_reset = true;
            }

            let rgb = frame_to_rgb(fb, &src_fmt);
            let yuv = YUVBuffer::with_rgb(width as usize, height as usize, &rgb);
            let bitstream = ctx
                .encoder
                .encode(&yuv)
                .map_err(|e| VncError::Encoding(format!("H.264 encode failed: {e}")))?;
            let payload = bitstream.to_vec();

            let mut flags = 0u32;
            if std::mem::take(&mut ctx.needs_reset) {
                flags |= FLAG_RESET_CONTEXT;
            }

            put_rect_head(
                &mut out,
                ENCODING_OPEN_H264,
                placed.x_off as u16,
                placed.y_off as u16,
                fb.logical_width() as u16,
                fb.logical_height() as u16,
            );
            out.put_u32(payload.len() as u32);
            out.put_u32(flags);
            out.put_slice(&payload);
            n_rects += 1;
        }

        Ok(EncodedFrame {
            buf: out.freeze(),
            n_rects,
            width: cfb.width() as u16,
            height: cfb.height() as u16,
            pts: cfb.pts(),
        })
    }
}

impl Default for OpenH264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a framebuffer to the tightly packed RGB rows the H.264 wrapper
/// consumes.
fn frame_to_rgb(fb: &crate::fb::Framebuffer, src_fmt: &PixelFormat) -> Vec<u8> {
    let width = fb.width() as usize;
    let height = fb.height() as usize;
    let stride = fb.stride() as usize;
    let src_bpp = src_fmt.bytes_per_pixel();
    let pixels = fb.map();

    let rgb888 = pixfmt_from_fourcc(crate::pixels::FOURCC_RGB888).expect("static format");
    let mut rows = BytesMut::with_capacity(width * height * 3);
    for y in 0..height {
        let off = y * stride * src_bpp;
        translate_pixels(
            &mut rows,
            &rgb888,
            &pixels[off..off + width * src_bpp],
            src_fmt,
            width,
        );
    }

    // RGB888 is packed little-endian with red in the high byte; the encoder
    // wants R, G, B memory order.
    let mut rgb = Vec::with_capacity(width * height * 3);
    for px in rows.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    rgb
}
