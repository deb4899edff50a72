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

//! The encoder layer.
//!
//! Four encoders with widely different internals share one narrow surface:
//! declare the output pixel format, set a quality level, optionally request
//! a keyframe, and encode a composite framebuffer plus damage into exactly
//! one [`EncodedFrame`]. The sum type keeps dispatch static and lets each
//! encoder carry its own persistent compression state. An encode must not
//! overlap a previous encode on the same encoder; the session guarantees
//! this by awaiting each frame before scheduling the next.

use crate::composite::CompositeFb;
use crate::damage::Region;
use crate::error::Result;
use crate::protocol::{
    PixelFormat, ENCODING_OPEN_H264, ENCODING_RAW, ENCODING_TIGHT, ENCODING_ZRLE,
};

#[cfg(feature = "open-h264")]
pub mod h264;
pub mod raw;
pub mod tight;
pub mod util;
pub mod zrle;

pub use util::EncodedFrame;

use raw::RawEncoder;
use tight::TightEncoder;
use zrle::ZrleEncoder;

/// A per-client encoder instance.
pub enum Encoder {
    /// Uncompressed pixels.
    Raw(RawEncoder),
    /// Tiled RLE over a shared zlib stream.
    Zrle(ZrleEncoder),
    /// Tiled zlib streams with optional JPEG.
    Tight(TightEncoder),
    /// H.264 video contexts.
    #[cfg(feature = "open-h264")]
    OpenH264(h264::OpenH264Encoder),
}

impl Encoder {
    /// Builds the encoder for an RFB encoding number, or `None` for
    /// encodings this server cannot produce.
    #[must_use]
    pub fn for_encoding(encoding: i32) -> Option<Self> {
        match encoding {
            ENCODING_RAW => Some(Encoder::Raw(RawEncoder::new())),
            ENCODING_ZRLE => Some(Encoder::Zrle(ZrleEncoder::new())),
            ENCODING_TIGHT => Some(Encoder::Tight(TightEncoder::new())),
            #[cfg(feature = "open-h264")]
            ENCODING_OPEN_H264 => Some(Encoder::OpenH264(h264::OpenH264Encoder::new())),
            #[cfg(not(feature = "open-h264"))]
            ENCODING_OPEN_H264 => None,
            _ => None,
        }
    }

    /// The RFB encoding number this encoder produces.
    #[must_use]
    pub fn encoding(&self) -> i32 {
        match self {
            Encoder::Raw(_) => ENCODING_RAW,
            Encoder::Zrle(_) => ENCODING_ZRLE,
            Encoder::Tight(_) => ENCODING_TIGHT,
            #[cfg(feature = "open-h264")]
            Encoder::OpenH264(_) => ENCODING_OPEN_H264,
        }
    }

    /// True when the encoder sends whole frames regardless of damage.
    #[must_use]
    pub fn ignores_damage(&self) -> bool {
        match self {
            #[cfg(feature = "open-h264")]
            Encoder::OpenH264(_) => true,
            _ => false,
        }
    }

    /// Declares the pixel layout the peer expects.
    pub fn set_output_format(&mut self, fmt: &PixelFormat) {
        match self {
            Encoder::Raw(e) => e.set_output_format(fmt),
            Encoder::Zrle(e) => e.set_output_format(fmt),
            Encoder::Tight(e) => e.set_output_format(fmt),
            #[cfg(feature = "open-h264")]
            Encoder::OpenH264(_) => {}
        }
    }

    /// Sets the quality level: 0 is lossless/highest quality, 1-10 scale the
    /// lossy paths. Raw and ZRLE ignore it.
    pub fn set_quality(&mut self, quality: u8) {
        match self {
            Encoder::Raw(_) | Encoder::Zrle(_) => {}
            Encoder::Tight(e) => e.set_quality(quality),
            #[cfg(feature = "open-h264")]
            Encoder::OpenH264(e) => e.set_quality(quality),
        }
    }

    /// Forces the next frame to be a keyframe. Only H.264 reacts.
    pub fn request_key_frame(&mut self) {
        match self {
            #[cfg(feature = "open-h264")]
            Encoder::OpenH264(e) => e.request_key_frame(),
            _ => {}
        }
    }

    /// Encodes one frame. Produces exactly one [`EncodedFrame`]; must not be
    /// called again before the previous call resolved.
    pub async fn encode(&mut self, cfb: CompositeFb, damage: Region) -> Result<EncodedFrame> {
        match self {
            Encoder::Raw(e) => e.encode(cfb, damage).await,
            Encoder::Zrle(e) => e.encode(cfb, damage).await,
            Encoder::Tight(e) => e.encode(cfb, damage).await,
            #[cfg(feature = "open-h264")]
            Encoder::OpenH264(e) => e.encode(cfb, damage).await,
        }
    }
}

/// Picks the best encoding the client offered, in the server's preference
/// order, falling back to Raw which every client must accept.
#[must_use]
pub fn select_encoding(client_encodings: &[i32]) -> i32 {
    #[cfg(feature = "open-h264")]
    const PREFERENCE: &[i32] =
        &[ENCODING_OPEN_H264, ENCODING_TIGHT, ENCODING_ZRLE, ENCODING_RAW];
    #[cfg(not(feature = "open-h264"))]
    const PREFERENCE: &[i32] = &[ENCODING_TIGHT, ENCODING_ZRLE, ENCODING_RAW];

    for &candidate in PREFERENCE {
        if client_encodings.contains(&candidate) {
            return candidate;
        }
    }
    ENCODING_RAW
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::Rect;
    use crate::fb::Framebuffer;
    use crate::pixels::FOURCC_XRGB8888;

    #[test]
    fn selection_prefers_tight_over_zrle() {
        assert_eq!(
            select_encoding(&[ENCODING_ZRLE, ENCODING_TIGHT, ENCODING_RAW]),
            ENCODING_TIGHT
        );
        assert_eq!(select_encoding(&[ENCODING_ZRLE]), ENCODING_ZRLE);
        assert_eq!(select_encoding(&[]), ENCODING_RAW);
        assert_eq!(select_encoding(&[-239, -312]), ENCODING_RAW);
    }

    #[test]
    fn unsupported_encodings_have_no_encoder() {
        assert!(Encoder::for_encoding(5).is_none()); // Hextile
        assert!(Encoder::for_encoding(ENCODING_RAW).is_some());
    }

    #[tokio::test]
    async fn encode_releases_holds_on_completion() {
        let fb = Framebuffer::new(32, 32, FOURCC_XRGB8888, 32).unwrap();
        let cfb = CompositeFb::single(fb.clone());
        let damage = Region::from_rect(Rect::new(0, 0, 32, 32));

        let mut encoder = Encoder::for_encoding(ENCODING_ZRLE).unwrap();
        let frame = encoder.encode(cfb, damage).await.unwrap();
        assert_eq!(frame.n_rects, 1);
        assert_eq!(fb.hold_count(), 0);
    }

    #[tokio::test]
    async fn sequential_frames_share_one_zlib_stream() {
        let fb = Framebuffer::new(64, 64, FOURCC_XRGB8888, 64).unwrap();
        let mut encoder = Encoder::for_encoding(ENCODING_ZRLE).unwrap();

        let first = encoder
            .encode(
                CompositeFb::single(fb.clone()),
                Region::from_rect(Rect::new(0, 0, 64, 64)),
            )
            .await
            .unwrap();
        let second = encoder
            .encode(
                CompositeFb::single(fb.clone()),
                Region::from_rect(Rect::new(0, 0, 64, 64)),
            )
            .await
            .unwrap();

        // The first rectangle of the stream carries the zlib header; the
        // second must not repeat it.
        assert_eq!(&first.buf[16..18], &[0x78, 0x01]);
        assert_ne!(&second.buf[16..18], &[0x78, 0x01]);
    }
}
