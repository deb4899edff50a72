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

//! Tight encoding: 64-pixel tiles over four persistent zlib streams, with
//! an optional JPEG path for lossy quality settings.
//!
//! Every damaged tile becomes one Tight rectangle. In basic mode the control
//! byte selects one of four zlib streams by `tile_grid_x % 4` (so four
//! workers can compress in parallel without sharing state), followed by a
//! 1-3 byte variable-length size and the sync-flushed zlib output of the
//! tile's row-major CPIXELs. With a lossy quality level and TurboJPEG
//! available, photographic tiles ship as JPEG instead: control byte `0x90`,
//! the size, and a 4:2:2 JPEG at quality 33 (low settings) or 66 (high).

use bytes::{BufMut, BytesMut};
use flate2::{Compress, Compression, FlushCompress};

use crate::composite::{CompositeFb, PlacedFb};
use crate::damage::{Rect, Region};
use crate::error::{Result, VncError};
use crate::pixels::pixfmt_from_fourcc;
use crate::protocol::{PixelFormat, ENCODING_TIGHT};
use crate::translate::pixels_to_cpixels;

use super::util::{per_fb_damage, put_rect_head, put_tight_length, EncodedFrame};

const TILE_LENGTH: usize = 64;
const N_STREAMS: usize = 4;

/// Control byte for a JPEG rectangle: compression type 9 in the top nibble.
const TIGHT_JPEG: u8 = 0x90;

/// The Tight encoder. Owns four persistent zlib streams.
pub struct TightEncoder {
    output_format: PixelFormat,
    quality: u8,
    streams: Option<[Compress; N_STREAMS]>,
}

impl TightEncoder {
    /// Creates a Tight encoder in lossless mode.
    #[must_use]
    pub fn new() -> Self {
        Self {
            output_format: PixelFormat::rgbx8888(),
            quality: 0,
            streams: Some(std::array::from_fn(|_| {
                Compress::new(Compression::new(1), true)
            })),
        }
    }

    /// Declares the pixel layout the peer expects.
    pub fn set_output_format(&mut self, fmt: &PixelFormat) {
        self.output_format = fmt.clone();
    }

    /// Sets the quality level: 0 is lossless, 1-10 enable JPEG tiles of
    /// increasing fidelity.
    pub fn set_quality(&mut self, quality: u8) {
        self.quality = quality.min(10);
    }

    /// Encodes the damaged parts of the composite on a worker thread.
    pub(super) async fn encode(
        &mut self,
        cfb: CompositeFb,
        damage: Region,
    ) -> Result<EncodedFrame> {
        let dst_fmt = self.output_format.clone();
        let quality = self.quality;
        let mut streams = match self.streams.take() {
            Some(streams) => streams,
            None => std::array::from_fn(|_| Compress::new(Compression::new(1), true)),
        };

        cfb.hold_all();
        let joined = tokio::task::spawn_blocking(move || {
            let result = encode_frame(&mut streams, &dst_fmt, quality, &cfb, &damage);
            cfb.release_all();
            (streams, result)
        })
        .await;

        match joined {
            Ok((streams, result)) => {
                self.streams = Some(streams);
                result
            }
            Err(e) => Err(VncError::Encoding(format!("Tight worker died: {e}"))),
        }
    }
}

impl Default for TightEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Compresses `input` on a persistent zlib stream, sync-flushing so the
/// output is self-contained for the decoder.
fn compress_sync(stream: &mut Compress, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut chunk = vec![0u8; 32 * 1024];
    let mut pos = 0usize;

    loop {
        let before_in = stream.total_in();
        let before_out = stream.total_out();
        stream
            .compress(&input[pos..], &mut chunk, FlushCompress::Sync)
            .map_err(|e| VncError::Encoding(format!("zlib failure: {e}")))?;
        let produced = (stream.total_out() - before_out) as usize;
        out.extend_from_slice(&chunk[..produced]);
        pos += (stream.total_in() - before_in) as usize;

        if pos == input.len() && produced < chunk.len() {
            return Ok(out);
        }
    }
}

fn encode_frame(
    streams: &mut [Compress; N_STREAMS],
    dst_fmt: &PixelFormat,
    quality: u8,
    cfb: &CompositeFb,
    damage: &Region,
) -> Result<EncodedFrame> {
    let mut subregions = per_fb_damage(cfb, damage);

    // Every tile becomes a rectangle and the update counter is 16 bits;
    // heavily fragmented damage collapses to full bounds per source buffer
    // before the tile walk.
    let total: usize = subregions.iter().map(Region::n_rects).sum();
    if total > usize::from(u16::MAX) {
        subregions = cfb
            .fbs()
            .iter()
            .map(|placed| Region::from_rect(placed.logical_rect()))
            .collect();
    }

    let mut out = BytesMut::new();
    let mut n_rects: u32 = 0;

    for (placed, region) in cfb.fbs().iter().zip(&subregions) {
        let src_fmt = pixfmt_from_fourcc(placed.fb.fourcc())
            .ok_or(VncError::InvalidPixelFormat)?;

        for rect in region.rects() {
            n_rects += encode_box(streams, &mut out, dst_fmt, quality, placed, &src_fmt, rect)?;
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

#[allow(clippy::too_many_arguments)]
fn encode_box(
    streams: &mut [Compress; N_STREAMS],
    out: &mut BytesMut,
    dst_fmt: &PixelFormat,
    quality: u8,
    placed: &PlacedFb,
    src_fmt: &PixelFormat,
    rect: &Rect,
) -> Result<u32> {
    let src_bpp = src_fmt.bytes_per_pixel();
    let stride = placed.fb.stride() as usize;
    let pixels = placed.fb.map();

    let x0 = (rect.x1 - placed.x_off) as usize;
    let y0 = (rect.y1 - placed.y_off) as usize;
    let width = rect.width() as usize;
    let height = rect.height() as usize;

    let mut n_rects = 0u32;
    let mut cpixels = BytesMut::new();

    for tile_y in (0..height).step_by(TILE_LENGTH) {
        for tile_x in (0..width).step_by(TILE_LENGTH) {
            let tile_w = (width - tile_x).min(TILE_LENGTH);
            let tile_h = (height - tile_y).min(TILE_LENGTH);

            let global_x = rect.x1 as usize + tile_x;
            let global_y = rect.y1 as usize + tile_y;

            put_rect_head(
                out,
                ENCODING_TIGHT,
                global_x as u16,
                global_y as u16,
                tile_w as u16,
                tile_h as u16,
            );

            if quality != 0 {
                if let Some(()) = encode_jpeg_tile(
                    out, quality, &pixels, src_fmt, stride,
                    x0 + tile_x, y0 + tile_y, tile_w, tile_h,
                ) {
                    n_rects += 1;
                    continue;
                }
            }

            cpixels.clear();
            for row in 0..tile_h {
                let src_off = ((y0 + tile_y + row) * stride + x0 + tile_x) * src_bpp;
                pixels_to_cpixels(
                    &mut cpixels,
                    dst_fmt,
                    &pixels[src_off..src_off + tile_w * src_bpp],
                    src_fmt,
                    tile_w,
                );
            }

            let stream_index = (global_x / TILE_LENGTH) % N_STREAMS;
            let compressed = compress_sync(&mut streams[stream_index], &cpixels)?;

            out.put_u8((stream_index as u8) << 4);
            put_tight_length(out, compressed.len());
            out.put_slice(&compressed);
            n_rects += 1;
        }
    }

    Ok(n_rects)
}

#[cfg(feature = "turbojpeg")]
#[allow(clippy::too_many_arguments)]
fn encode_jpeg_tile(
    out: &mut BytesMut,
    quality: u8,
    pixels: &[u8],
    src_fmt: &PixelFormat,
    stride: usize,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
) -> Option<()> {
    use crate::jpeg::TurboJpegEncoder;

    // RGB rows for the JPEG compressor.
    let src_bpp = src_fmt.bytes_per_pixel();
    let mut rgb = Vec::with_capacity(width * height * 3);
    let mut row_buf = BytesMut::new();
    let rgb888 = crate::pixels::pixfmt_from_fourcc(crate::pixels::FOURCC_RGB888)?;
    for row in 0..height {
        let off = ((y + row) * stride + x) * src_bpp;
        row_buf.clear();
        crate::translate::translate_pixels(
            &mut row_buf,
            &rgb888,
            &pixels[off..off + width * src_bpp],
            src_fmt,
            width,
        );
        // RGB888 packs red in the high byte; JPEG wants R, G, B memory order.
        for px in row_buf.chunks_exact(3) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }

    let jpeg_quality = if quality >= 6 { 66 } else { 33 };
    let mut encoder = TurboJpegEncoder::new().ok()?;
    let data = encoder
        .compress_rgb422(&rgb, width as u16, height as u16, jpeg_quality)
        .ok()?;

    out.put_u8(TIGHT_JPEG);
    put_tight_length(out, data.len());
    out.put_slice(&data);
    Some(())
}

#[cfg(not(feature = "turbojpeg"))]
#[allow(clippy::too_many_arguments)]
fn encode_jpeg_tile(
    _out: &mut BytesMut,
    _quality: u8,
    _pixels: &[u8],
    _src_fmt: &PixelFormat,
    _stride: usize,
    _x: usize,
    _y: usize,
    _width: usize,
    _height: usize,
) -> Option<()> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fb::Framebuffer;
    use crate::pixels::FOURCC_XRGB8888;
    use flate2::{Decompress, FlushDecompress};

    fn xrgb() -> PixelFormat {
        pixfmt_from_fourcc(FOURCC_XRGB8888).unwrap()
    }

    struct TightDecoder {
        streams: Vec<Decompress>,
    }

    impl TightDecoder {
        fn new() -> Self {
            Self {
                streams: (0..N_STREAMS).map(|_| Decompress::new(true)).collect(),
            }
        }

        fn inflate(&mut self, stream: usize, data: &[u8], expected: usize) -> Vec<u8> {
            let z = &mut self.streams[stream];
            let mut out = vec![0u8; expected];
            let mut filled = 0usize;
            let mut pos = 0usize;
            while filled < expected {
                let before_in = z.total_in();
                let before_out = z.total_out();
                z.decompress(&data[pos..], &mut out[filled..], FlushDecompress::Sync)
                    .unwrap();
                pos += (z.total_in() - before_in) as usize;
                filled += (z.total_out() - before_out) as usize;
                if z.total_in() == before_in && z.total_out() == before_out {
                    break;
                }
            }
            assert_eq!(filled, expected);
            out
        }
    }

    fn read_tight_length(buf: &[u8], pos: &mut usize) -> usize {
        let mut len = usize::from(buf[*pos] & 0x7f);
        if buf[*pos] & 0x80 != 0 {
            *pos += 1;
            len |= usize::from(buf[*pos] & 0x7f) << 7;
            if buf[*pos] & 0x80 != 0 {
                *pos += 1;
                len |= usize::from(buf[*pos]) << 14;
            }
        }
        *pos += 1;
        len
    }

    #[test]
    fn basic_tiles_round_trip() {
        let (w, h) = (130usize, 70usize); // 3x2 tile grid
        let fb = Framebuffer::new(w as u32, h as u32, FOURCC_XRGB8888, w as u32).unwrap();
        let mut reference = vec![0u32; w * h];
        {
            let mut pixels = fb.map_mut();
            let mut seed = 7u32;
            for i in 0..w * h {
                seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
                let value = seed & 0x00ff_ffff;
                reference[i] = value;
                pixels[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
            }
        }

        let cfb = CompositeFb::single(fb);
        let damage = Region::from_rect(Rect::new(0, 0, w as i32, h as i32));
        let mut streams: [Compress; N_STREAMS] =
            std::array::from_fn(|_| Compress::new(Compression::new(1), true));
        let frame = encode_frame(&mut streams, &xrgb(), 0, &cfb, &damage).unwrap();
        assert_eq!(frame.n_rects, 6);

        let mut decoder = TightDecoder::new();
        let buf = &frame.buf;
        let mut pos = 0usize;
        let mut decoded = vec![0u32; w * h];

        for _ in 0..frame.n_rects {
            let x = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
            let y = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            let tw = u16::from_be_bytes([buf[pos + 4], buf[pos + 5]]) as usize;
            let th = u16::from_be_bytes([buf[pos + 6], buf[pos + 7]]) as usize;
            assert_eq!(
                i32::from_be_bytes([buf[pos + 8], buf[pos + 9], buf[pos + 10], buf[pos + 11]]),
                ENCODING_TIGHT
            );
            pos += 12;

            let control = buf[pos];
            pos += 1;
            assert_eq!(control & 0x0f, 0, "basic compression expected");
            let stream = usize::from(control >> 4);
            assert_eq!(stream, (x / TILE_LENGTH) % N_STREAMS);

            let zlen = read_tight_length(buf, &mut pos);
            let cpixels = decoder.inflate(stream, &buf[pos..pos + zlen], tw * th * 3);
            pos += zlen;

            for row in 0..th {
                for col in 0..tw {
                    let c = &cpixels[(row * tw + col) * 3..][..3];
                    decoded[(y + row) * w + x + col] =
                        u32::from(c[0]) | (u32::from(c[1]) << 8) | (u32::from(c[2]) << 16);
                }
            }
        }

        assert_eq!(pos, buf.len());
        assert_eq!(decoded, reference);
    }

    #[test]
    fn stream_index_follows_tile_grid_column() {
        let (w, h) = (320usize, 64usize); // 5 tiles across
        let fb = Framebuffer::new(w as u32, h as u32, FOURCC_XRGB8888, w as u32).unwrap();
        let cfb = CompositeFb::single(fb);
        let damage = Region::from_rect(Rect::new(0, 0, w as i32, h as i32));

        let mut streams: [Compress; N_STREAMS] =
            std::array::from_fn(|_| Compress::new(Compression::new(1), true));
        let frame = encode_frame(&mut streams, &xrgb(), 0, &cfb, &damage).unwrap();

        let buf = &frame.buf;
        let mut pos = 0usize;
        let mut seen = Vec::new();
        for _ in 0..frame.n_rects {
            pos += 12;
            seen.push(buf[pos] >> 4);
            pos += 1;
            let zlen = read_tight_length(buf, &mut pos);
            pos += zlen;
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 0]);
    }
}
