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

//! ZRLE encoding: 64x64 tiles, palette/RLE sub-encodings, zlib framing.
//!
//! Per damage rectangle the encoder walks tiles in row-major order and picks
//! the cheapest of three tile forms:
//!
//! - **Solid** (one colour): sub-encoding byte 1 followed by one CPIXEL.
//! - **Packed palette RLE** (2-16 colours): `128 | palette_size`, the
//!   palette as CPIXELs, then a run-length encoded index stream.
//! - **Raw** (fallback): byte 0 and `width * height` CPIXELs.
//!
//! A palette form is only used when it does not exceed the raw alternative.
//! All tile bytes of a rectangle feed one logical zlib stream backed by the
//! parallel deflate engine; the rectangle payload is the accumulated zlib
//! output prefixed with its 32-bit big-endian byte count. The zlib stream
//! persists across rectangles and frames, as RFC 6143 requires.

use bytes::{BufMut, BytesMut};

use crate::composite::{CompositeFb, PlacedFb};
use crate::damage::{Rect, Region};
use crate::error::{Result, VncError};
use crate::parallel_deflate::ParallelDeflate;
use crate::pixels::pixfmt_from_fourcc;
use crate::protocol::{PixelFormat, ENCODING_ZRLE};
use crate::translate::{bytes_per_cpixel, pixels_to_cpixels};

use super::util::{per_fb_damage, put_rect_head, EncodedFrame};

const TILE_LENGTH: usize = 64;
const PALETTE_MAX: usize = 16;

/// The ZRLE encoder. Owns the connection's persistent zlib stream.
pub struct ZrleEncoder {
    output_format: PixelFormat,
    deflate: Option<ParallelDeflate>,
}

impl ZrleEncoder {
    /// Creates a ZRLE encoder with a level-1 deflate stream, the
    /// latency/ratio sweet spot for screen content.
    #[must_use]
    pub fn new() -> Self {
        Self {
            output_format: PixelFormat::rgbx8888(),
            deflate: Some(ParallelDeflate::new(1)),
        }
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
        let mut deflate = match self.deflate.take() {
            Some(deflate) => deflate,
            None => ParallelDeflate::new(1),
        };

        cfb.hold_all();
        let joined = tokio::task::spawn_blocking(move || {
            let result = encode_frame(&mut deflate, &dst_fmt, &cfb, &damage);
            cfb.release_all();
            (deflate, result)
        })
        .await;

        match joined {
            Ok((deflate, result)) => {
                self.deflate = Some(deflate);
                result
            }
            Err(e) => Err(VncError::Encoding(format!("ZRLE worker died: {e}"))),
        }
    }
}

impl Default for ZrleEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_frame(
    deflate: &mut ParallelDeflate,
    dst_fmt: &PixelFormat,
    cfb: &CompositeFb,
    damage: &Region,
) -> Result<EncodedFrame> {
    let mut subregions = per_fb_damage(cfb, damage);

    // The update message counts rectangles in 16 bits; when the split
    // damage would overflow it, fall back to one rectangle per source
    // buffer covering its full bounds.
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
            encode_box(deflate, &mut out, dst_fmt, placed, &src_fmt, rect);
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

fn encode_box(
    deflate: &mut ParallelDeflate,
    out: &mut BytesMut,
    dst_fmt: &PixelFormat,
    placed: &PlacedFb,
    src_fmt: &PixelFormat,
    rect: &Rect,
) {
    put_rect_head(
        out,
        ENCODING_ZRLE,
        rect.x1 as u16,
        rect.y1 as u16,
        rect.width() as u16,
        rect.height() as u16,
    );

    let src_bpp = src_fmt.bytes_per_pixel();
    let stride = placed.fb.stride() as usize;
    let pixels = placed.fb.map();

    let x0 = (rect.x1 - placed.x_off) as usize;
    let y0 = (rect.y1 - placed.y_off) as usize;
    let width = rect.width() as usize;
    let height = rect.height() as usize;

    let mut tile = vec![0u8; TILE_LENGTH * TILE_LENGTH * src_bpp];
    let mut encoded = BytesMut::with_capacity(
        1 + bytes_per_cpixel(dst_fmt) * TILE_LENGTH * TILE_LENGTH,
    );

    for tile_y in (0..height).step_by(TILE_LENGTH) {
        for tile_x in (0..width).step_by(TILE_LENGTH) {
            let tile_w = (width - tile_x).min(TILE_LENGTH);
            let tile_h = (height - tile_y).min(TILE_LENGTH);

            for row in 0..tile_h {
                let src_off = ((y0 + tile_y + row) * stride + x0 + tile_x) * src_bpp;
                tile[row * tile_w * src_bpp..(row + 1) * tile_w * src_bpp]
                    .copy_from_slice(&pixels[src_off..src_off + tile_w * src_bpp]);
            }

            encoded.clear();
            encode_tile(
                &mut encoded,
                dst_fmt,
                &tile[..tile_w * tile_h * src_bpp],
                src_fmt,
                tile_w * tile_h,
            );
            deflate.feed(&encoded);
        }
    }

    let mut zlib_out = Vec::new();
    deflate.sync(&mut zlib_out);
    out.put_u32(zlib_out.len() as u32);
    out.put_slice(&zlib_out);
}

fn find_in_palette(palette: &[u8], n: usize, colour: &[u8], bpp: usize) -> Option<usize> {
    (0..n).find(|&i| &palette[i * bpp..(i + 1) * bpp] == colour)
}

/// Collects up to 16 distinct colours; `None` when the tile has more.
fn tile_palette(palette: &mut [u8], src: &[u8], bpp: usize, len: usize) -> Option<usize> {
    let mut n = 0;
    for i in 0..len {
        let colour = &src[i * bpp..(i + 1) * bpp];
        if find_in_palette(palette, n, colour, bpp).is_none() {
            if n == PALETTE_MAX {
                return None;
            }
            palette[n * bpp..(n + 1) * bpp].copy_from_slice(colour);
            n += 1;
        }
    }
    Some(n)
}

fn encode_run_length(dst: &mut BytesMut, index: u8, run_length: usize) {
    if run_length == 1 {
        dst.put_u8(index);
        return;
    }

    dst.put_u8(index | 128);
    let mut remaining = run_length - 1;
    while remaining >= 255 {
        dst.put_u8(255);
        remaining -= 255;
    }
    dst.put_u8(remaining as u8);
}

fn encode_packed_tile(
    dst: &mut BytesMut,
    dst_fmt: &PixelFormat,
    src: &[u8],
    src_fmt: &PixelFormat,
    len: usize,
    palette: &[u8],
    palette_size: usize,
) {
    let bpp = src_fmt.bytes_per_pixel();

    dst.put_u8(128 | palette_size as u8);
    pixels_to_cpixels(dst, dst_fmt, palette, src_fmt, palette_size);

    let mut run_start = 0;
    for i in 1..=len {
        let run_over = i == len
            || src[i * bpp..(i + 1) * bpp] != src[run_start * bpp..(run_start + 1) * bpp];
        if run_over {
            let colour = &src[run_start * bpp..(run_start + 1) * bpp];
            let index = find_in_palette(palette, palette_size, colour, bpp)
                .expect("palette covers every tile colour") as u8;
            encode_run_length(dst, index, i - run_start);
            run_start = i;
        }
    }
}

fn encode_tile(
    dst: &mut BytesMut,
    dst_fmt: &PixelFormat,
    src: &[u8],
    src_fmt: &PixelFormat,
    len: usize,
) {
    let bpp = src_fmt.bytes_per_pixel();
    let cpixel_len = bytes_per_cpixel(dst_fmt);

    let mut palette = [0u8; PALETTE_MAX * 4];
    let palette_size = tile_palette(&mut palette, src, bpp, len);

    if palette_size == Some(1) {
        dst.put_u8(1);
        pixels_to_cpixels(dst, dst_fmt, &palette[..bpp], src_fmt, 1);
        return;
    }

    if let Some(size) = palette_size {
        let len_before = dst.len();
        encode_packed_tile(dst, dst_fmt, src, src_fmt, len, &palette[..size * bpp], size);

        // A packed tile that beats raw wins; otherwise roll it back.
        if dst.len() - len_before <= 1 + cpixel_len * len {
            return;
        }
        dst.truncate(len_before);
    }

    dst.put_u8(0);
    pixels_to_cpixels(dst, dst_fmt, src, src_fmt, len);
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

    fn inflate(compressed: &[u8]) -> Vec<u8> {
        let mut z = Decompress::new(true);
        let mut out = Vec::new();
        let mut chunk = vec![0u8; 64 * 1024];
        let mut pos = 0usize;
        loop {
            let before_in = z.total_in();
            let before_out = z.total_out();
            z.decompress(&compressed[pos..], &mut chunk, FlushDecompress::Sync)
                .unwrap();
            pos += (z.total_in() - before_in) as usize;
            out.extend_from_slice(&chunk[..(z.total_out() - before_out) as usize]);
            if z.total_in() == before_in && z.total_out() == before_out {
                break;
            }
            if pos >= compressed.len() && ((z.total_out() - before_out) as usize) < chunk.len()
            {
                break;
            }
        }
        out
    }

    /// Reference ZRLE tile-stream decoder for 3-byte cpixels.
    fn decode_tiles(data: &[u8], width: usize, height: usize) -> Vec<u32> {
        let mut out = vec![0u32; width * height];
        let mut pos = 0usize;

        for tile_y in (0..height).step_by(TILE_LENGTH) {
            for tile_x in (0..width).step_by(TILE_LENGTH) {
                let tile_w = (width - tile_x).min(TILE_LENGTH);
                let tile_h = (height - tile_y).min(TILE_LENGTH);
                let len = tile_w * tile_h;

                let subenc = data[pos];
                pos += 1;

                let mut tile_pixels = Vec::with_capacity(len);
                match subenc {
                    0 => {
                        for _ in 0..len {
                            tile_pixels.push(read_cpixel(data, &mut pos));
                        }
                    }
                    1 => {
                        let value = read_cpixel(data, &mut pos);
                        tile_pixels.resize(len, value);
                    }
                    n if n & 128 != 0 => {
                        let palette_size = usize::from(n & 127);
                        let palette: Vec<u32> = (0..palette_size)
                            .map(|_| read_cpixel(data, &mut pos))
                            .collect();
                        while tile_pixels.len() < len {
                            let byte = data[pos];
                            pos += 1;
                            let index = usize::from(byte & 127);
                            if byte & 128 == 0 {
                                tile_pixels.push(palette[index]);
                            } else {
                                let mut run = 1usize;
                                loop {
                                    let b = data[pos];
                                    pos += 1;
                                    run += usize::from(b);
                                    if b != 255 {
                                        break;
                                    }
                                }
                                tile_pixels
                                    .extend(std::iter::repeat(palette[index]).take(run));
                            }
                        }
                    }
                    other => panic!("unexpected sub-encoding {other}"),
                }

                for row in 0..tile_h {
                    for col in 0..tile_w {
                        out[(tile_y + row) * width + tile_x + col] =
                            tile_pixels[row * tile_w + col];
                    }
                }
            }
        }

        assert_eq!(pos, data.len());
        out
    }

    fn read_cpixel(data: &[u8], pos: &mut usize) -> u32 {
        let v = u32::from(data[*pos])
            | (u32::from(data[*pos + 1]) << 8)
            | (u32::from(data[*pos + 2]) << 16);
        *pos += 3;
        v
    }

    fn encode_and_decode(fb: std::sync::Arc<Framebuffer>, w: usize, h: usize) -> Vec<u32> {
        let cfb = CompositeFb::single(fb);
        let damage = Region::from_rect(Rect::new(0, 0, w as i32, h as i32));

        let mut deflate = ParallelDeflate::new(1);
        let frame = encode_frame(&mut deflate, &xrgb(), &cfb, &damage).unwrap();
        assert_eq!(frame.n_rects, 1);

        // Parse: 12-byte rect header, u32 zlib length, zlib bytes.
        let buf = &frame.buf;
        assert_eq!(&buf[8..12], &ENCODING_ZRLE.to_be_bytes());
        let zlen =
            u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
        assert_eq!(buf.len(), 16 + zlen);

        let tile_stream = inflate(&buf[16..16 + zlen]);
        decode_tiles(&tile_stream, w, h)
    }

    fn fill_fb(values: &[u32], w: usize, h: usize) -> std::sync::Arc<Framebuffer> {
        let fb = Framebuffer::new(w as u32, h as u32, FOURCC_XRGB8888, w as u32).unwrap();
        {
            let mut pixels = fb.map_mut();
            for (i, &v) in values.iter().take(w * h).enumerate() {
                pixels[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
        fb
    }

    #[test]
    fn solid_rect_round_trips() {
        let (w, h) = (70, 66); // spans 2x2 tiles
        let values = vec![0x123456u32; w * h];
        let fb = fill_fb(&values, w, h);
        assert_eq!(encode_and_decode(fb, w, h), values);
    }

    #[test]
    fn two_colour_rect_round_trips() {
        let (w, h) = (64, 64);
        let values: Vec<u32> = (0..w * h)
            .map(|i| if (i / 7) % 2 == 0 { 0xff0000 } else { 0x0000ff })
            .collect();
        let fb = fill_fb(&values, w, h);
        assert_eq!(encode_and_decode(fb, w, h), values);
    }

    #[test]
    fn noisy_rect_round_trips() {
        let (w, h) = (100, 50);
        let mut seed = 0x12345678u32;
        let values: Vec<u32> = (0..w * h)
            .map(|_| {
                seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                seed & 0x00ff_ffff
            })
            .collect();
        let fb = fill_fb(&values, w, h);
        assert_eq!(encode_and_decode(fb, w, h), values);
    }

    #[test]
    fn fragmented_damage_falls_back_to_full_bounds_per_buffer() {
        let left = Framebuffer::new(512, 512, FOURCC_XRGB8888, 512).unwrap();
        let right = Framebuffer::new(512, 512, FOURCC_XRGB8888, 512).unwrap();
        let cfb = CompositeFb::new(vec![
            PlacedFb { fb: left, x_off: 0, y_off: 0 },
            PlacedFb { fb: right, x_off: 512, y_off: 0 },
        ])
        .unwrap();

        // More single-pixel rectangles inside the left buffer than a u16
        // can count.
        let rects: Vec<Rect> = (0..70_000)
            .map(|i| Rect::new(i % 512, i / 512, 1, 1))
            .collect();
        let damage = Region::from_disjoint_rects(rects);

        let mut deflate = ParallelDeflate::new(1);
        let frame = encode_frame(&mut deflate, &xrgb(), &cfb, &damage).unwrap();

        // One full-bounds rectangle per source buffer.
        assert_eq!(frame.n_rects, 2);
        let buf = &frame.buf;
        assert_eq!(&buf[0..4], &[0, 0, 0, 0]); // left at (0, 0)
        assert_eq!(&buf[4..8], &[2, 0, 2, 0]); // 512x512
        let zlen = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
        let second = 16 + zlen;
        assert_eq!(&buf[second..second + 4], &[2, 0, 0, 0]); // right at (512, 0)
        assert_eq!(&buf[second + 4..second + 8], &[2, 0, 2, 0]);
    }

    #[test]
    fn long_runs_cross_the_255_boundary() {
        let (w, h) = (64, 64);
        // One long run of A (> 255 pixels), then B for the rest.
        let values: Vec<u32> = (0..w * h)
            .map(|i| if i < 700 { 0x00aa00 } else { 0x0055ff })
            .collect();
        let fb = fill_fb(&values, w, h);
        assert_eq!(encode_and_decode(fb, w, h), values);
    }
}
