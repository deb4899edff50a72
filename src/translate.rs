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

//! Pixel translation between framebuffer formats and client formats.
//!
//! Clients negotiate arbitrary packed-RGB layouts; framebuffers arrive in
//! whatever fourcc the producer uses. This module converts between any two
//! supported formats with direct runtime conversion instead of lookup tables,
//! and emits the compact CPIXEL representation used by the ZRLE and Tight
//! encodings.
//!
//! # Performance
//!
//! Direct per-pixel translation keeps the code simple and the memory
//! footprint flat; the optimizer vectorizes the common 32-bit to 32-bit
//! cases well enough that table generation never paid for itself here.

use crate::protocol::PixelFormat;
use bytes::{BufMut, BytesMut};

/// Number of bytes a CPIXEL occupies for the given destination format.
///
/// For 32 bits-per-pixel formats the compact representation drops one byte
/// whenever all three colour channels fit entirely within either the three
/// least significant or the three most significant bytes of the pixel word.
/// The depth field is deliberately ignored; checking the actual shifts is
/// what the major client implementations do, and it is required for macOS
/// Screen Sharing which advertises depth 32 while expecting 3-byte cpixels.
#[must_use]
pub fn bytes_per_cpixel(fmt: &PixelFormat) -> usize {
    if fmt.bits_per_pixel == 32 {
        if fits_in_ls3_bytes(fmt) || fits_in_ms3_bytes(fmt) {
            return 3;
        }
        return 4;
    }
    usize::from(fmt.bits_per_pixel).div_ceil(8)
}

fn channel_width(max: u16) -> u32 {
    if max == 0 {
        0
    } else {
        16 - max.leading_zeros()
    }
}

fn fits_in_ls3_bytes(fmt: &PixelFormat) -> bool {
    u32::from(fmt.red_shift) + channel_width(fmt.red_max) <= 24
        && u32::from(fmt.green_shift) + channel_width(fmt.green_max) <= 24
        && u32::from(fmt.blue_shift) + channel_width(fmt.blue_max) <= 24
}

fn fits_in_ms3_bytes(fmt: &PixelFormat) -> bool {
    fmt.red_shift >= 8 && fmt.green_shift >= 8 && fmt.blue_shift >= 8
}

/// Reads one packed pixel value from `src` according to `fmt`.
#[inline]
fn read_pixel(src: &[u8], fmt: &PixelFormat) -> u32 {
    match fmt.bits_per_pixel {
        8 => u32::from(src[0]),
        16 => {
            if fmt.big_endian_flag != 0 {
                u32::from(u16::from_be_bytes([src[0], src[1]]))
            } else {
                u32::from(u16::from_le_bytes([src[0], src[1]]))
            }
        }
        24 => {
            if fmt.big_endian_flag != 0 {
                (u32::from(src[0]) << 16) | (u32::from(src[1]) << 8) | u32::from(src[2])
            } else {
                (u32::from(src[2]) << 16) | (u32::from(src[1]) << 8) | u32::from(src[0])
            }
        }
        _ => {
            if fmt.big_endian_flag != 0 {
                u32::from_be_bytes([src[0], src[1], src[2], src[3]])
            } else {
                u32::from_le_bytes([src[0], src[1], src[2], src[3]])
            }
        }
    }
}

/// Writes one packed pixel value into `dst` according to `fmt`.
#[inline]
fn write_pixel(dst: &mut BytesMut, value: u32, fmt: &PixelFormat) {
    match fmt.bits_per_pixel {
        8 => dst.put_u8(value as u8),
        16 => {
            if fmt.big_endian_flag != 0 {
                dst.put_slice(&(value as u16).to_be_bytes());
            } else {
                dst.put_slice(&(value as u16).to_le_bytes());
            }
        }
        24 => {
            let b = if fmt.big_endian_flag != 0 {
                [(value >> 16) as u8, (value >> 8) as u8, value as u8]
            } else {
                [value as u8, (value >> 8) as u8, (value >> 16) as u8]
            };
            dst.put_slice(&b);
        }
        _ => {
            if fmt.big_endian_flag != 0 {
                dst.put_slice(&value.to_be_bytes());
            } else {
                dst.put_slice(&value.to_le_bytes());
            }
        }
    }
}

/// Extracts 8-bit RGB components from a packed pixel.
#[inline]
fn extract_rgb(pixel: &[u8], fmt: &PixelFormat) -> (u8, u8, u8) {
    let value = read_pixel(pixel, fmt);

    let r_raw = (value >> fmt.red_shift) & u32::from(fmt.red_max);
    let g_raw = (value >> fmt.green_shift) & u32::from(fmt.green_max);
    let b_raw = (value >> fmt.blue_shift) & u32::from(fmt.blue_max);

    (
        scale_component(r_raw, fmt.red_max),
        scale_component(g_raw, fmt.green_max),
        scale_component(b_raw, fmt.blue_max),
    )
}

/// Packs 8-bit RGB components into a pixel value in the destination format.
#[inline]
fn pack_rgb(r: u8, g: u8, b: u8, fmt: &PixelFormat) -> u32 {
    (u32::from(downscale_component(r, fmt.red_max)) << fmt.red_shift)
        | (u32::from(downscale_component(g, fmt.green_max)) << fmt.green_shift)
        | (u32::from(downscale_component(b, fmt.blue_max)) << fmt.blue_shift)
}

/// Scales a colour component from its native range to 8-bit.
#[inline]
fn scale_component(value: u32, max: u16) -> u8 {
    if max == 0 {
        return 0;
    }
    if max == 255 {
        return value as u8;
    }
    ((u64::from(value) * 255) / u64::from(max)) as u8
}

/// Downscales an 8-bit colour component to the destination range.
#[inline]
fn downscale_component(value: u8, max: u16) -> u16 {
    if max == 0 {
        return 0;
    }
    if max == 255 {
        return u16::from(value);
    }
    ((u32::from(value) * u32::from(max)) / 255) as u16
}

/// Translates `count` pixels from `src` into `dst`, converting between the
/// two formats. When the formats match the bytes are copied through.
pub fn translate_pixels(
    dst: &mut BytesMut,
    dst_fmt: &PixelFormat,
    src: &[u8],
    src_fmt: &PixelFormat,
    count: usize,
) {
    let src_bpp = src_fmt.bytes_per_pixel();

    if src_fmt == dst_fmt {
        dst.extend_from_slice(&src[..count * src_bpp]);
        return;
    }

    for i in 0..count {
        let pixel = &src[i * src_bpp..(i + 1) * src_bpp];
        let (r, g, b) = extract_rgb(pixel, src_fmt);
        write_pixel(dst, pack_rgb(r, g, b, dst_fmt), dst_fmt);
    }
}

/// Translates `count` pixels into the compact CPIXEL form of `dst_fmt`.
///
/// A 4-byte destination word shrinks to 3 bytes when [`bytes_per_cpixel`]
/// says so; the dropped byte is the unused one, so the emitted bytes follow
/// the destination byte order with either the most or the least significant
/// byte removed.
pub fn pixels_to_cpixels(
    dst: &mut BytesMut,
    dst_fmt: &PixelFormat,
    src: &[u8],
    src_fmt: &PixelFormat,
    count: usize,
) {
    let cpixel_len = bytes_per_cpixel(dst_fmt);
    if cpixel_len == dst_fmt.bytes_per_pixel() {
        translate_pixels(dst, dst_fmt, src, src_fmt, count);
        return;
    }

    // 32 bpp shrunk to 3 bytes. Channels sitting in the high three bytes
    // shift down before emission.
    let shift_down = !fits_in_ls3_bytes(dst_fmt);
    let src_bpp = src_fmt.bytes_per_pixel();

    for i in 0..count {
        let pixel = &src[i * src_bpp..(i + 1) * src_bpp];
        let (r, g, b) = extract_rgb(pixel, src_fmt);
        let mut value = pack_rgb(r, g, b, dst_fmt);
        if shift_down {
            value >>= 8;
        }
        if dst_fmt.big_endian_flag != 0 {
            dst.put_slice(&[(value >> 16) as u8, (value >> 8) as u8, value as u8]);
        } else {
            dst.put_slice(&[value as u8, (value >> 8) as u8, (value >> 16) as u8]);
        }
    }
}

/// Translates a rectangle out of a strided framebuffer into a tightly packed
/// destination buffer in the client's format.
///
/// `stride` is in pixels, as is everything else.
#[allow(clippy::too_many_arguments)]
pub fn translate_rect(
    dst: &mut BytesMut,
    dst_fmt: &PixelFormat,
    src: &[u8],
    src_fmt: &PixelFormat,
    stride: usize,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
) {
    let src_bpp = src_fmt.bytes_per_pixel();
    for row in 0..height {
        let start = ((y + row) * stride + x) * src_bpp;
        translate_pixels(dst, dst_fmt, &src[start..start + width * src_bpp], src_fmt, width);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::{pixfmt_from_fourcc, FOURCC_BGR233, FOURCC_RGB565, FOURCC_XRGB8888};

    fn xrgb() -> PixelFormat {
        pixfmt_from_fourcc(FOURCC_XRGB8888).unwrap()
    }

    #[test]
    fn identical_formats_copy_through() {
        let fmt = xrgb();
        let src = [0x20u8, 0x40, 0x80, 0x00, 0x01, 0x02, 0x03, 0x00];
        let mut dst = BytesMut::new();
        translate_pixels(&mut dst, &fmt, &src, &fmt, 2);
        assert_eq!(&dst[..], &src[..]);
    }

    #[test]
    fn xrgb_to_rgb565() {
        let src_fmt = xrgb();
        let dst_fmt = pixfmt_from_fourcc(FOURCC_RGB565).unwrap();

        // Pure red in little-endian XRGB memory: B G R X
        let src = [0x00u8, 0x00, 0xff, 0x00];
        let mut dst = BytesMut::new();
        translate_pixels(&mut dst, &dst_fmt, &src, &src_fmt, 1);

        assert_eq!(dst.len(), 2);
        assert_eq!(u16::from_le_bytes([dst[0], dst[1]]), 0xF800);
    }

    #[test]
    fn round_trip_preserves_common_depth() {
        // XRGB -> RGB565 -> XRGB must keep the top bits of each channel.
        let fmt32 = xrgb();
        let fmt16 = pixfmt_from_fourcc(FOURCC_RGB565).unwrap();

        let src = [0x12u8, 0x9a, 0xd6, 0x00];
        let mut mid = BytesMut::new();
        translate_pixels(&mut mid, &fmt16, &src, &fmt32, 1);
        let mut back = BytesMut::new();
        translate_pixels(&mut back, &fmt32, &mid, &fmt16, 1);

        // 5-bit channels keep 5 significant bits.
        assert_eq!(back[2] >> 3, src[2] >> 3); // red
        assert_eq!(back[1] >> 2, src[1] >> 2); // green, 6 bits
        assert_eq!(back[0] >> 3, src[0] >> 3); // blue
    }

    #[test]
    fn round_trip_to_8bpp() {
        let fmt32 = xrgb();
        let fmt8 = pixfmt_from_fourcc(FOURCC_BGR233).unwrap();

        let src = [0xffu8, 0x00, 0xff, 0x00]; // magenta
        let mut mid = BytesMut::new();
        translate_pixels(&mut mid, &fmt8, &src, &fmt32, 1);
        let mut back = BytesMut::new();
        translate_pixels(&mut back, &fmt32, &mid, &fmt8, 1);

        assert_eq!(back[2] >> 5, src[2] >> 5);
        assert_eq!(back[1] >> 5, src[1] >> 5);
        assert_eq!(back[0] >> 6, src[0] >> 6);
    }

    #[test]
    fn cpixel_is_three_bytes_for_ls3_formats() {
        assert_eq!(bytes_per_cpixel(&xrgb()), 3);
    }

    #[test]
    fn cpixel_is_three_bytes_when_depth_lies() {
        // macOS Screen Sharing: bpp 32, depth 32, shifts 16/8/0.
        let mut fmt = xrgb();
        fmt.depth = 32;
        assert_eq!(bytes_per_cpixel(&fmt), 3);
    }

    #[test]
    fn cpixel_is_four_bytes_for_straddling_channels() {
        let mut fmt = xrgb();
        fmt.red_shift = 22; // red straddles the high byte boundary
        fmt.green_shift = 11;
        fmt.blue_shift = 0;
        assert_eq!(bytes_per_cpixel(&fmt), 4);
    }

    #[test]
    fn cpixel_is_three_bytes_for_ms3_formats() {
        let mut fmt = xrgb();
        fmt.red_shift = 24;
        fmt.green_shift = 16;
        fmt.blue_shift = 8;
        assert_eq!(bytes_per_cpixel(&fmt), 3);
    }

    #[test]
    fn cpixel_emission_drops_unused_byte() {
        let fmt = xrgb();
        let src = [0x33u8, 0x66, 0x99, 0x00]; // B G R X little-endian
        let mut dst = BytesMut::new();
        pixels_to_cpixels(&mut dst, &fmt, &src, &fmt, 1);
        assert_eq!(&dst[..], &[0x33, 0x66, 0x99]);
    }

    #[test]
    fn cpixel_for_16bpp_matches_pixel_size() {
        let fmt = pixfmt_from_fourcc(FOURCC_RGB565).unwrap();
        assert_eq!(bytes_per_cpixel(&fmt), 2);
        let src_fmt = xrgb();
        let src = [0x00u8, 0xff, 0x00, 0x00]; // green
        let mut dst = BytesMut::new();
        pixels_to_cpixels(&mut dst, &fmt, &src, &src_fmt, 1);
        assert_eq!(u16::from_le_bytes([dst[0], dst[1]]), 0x07E0);
    }
}
