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

//! VNC Remote Framebuffer (RFB) protocol constants and structures.
//!
//! This module provides the fundamental building blocks for VNC protocol
//! communication, including protocol version negotiation, message types,
//! security handshakes, encodings, and pixel format definitions. It implements
//! the RFB protocol as specified in RFC 6143 together with the extensions this
//! server speaks: VeNCrypt, Apple Diffie-Hellman and RSA-AES security types,
//! ContinuousUpdates, Fence, ExtendedDesktopSize, the cursor and LED-state
//! pseudo-encodings, the QEMU extended key event and the extended clipboard.
//!
//! # Protocol Overview
//!
//! The VNC RFB protocol operates in the following phases:
//! 1. **Protocol Version** - Server and client agree on protocol version
//! 2. **Security Handshake** - Authentication method selection and execution
//! 3. **Initialization** - Exchange of framebuffer parameters and capabilities
//! 4. **Normal Operation** - Ongoing message exchange for input events and screen updates
//!
//! All multi-byte integers on the wire are big-endian.

use bytes::{Buf, BufMut, BytesMut};
use std::io;

/// The RFB protocol version string advertised by the server.
///
/// This server implements RFB protocol version 3.8. The version string must be
/// exactly 12 bytes including the newline character.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Older protocol revisions the server still accepts from clients.
pub const PROTOCOL_VERSION_3_3: &str = "RFB 003.003\n";
/// RFB 3.7 adds the security-type list but not the failure reason.
pub const PROTOCOL_VERSION_3_7: &str = "RFB 003.007\n";

// Client-to-Server Message Types

/// Message type: Client requests to change the pixel format.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Message type: Client specifies supported encodings, ordered by preference.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Message type: Client requests a framebuffer update (incremental or full).
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: Client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: Client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: Client sends cut text (clipboard data).
///
/// When the extended clipboard capability has been negotiated through the
/// corresponding pseudo-encoding, a negative length turns this message into an
/// extended clipboard message carrying a format/action bitmask.
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

/// Message type: Client enables continuous updates for a bounded rectangle.
///
/// Defined by the ContinuousUpdates extension. The server acknowledges with
/// [`SERVER_MSG_END_OF_CONTINUOUS_UPDATES`] when the feature is switched off.
pub const CLIENT_MSG_ENABLE_CONTINUOUS_UPDATES: u8 = 150;

/// Message type: Client fence message (flags + payload echoed by the peer).
pub const CLIENT_MSG_FENCE: u8 = 248;

/// Message type: Client requests a desktop resize (SetDesktopSize).
pub const CLIENT_MSG_SET_DESKTOP_SIZE: u8 = 251;

/// Message type: QEMU client message family; subtype 0 is the extended key
/// event carrying an XT keycode next to the keysym.
pub const CLIENT_MSG_QEMU: u8 = 255;

/// QEMU message subtype: extended key event.
pub const QEMU_MSG_EXTENDED_KEY_EVENT: u8 = 0;

// Server-to-Client Message Types

/// Message type: Server sends a framebuffer update.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Message type: Server sends a bell (beep) notification.
#[allow(dead_code)]
pub const SERVER_MSG_BELL: u8 = 2;

/// Message type: Server sends cut text (clipboard data).
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

/// Message type: Server signals the end of continuous updates.
pub const SERVER_MSG_END_OF_CONTINUOUS_UPDATES: u8 = 150;

/// Message type: Server fence message.
pub const SERVER_MSG_FENCE: u8 = 248;

// Fence flags

/// Fence flag: all messages preceding the fence must be processed first.
pub const FENCE_BLOCK_BEFORE: u32 = 1 << 0;
/// Fence flag: message processing pauses until the fence response is sent.
pub const FENCE_BLOCK_AFTER: u32 = 1 << 1;
/// Fence flag: the fence must be responded to as soon as possible.
pub const FENCE_SYNC_NEXT: u32 = 1 << 2;
/// Fence flag: this fence is a response to an earlier fence.
pub const FENCE_REQUEST: u32 = 1 << 31;
/// Mask of fence flags the server understands and may echo back.
pub const FENCE_FLAGS_SUPPORTED: u32 =
    FENCE_BLOCK_BEFORE | FENCE_BLOCK_AFTER | FENCE_SYNC_NEXT;
/// Longest fence payload the protocol permits.
pub const FENCE_MAX_PAYLOAD: usize = 64;

// Encoding Types

/// Encoding type: Raw pixel data. High bandwidth but universally supported.
pub const ENCODING_RAW: i32 = 0;

/// Encoding type: Copy Rectangle.
#[allow(dead_code)]
pub const ENCODING_COPYRECT: i32 = 1;

/// Encoding type: Tight encoding; tiled zlib streams plus optional JPEG.
pub const ENCODING_TIGHT: i32 = 7;

/// Encoding type: Tile Run-Length Encoding (uncompressed sibling of ZRLE).
#[allow(dead_code)]
pub const ENCODING_TRLE: i32 = 15;

/// Encoding type: Zlib-compressed Tile Run-Length Encoding.
pub const ENCODING_ZRLE: i32 = 16;

/// Encoding type: Open H.264 video streams.
pub const ENCODING_OPEN_H264: i32 = 50;

/// Pseudo-encoding: Rich cursor shape with alpha bitmask.
pub const ENCODING_CURSOR: i32 = -239;

/// Pseudo-encoding: Desktop size change notification.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

/// Pseudo-encoding: Extended desktop size (multi-screen layout).
pub const ENCODING_EXTENDED_DESKTOP_SIZE: i32 = -308;

/// Pseudo-encoding: QEMU extended key event support.
pub const ENCODING_QEMU_EXT_KEY_EVENT: i32 = -258;

/// Pseudo-encoding: QEMU keyboard LED state.
pub const ENCODING_QEMU_LED_STATE: i32 = -261;

/// Pseudo-encoding: Fence extension support.
pub const ENCODING_FENCE: i32 = -312;

/// Pseudo-encoding: ContinuousUpdates extension support.
pub const ENCODING_CONTINUOUS_UPDATES: i32 = -313;

/// Pseudo-encoding: Extended clipboard capability announcement.
pub const ENCODING_EXTENDED_CLIPBOARD: i32 = 0xc0a1_e5ceu32 as i32;

/// Pseudo-encoding: JPEG quality levels -32 (lowest) through -23 (highest).
pub const ENCODING_QUALITY_LEVEL_0: i32 = -32;
/// Highest JPEG quality pseudo-encoding.
pub const ENCODING_QUALITY_LEVEL_9: i32 = -23;

/// Pseudo-encoding: compression levels -256 (fastest) through -247 (densest).
pub const ENCODING_COMPRESS_LEVEL_0: i32 = -256;
/// Maximum compression pseudo-encoding.
pub const ENCODING_COMPRESS_LEVEL_9: i32 = -247;

// ExtendedDesktopSize status codes, sent in the x field of the reply rectangle.

/// Desktop resize succeeded.
pub const EXT_DESKTOP_SIZE_STATUS_OK: u16 = 0;
/// Desktop resize is administratively prohibited.
#[allow(dead_code)]
pub const EXT_DESKTOP_SIZE_STATUS_PROHIBITED: u16 = 1;
/// Desktop resize failed for lack of resources.
#[allow(dead_code)]
pub const EXT_DESKTOP_SIZE_STATUS_OUT_OF_RESOURCES: u16 = 2;
/// The requested layout is invalid.
pub const EXT_DESKTOP_SIZE_STATUS_INVALID: u16 = 3;

// Extended clipboard formats and actions (TigerVNC numbering).

/// Extended clipboard: UTF-8 text format bit.
pub const EXT_CLIPBOARD_FORMAT_TEXT: u32 = 1 << 0;
/// Extended clipboard: caps action bit.
pub const EXT_CLIPBOARD_ACTION_CAPS: u32 = 1 << 24;
/// Extended clipboard: request action bit.
pub const EXT_CLIPBOARD_ACTION_REQUEST: u32 = 1 << 25;
/// Extended clipboard: peek action bit.
pub const EXT_CLIPBOARD_ACTION_PEEK: u32 = 1 << 26;
/// Extended clipboard: notify action bit.
pub const EXT_CLIPBOARD_ACTION_NOTIFY: u32 = 1 << 27;
/// Extended clipboard: provide action bit.
pub const EXT_CLIPBOARD_ACTION_PROVIDE: u32 = 1 << 28;

/// Upper bound for legacy cut-text payloads (10 MB, anti-DoS).
pub const MAX_CUT_TEXT_SIZE: usize = 10_000_000;

// Security Types

/// Security type: Invalid/Unknown.
pub const SECURITY_TYPE_INVALID: u8 = 0;

/// Security type: None (no authentication).
pub const SECURITY_TYPE_NONE: u8 = 1;

/// Security type: classic VNC Authentication (DES challenge-response).
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

/// Security type: RSA-AES with 128-bit session keys (RA2).
pub const SECURITY_TYPE_RSA_AES: u8 = 5;

/// Security type: RSA-AES unencrypted credential variant (RA2ne).
pub const SECURITY_TYPE_RSA_AES_UNENCRYPTED: u8 = 6;

/// Security type: Tight security negotiation.
#[allow(dead_code)]
pub const SECURITY_TYPE_TIGHT: u8 = 16;

/// Security type: VeNCrypt sub-negotiation.
pub const SECURITY_TYPE_VENCRYPT: u8 = 19;

/// Security type: Apple Diffie-Hellman (macOS Screen Sharing).
pub const SECURITY_TYPE_APPLE_DH: u8 = 30;

/// Security type: RSA-AES with 256-bit session keys (RA2-256).
pub const SECURITY_TYPE_RSA_AES_256: u8 = 129;

/// Security type: RSA-AES-256 unencrypted credential variant (RA2ne-256).
pub const SECURITY_TYPE_RSA_AES_256_UNENCRYPTED: u8 = 130;

// VeNCrypt subtypes

/// VeNCrypt subtype: plain username/password without TLS.
#[allow(dead_code)]
pub const VENCRYPT_PLAIN: u32 = 256;
/// VeNCrypt subtype: anonymous TLS, no authentication.
#[allow(dead_code)]
pub const VENCRYPT_TLS_NONE: u32 = 257;
/// VeNCrypt subtype: X.509 TLS followed by plain username/password.
pub const VENCRYPT_X509_PLAIN: u32 = 262;

// RSA-AES credential subtypes

/// RSA-AES credentials: username and password follow.
pub const RSA_AES_CRED_SUBTYPE_USER_AND_PASS: u8 = 1;
/// RSA-AES credentials: password only.
#[allow(dead_code)]
pub const RSA_AES_CRED_SUBTYPE_PASS_ONLY: u8 = 2;

// Security Results

/// Security result: handshake succeeded.
pub const SECURITY_RESULT_OK: u32 = 0;

/// Security result: handshake failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// Represents the pixel format of the VNC framebuffer.
///
/// This struct defines how pixel data is interpreted, including color depth,
/// endianness, and RGB component details. The wire representation is 16 bytes
/// exactly: 4 single-byte fields, 3 big-endian maxima, 3 shifts, 3 padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Number of bits per pixel.
    pub bits_per_pixel: u8,
    /// Depth of the pixel in bits.
    pub depth: u8,
    /// Flag indicating if the pixel data is big-endian (1) or little-endian (0).
    pub big_endian_flag: u8,
    /// Flag indicating if the pixel format is true-colour (1) or colormapped (0).
    pub true_colour_flag: u8,
    /// Maximum red color value.
    pub red_max: u16,
    /// Maximum green color value.
    pub green_max: u16,
    /// Maximum blue color value.
    pub blue_max: u16,
    /// Number of shifts to apply to get the red color component.
    pub red_shift: u8,
    /// Number of shifts to apply to get the green color component.
    pub green_shift: u8,
    /// Number of shifts to apply to get the blue color component.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Creates the server's native format: 32-bit little-endian with red in
    /// the low byte (RGBX memory order).
    #[must_use]
    pub fn rgbx8888() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
        }
    }

    /// Creates a 32-bit XRGB format (blue in the low byte, BGRX memory order).
    #[must_use]
    pub fn xrgb8888() -> Self {
        Self {
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
            ..Self::rgbx8888()
        }
    }

    /// Creates a 16-bit RGB565 pixel format.
    #[must_use]
    pub fn rgb565() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 16,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    /// Validates that this pixel format is supported by the server.
    ///
    /// Colour-mapped formats are rejected outright; for true-colour formats
    /// the component widths must fit the depth and the shifts must stay
    /// within the pixel word.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.bits_per_pixel != 8
            && self.bits_per_pixel != 16
            && self.bits_per_pixel != 24
            && self.bits_per_pixel != 32
        {
            return false;
        }

        if self.depth == 0 || self.depth > 32 || self.bits_per_pixel < self.depth {
            return false;
        }

        if self.true_colour_flag == 0 {
            return false;
        }

        let bits_needed = |max: u16| -> u32 {
            if max == 0 {
                0
            } else {
                16 - max.leading_zeros()
            }
        };

        let red_bits = bits_needed(self.red_max);
        let green_bits = bits_needed(self.green_max);
        let blue_bits = bits_needed(self.blue_max);

        if red_bits + green_bits + blue_bits > u32::from(self.depth) {
            return false;
        }

        u32::from(self.red_shift) + red_bits <= u32::from(self.bits_per_pixel)
            && u32::from(self.green_shift) + green_bits <= u32::from(self.bits_per_pixel)
            && u32::from(self.blue_shift) + blue_bits <= u32::from(self.bits_per_pixel)
    }

    /// Size of one pixel in whole bytes.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel).div_ceil(8)
    }

    /// Writes the 16-byte wire representation into a `BytesMut` buffer.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Reads and deserializes a `PixelFormat` from a buffer.
    ///
    /// # Errors
    ///
    /// Returns `Err(io::Error)` if there are not enough bytes in the buffer
    /// to read a complete `PixelFormat`.
    pub fn from_bytes(buf: &mut BytesMut) -> io::Result<Self> {
        if buf.len() < 16 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Not enough bytes for PixelFormat",
            ));
        }

        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        Ok(pf)
    }
}

/// Represents the `ServerInit` message sent after security negotiation.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// The width of the framebuffer in pixels.
    pub framebuffer_width: u16,
    /// The height of the framebuffer in pixels.
    pub framebuffer_height: u16,
    /// The pixel format used by the framebuffer.
    pub pixel_format: PixelFormat,
    /// The name of the desktop.
    pub name: String,
}

impl ServerInit {
    /// Serializes the `ServerInit` message into a byte buffer.
    ///
    /// The format follows the RFB protocol specification:
    /// - 2 bytes: framebuffer width
    /// - 2 bytes: framebuffer height
    /// - 16 bytes: pixel format
    /// - 4 bytes: name length
    /// - N bytes: name string (UTF-8)
    #[allow(clippy::cast_possible_truncation)] // Desktop name length limited to u32 per VNC protocol
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// Represents a rectangle header in a framebuffer update message.
///
/// Each framebuffer update can contain multiple rectangles, each with its own
/// encoding type.
#[derive(Debug, Clone)]
pub struct Rectangle {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width of the rectangle in pixels.
    pub width: u16,
    /// Height of the rectangle in pixels.
    pub height: u16,
    /// The encoding type used for this rectangle's pixel data.
    pub encoding: i32,
}

impl Rectangle {
    /// Writes the 12-byte rectangle header to a byte buffer.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }
}

/// One screen of an extended desktop layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Screen {
    /// Stable identifier chosen by the server or client.
    pub id: u32,
    /// Horizontal position within the framebuffer.
    pub x: u16,
    /// Vertical position within the framebuffer.
    pub y: u16,
    /// Screen width in pixels.
    pub width: u16,
    /// Screen height in pixels.
    pub height: u16,
    /// Opaque per-screen flags, passed through unchanged.
    pub flags: u32,
}

impl Screen {
    /// Writes the 16-byte wire representation of a screen entry.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.id);
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u32(self.flags);
    }

    /// Reads one screen entry from the buffer.
    pub fn from_bytes(buf: &mut BytesMut) -> Self {
        let id = buf.get_u32();
        let x = buf.get_u16();
        let y = buf.get_u16();
        let width = buf.get_u16();
        let height = buf.get_u16();
        let flags = buf.get_u32();
        Self { id, x, y, width, height, flags }
    }
}

/// Builds the on-wire failure reason used both after a rejected protocol
/// version (zero security-type count) and after a `Failed` security result.
pub fn put_reason(buf: &mut BytesMut, reason: &str) {
    buf.put_u32(reason.len() as u32);
    buf.put_slice(reason.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_wire_size_is_16_bytes() {
        let mut buf = BytesMut::new();
        PixelFormat::rgbx8888().write_to(&mut buf);
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn pixel_format_round_trips_through_wire_form() {
        let fmt = PixelFormat::rgb565();
        let mut buf = BytesMut::new();
        fmt.write_to(&mut buf);
        let parsed = PixelFormat::from_bytes(&mut buf).unwrap();
        assert_eq!(parsed, fmt);
        assert!(buf.is_empty());
    }

    #[test]
    fn colour_mapped_formats_are_rejected() {
        let mut fmt = PixelFormat::rgbx8888();
        fmt.true_colour_flag = 0;
        assert!(!fmt.is_valid());
    }

    #[test]
    fn depth_may_not_exceed_bits_per_pixel() {
        let mut fmt = PixelFormat::rgb565();
        fmt.depth = 24;
        assert!(!fmt.is_valid());
    }

    #[test]
    fn server_init_layout() {
        let init = ServerInit {
            framebuffer_width: 800,
            framebuffer_height: 600,
            pixel_format: PixelFormat::rgbx8888(),
            name: "test".into(),
        };
        let mut buf = BytesMut::new();
        init.write_to(&mut buf);
        assert_eq!(buf.len(), 2 + 2 + 16 + 4 + 4);
        assert_eq!(&buf[0..2], &800u16.to_be_bytes());
        assert_eq!(&buf[20..24], &4u32.to_be_bytes());
        assert_eq!(&buf[24..], b"test");
    }
}
