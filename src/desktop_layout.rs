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

//! Desktop layout changes: SetDesktopSize and ExtendedDesktopSize.
//!
//! Clients that negotiated the ExtendedDesktopSize pseudo-encoding may ask
//! for a new framebuffer size and multi-screen arrangement. The request is
//! forwarded to the host; the protocol reply is a pseudo-rectangle whose
//! position fields carry the status code.

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::{Screen, ENCODING_EXTENDED_DESKTOP_SIZE};

/// A desktop layout: total size plus per-screen geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopLayout {
    /// Framebuffer width in pixels.
    pub width: u16,
    /// Framebuffer height in pixels.
    pub height: u16,
    /// The screens tiling the framebuffer.
    pub screens: Vec<Screen>,
}

impl DesktopLayout {
    /// Basic sanity: at least one screen and every screen inside the
    /// framebuffer bounds.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.screens.is_empty()
            && self.screens.iter().all(|s| {
                u32::from(s.x) + u32::from(s.width) <= u32::from(self.width)
                    && u32::from(s.y) + u32::from(s.height) <= u32::from(self.height)
            })
    }
}

/// Parses a SetDesktopSize message body (after the message-type byte has
/// been identified but not consumed).
///
/// Returns `None` when the buffer does not yet hold the whole message;
/// otherwise consumes it and returns the layout.
#[must_use]
pub fn parse_set_desktop_size(buf: &mut BytesMut) -> Option<DesktopLayout> {
    // type, padding, width, height, n_screens, padding
    if buf.len() < 8 {
        return None;
    }
    let n_screens = usize::from(buf[6]);
    if buf.len() < 8 + n_screens * 16 {
        return None;
    }

    buf.advance(2);
    let width = buf.get_u16();
    let height = buf.get_u16();
    buf.advance(2);

    let screens = (0..n_screens).map(|_| Screen::from_bytes(buf)).collect();
    Some(DesktopLayout { width, height, screens })
}

/// Appends the ExtendedDesktopSize rectangle.
///
/// The x field carries the reason (0 = server-side change, 1 = reply to
/// this client's request), the y field the status code.
pub fn put_extended_desktop_size_rect(
    dst: &mut BytesMut,
    reason: u16,
    status: u16,
    layout: &DesktopLayout,
) {
    dst.put_u16(reason);
    dst.put_u16(status);
    dst.put_u16(layout.width);
    dst.put_u16(layout.height);
    dst.put_i32(ENCODING_EXTENDED_DESKTOP_SIZE);

    dst.put_u8(layout.screens.len() as u8);
    dst.put_bytes(0, 3);
    for screen in &layout.screens {
        screen.write_to(dst);
    }
}
