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

//! Displays: the producer-facing surface of the server.
//!
//! A display is a named position on the composite desktop owning the
//! framebuffer most recently fed to it. Producers drive the whole pipeline
//! by calling [`Display::feed`] with a buffer and the damage accumulated
//! since the previous feed. The server owns the display state; this handle
//! holds a non-owning reference and goes inert when the server closes.

use std::sync::{Arc, Weak};

use crate::damage::Region;
use crate::fb::Framebuffer;
use crate::server::ServerInner;

/// Handle to one display slot of a server.
#[derive(Clone)]
pub struct Display {
    id: usize,
    server: Weak<ServerInner>,
}

impl Display {
    pub(crate) fn new(id: usize, server: Weak<ServerInner>) -> Self {
        Self { id, server }
    }

    /// The display's slot id, stable for the server's lifetime.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Moves the display within the composite desktop.
    pub fn set_position(&self, x: i32, y: i32) {
        if let Some(server) = self.server.upgrade() {
            server.set_display_position(self.id, x, y);
        }
    }

    /// Submits a new framebuffer and the damage since the last feed.
    ///
    /// The buffer is referenced until every interested client finished
    /// encoding from it; producers must not write to it while it is held.
    pub fn feed(&self, fb: Arc<Framebuffer>, damage: &Region) {
        if let Some(server) = self.server.upgrade() {
            server.feed_display(self.id, fb, damage);
        } else {
            log::warn!("feed on display {} after server shutdown", self.id);
        }
    }
}
