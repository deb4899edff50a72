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

//! # prismvnc
//!
//! A pure Rust VNC (RFB) server library.
//!
//! prismvnc implements the server side of the Remote Framebuffer protocol
//! (RFC 6143) together with the extensions modern clients expect:
//! VeNCrypt, Apple Diffie-Hellman and RSA-AES security types,
//! ContinuousUpdates, Fence-based flow control, ExtendedDesktopSize, rich
//! cursors, the extended clipboard, and the QEMU key/LED extensions.
//! Transports: plain TCP, Unix-domain sockets, TLS (via VeNCrypt),
//! WebSocket, and AES-EAX encrypted RSA-AES channels.
//!
//! ## Features
//!
//! - **Encodings**: Raw, ZRLE (worker-parallel deflate), Tight (four zlib
//!   streams plus optional JPEG), and optional Open H.264
//! - **Multi-buffer desktops**: several displays compose into one screen,
//!   with per-buffer rotation/mirroring and scaling
//! - **Damage refinement**: per-tile content hashing drops unchanged pixels
//!   before they reach an encoder
//! - **Flow control**: per-client bandwidth estimation with fence-paced
//!   back-pressure
//! - **Async I/O**: built on Tokio; CPU-heavy stages run on worker threads
//!
//! ## Quick Start
//!
//! ```no_run
//! use prismvnc::{Framebuffer, Rect, Region, VncServer};
//! use prismvnc::pixels::FOURCC_XRGB8888;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = VncServer::new("my desktop");
//!     let display = server.add_display(0, 0);
//!     server.listen("0.0.0.0:5900").await?;
//!
//!     let fb = Framebuffer::new(1280, 720, FOURCC_XRGB8888, 1280)?;
//!     // ... render into fb.map_mut() ...
//!     display.feed(fb, &Region::from_rect(Rect::new(0, 0, 1280, 720)));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! producer ──feed──▶ Display ──▶ Server ──damage──▶ per-client session
//!                                                      │
//!                                     Compositor ◀─────┤
//!                                     Damage refinery ◀┤
//!                                     Encoder ◀────────┤
//!                                                      ▼
//!                                          Stream (TCP/TLS/WS/RSA-AES)
//! ```
//!
//! Input events flow the other way: stream, parser, then callbacks into
//! the host through the server's event channel.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod bandwidth;
pub mod composite;
pub mod crypto;
pub mod cursor;
pub mod damage;
pub mod damage_refinery;
pub mod desktop_layout;
pub mod display;
pub mod encoding;
pub mod error;
pub mod events;
pub mod fb;
pub mod fb_pool;
pub mod parallel_deflate;
pub mod pixels;
pub mod protocol;
pub mod resampler;
pub mod server;
pub mod stream;
pub mod transform;
pub mod translate;

// Internal modules
mod client;
pub mod jpeg;

// Re-exports
pub use composite::{CompositeFb, PlacedFb};
pub use damage::{Rect, Region};
pub use display::Display;
pub use error::{Result, VncError};
pub use events::ServerEvent;
pub use fb::{Framebuffer, NO_PTS};
pub use protocol::PixelFormat;
pub use server::VncServer;
pub use transform::Transform;

/// VNC protocol version.
pub const PROTOCOL_VERSION: &str = protocol::PROTOCOL_VERSION;

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;
