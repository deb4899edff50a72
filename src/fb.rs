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

//! Reference-counted framebuffers.
//!
//! A [`Framebuffer`] is shared between the producer, the compositor and any
//! number of encoders via `Arc`. Memory lifetime follows the `Arc` strong
//! count; *access* is tracked separately through a hold count: consumers call
//! [`Framebuffer::hold`] before touching pixels and [`Framebuffer::release`]
//! afterwards, and an optional release hook fires when the hold count returns
//! to zero so producers know the buffer is theirs again. Pixel access goes
//! through [`Framebuffer::map`]/[`Framebuffer::map_mut`] guards.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, VncError};
use crate::pixels::{fourcc_bytes_per_pixel, fourcc_to_string};
use crate::transform::Transform;

/// Sentinel presentation timestamp meaning "no timestamp".
pub const NO_PTS: u64 = u64::MAX;

static NEXT_FB_ID: AtomicU64 = AtomicU64::new(1);

type ReleaseFn = Box<dyn Fn(&Framebuffer) + Send + Sync>;

/// A packed-pixel image with refcounted sharing and hold/release semantics.
pub struct Framebuffer {
    id: u64,
    width: u32,
    height: u32,
    logical_width: AtomicU64,
    logical_height: AtomicU64,
    stride: u32,
    fourcc: u32,
    transform: Mutex<Transform>,
    pts: AtomicU64,
    hold_count: AtomicUsize,
    on_release: Mutex<Option<ReleaseFn>>,
    data: Mutex<Vec<u8>>,
}

impl Framebuffer {
    /// Allocates a zeroed framebuffer.
    ///
    /// `stride` is in pixels and must be at least `width`.
    ///
    /// # Errors
    ///
    /// Fails for unsupported fourcc tags or a stride shorter than the width.
    pub fn new(width: u32, height: u32, fourcc: u32, stride: u32) -> Result<Arc<Self>> {
        let bpp = fourcc_bytes_per_pixel(fourcc).ok_or(VncError::InvalidPixelFormat)?;
        if stride < width {
            return Err(VncError::InvalidOperation(format!(
                "stride {stride} shorter than width {width}"
            )));
        }
        let data = vec![0u8; stride as usize * height as usize * bpp];
        Ok(Self::from_pixels(width, height, fourcc, stride, data))
    }

    /// Wraps existing pixel memory.
    ///
    /// The caller guarantees `data` holds at least `stride * height` pixels
    /// in the given format.
    #[must_use]
    pub fn from_pixels(
        width: u32,
        height: u32,
        fourcc: u32,
        stride: u32,
        data: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FB_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            logical_width: AtomicU64::new(u64::from(width)),
            logical_height: AtomicU64::new(u64::from(height)),
            stride,
            fourcc,
            transform: Mutex::new(Transform::Normal),
            pts: AtomicU64::new(NO_PTS),
            hold_count: AtomicUsize::new(0),
            on_release: Mutex::new(None),
            data: Mutex::new(data),
        })
    }

    /// A process-unique identifier, stable for the lifetime of the buffer.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Buffer width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Buffer height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Width as presented to clients; differs from [`Self::width`] when the
    /// output is scaled.
    #[must_use]
    pub fn logical_width(&self) -> u32 {
        self.logical_width.load(Ordering::Relaxed) as u32
    }

    /// Height as presented to clients.
    #[must_use]
    pub fn logical_height(&self) -> u32 {
        self.logical_height.load(Ordering::Relaxed) as u32
    }

    /// Overrides the logical size presented to clients.
    pub fn set_logical_size(&self, width: u32, height: u32) {
        self.logical_width.store(u64::from(width), Ordering::Relaxed);
        self.logical_height.store(u64::from(height), Ordering::Relaxed);
    }

    /// Row stride in pixels.
    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// The fourcc tag describing the pixel layout.
    #[must_use]
    pub fn fourcc(&self) -> u32 {
        self.fourcc
    }

    /// Bytes per pixel for this buffer's format.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        fourcc_bytes_per_pixel(self.fourcc).unwrap_or(4)
    }

    /// The orientation of the stored content relative to the desktop.
    #[must_use]
    pub fn transform(&self) -> Transform {
        *self.transform.lock().unwrap()
    }

    /// Sets the content orientation. Takes effect on the next composite.
    pub fn set_transform(&self, transform: Transform) {
        *self.transform.lock().unwrap() = transform;
    }

    /// Presentation timestamp in microseconds, or [`NO_PTS`].
    #[must_use]
    pub fn pts(&self) -> u64 {
        self.pts.load(Ordering::Relaxed)
    }

    /// Sets the presentation timestamp.
    pub fn set_pts(&self, pts: u64) {
        self.pts.store(pts, Ordering::Relaxed);
    }

    /// Registers the hook that fires when the hold count drops to zero.
    pub fn set_release_fn(&self, f: impl Fn(&Framebuffer) + Send + Sync + 'static) {
        *self.on_release.lock().unwrap() = Some(Box::new(f));
    }

    /// Clears the release hook.
    pub fn clear_release_fn(&self) {
        *self.on_release.lock().unwrap() = None;
    }

    /// Marks the buffer as in use by a consumer.
    ///
    /// Holders must not write to the pixels; producers must not reuse the
    /// buffer until the release hook has fired.
    pub fn hold(&self) {
        self.hold_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one hold. The release hook fires on the last release.
    pub fn release(&self) {
        let prev = self.hold_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release without matching hold");
        if prev == 1 {
            if let Some(f) = self.on_release.lock().unwrap().as_ref() {
                f(self);
            }
        }
    }

    /// Current hold count.
    #[must_use]
    pub fn hold_count(&self) -> usize {
        self.hold_count.load(Ordering::Acquire)
    }

    /// Maps the pixel memory for reading.
    #[must_use]
    pub fn map(&self) -> PixelGuard<'_> {
        PixelGuard { guard: self.data.lock().unwrap() }
    }

    /// Maps the pixel memory for writing. Producers only; a held buffer must
    /// not be written.
    #[must_use]
    pub fn map_mut(&self) -> PixelGuardMut<'_> {
        PixelGuardMut { guard: self.data.lock().unwrap() }
    }
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("fourcc", &fourcc_to_string(self.fourcc))
            .field("holds", &self.hold_count())
            .finish()
    }
}

/// Read access to mapped pixel memory. Unmaps on drop.
pub struct PixelGuard<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

impl std::ops::Deref for PixelGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Write access to mapped pixel memory. Unmaps on drop.
pub struct PixelGuardMut<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

impl std::ops::Deref for PixelGuardMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for PixelGuardMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::FOURCC_XRGB8888;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn allocation_matches_shape() {
        let fb = Framebuffer::new(640, 480, FOURCC_XRGB8888, 640).unwrap();
        assert_eq!(fb.map().len(), 640 * 480 * 4);
        assert_eq!(fb.logical_width(), 640);
    }

    #[test]
    fn short_stride_is_rejected() {
        assert!(Framebuffer::new(640, 480, FOURCC_XRGB8888, 320).is_err());
    }

    #[test]
    fn release_hook_fires_on_last_release() {
        let fb = Framebuffer::new(4, 4, FOURCC_XRGB8888, 4).unwrap();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        fb.set_release_fn(move |_| flag.store(true, Ordering::SeqCst));

        fb.hold();
        fb.hold();
        fb.release();
        assert!(!released.load(Ordering::SeqCst));
        fb.release();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(fb.hold_count(), 0);
    }

    #[test]
    fn map_mut_round_trips_pixels() {
        let fb = Framebuffer::new(2, 2, FOURCC_XRGB8888, 2).unwrap();
        fb.map_mut()[0] = 0xab;
        assert_eq!(fb.map()[0], 0xab);
    }
}
