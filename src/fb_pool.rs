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

//! A cache of same-shape framebuffers.
//!
//! The compositor allocates one output buffer per frame; recycling them
//! through a pool avoids the allocation and keeps buffer identities stable,
//! which the per-buffer damage tracking in the compositor relies on.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::fb::Framebuffer;

struct PoolShape {
    width: u32,
    height: u32,
    fourcc: u32,
    stride: u32,
}

struct PoolInner {
    shape: PoolShape,
    free: Vec<Arc<Framebuffer>>,
}

/// Cache of framebuffers sharing one `(width, height, fourcc, stride)` shape.
pub struct FbPool {
    inner: Mutex<PoolInner>,
}

impl FbPool {
    /// Creates an empty pool for the given shape.
    #[must_use]
    pub fn new(width: u32, height: u32, fourcc: u32, stride: u32) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                shape: PoolShape { width, height, fourcc, stride },
                free: Vec::new(),
            }),
        }
    }

    /// Changes the pool shape, dropping every cached buffer.
    pub fn resize(&self, width: u32, height: u32, fourcc: u32, stride: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.shape = PoolShape { width, height, fourcc, stride };
        inner.free.clear();
    }

    /// Returns a recycled buffer when one is cached, a fresh allocation
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Allocation fails for unsupported fourcc tags.
    pub fn acquire(&self) -> Result<Arc<Framebuffer>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fb) = inner.free.pop() {
            return Ok(fb);
        }
        let shape = &inner.shape;
        Framebuffer::new(shape.width, shape.height, shape.fourcc, shape.stride)
    }

    /// Returns a buffer to the pool. Buffers whose shape no longer matches
    /// (after a [`FbPool::resize`]) are dropped instead.
    pub fn release(&self, fb: Arc<Framebuffer>) {
        let mut inner = self.inner.lock().unwrap();
        let shape = &inner.shape;
        if fb.width() == shape.width
            && fb.height() == shape.height
            && fb.fourcc() == shape.fourcc
            && fb.stride() == shape.stride
            && fb.hold_count() == 0
        {
            inner.free.push(fb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::FOURCC_XRGB8888;

    #[test]
    fn acquire_recycles_released_buffers() {
        let pool = FbPool::new(8, 8, FOURCC_XRGB8888, 8);
        let fb = pool.acquire().unwrap();
        let id = fb.id();
        pool.release(fb);
        assert_eq!(pool.acquire().unwrap().id(), id);
    }

    #[test]
    fn resize_drops_cached_buffers() {
        let pool = FbPool::new(8, 8, FOURCC_XRGB8888, 8);
        let fb = pool.acquire().unwrap();
        let id = fb.id();
        pool.release(fb);
        pool.resize(16, 16, FOURCC_XRGB8888, 16);
        let fb = pool.acquire().unwrap();
        assert_ne!(fb.id(), id);
        assert_eq!(fb.width(), 16);
    }

    #[test]
    fn mismatched_release_is_dropped() {
        let pool = FbPool::new(8, 8, FOURCC_XRGB8888, 8);
        let foreign = Framebuffer::new(4, 4, FOURCC_XRGB8888, 4).unwrap();
        let id = foreign.id();
        pool.release(foreign);
        assert_ne!(pool.acquire().unwrap().id(), id);
    }
}
