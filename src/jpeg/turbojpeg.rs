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

//! FFI bindings to libjpeg-turbo's `TurboJPEG` API.
//!
//! Only the compression entry points the Tight encoder needs: an RGB input
//! at 4:2:2 chrominance subsampling, which is what the wire format calls
//! for at lossy quality levels.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_uchar, c_ulong};

/// RGB pixel format (red, green, blue memory order).
const TJPF_RGB: c_int = 0;
/// 4:2:2 chrominance subsampling.
const TJSAMP_422: c_int = 1;

type TjHandle = *mut c_void;

#[link(name = "turbojpeg")]
extern "C" {
    fn tjInitCompress() -> TjHandle;
    fn tjDestroy(handle: TjHandle) -> c_int;
    fn tjCompress2(
        handle: TjHandle,
        src_buf: *const c_uchar,
        width: c_int,
        pitch: c_int,
        height: c_int,
        pixel_format: c_int,
        jpeg_buf: *mut *mut c_uchar,
        jpeg_size: *mut c_ulong,
        jpeg_subsamp: c_int,
        jpeg_qual: c_int,
        flags: c_int,
    ) -> c_int;
    fn tjFree(buffer: *mut c_uchar);
    fn tjGetErrorStr2(handle: TjHandle) -> *const c_char;
}

/// Safe wrapper around a `TurboJPEG` compression handle.
pub struct TurboJpegEncoder {
    handle: TjHandle,
}

impl TurboJpegEncoder {
    /// Initializes a compressor handle.
    pub fn new() -> Result<Self, String> {
        let handle = unsafe { tjInitCompress() };
        if handle.is_null() {
            return Err("failed to initialize TurboJPEG compressor".to_string());
        }
        Ok(Self { handle })
    }

    /// Compresses packed RGB rows (3 bytes per pixel) into a 4:2:2 JPEG.
    ///
    /// `quality` is the libjpeg scale, 1-100.
    pub fn compress_rgb422(
        &mut self,
        rgb: &[u8],
        width: u16,
        height: u16,
        quality: u8,
    ) -> Result<Vec<u8>, String> {
        let expected = usize::from(width) * usize::from(height) * 3;
        if rgb.len() != expected {
            return Err(format!(
                "RGB buffer is {} bytes, {expected} expected",
                rgb.len()
            ));
        }

        let mut jpeg_buf: *mut c_uchar = std::ptr::null_mut();
        let mut jpeg_size: c_ulong = 0;

        let rc = unsafe {
            tjCompress2(
                self.handle,
                rgb.as_ptr(),
                c_int::from(width),
                0, // pitch 0: rows are width * 3 bytes
                c_int::from(height),
                TJPF_RGB,
                &mut jpeg_buf,
                &mut jpeg_size,
                TJSAMP_422,
                c_int::from(quality),
                0,
            )
        };

        if rc != 0 {
            return Err(format!("TurboJPEG compression failed: {}", self.error_string()));
        }
        if jpeg_buf.is_null() {
            return Err("TurboJPEG returned a null buffer".to_string());
        }

        let jpeg =
            unsafe { std::slice::from_raw_parts(jpeg_buf, jpeg_size as usize).to_vec() };
        unsafe { tjFree(jpeg_buf) };
        Ok(jpeg)
    }

    fn error_string(&self) -> String {
        unsafe {
            let message = tjGetErrorStr2(self.handle);
            if message.is_null() {
                return "unknown error".to_string();
            }
            std::ffi::CStr::from_ptr(message).to_string_lossy().into_owned()
        }
    }
}

impl Drop for TurboJpegEncoder {
    fn drop(&mut self) {
        unsafe {
            tjDestroy(self.handle);
        }
    }
}

// The handle is only touched through &mut self.
unsafe impl Send for TurboJpegEncoder {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_a_small_image() {
        let mut encoder = TurboJpegEncoder::new().unwrap();
        let rgb = vec![200u8; 8 * 8 * 3];
        let jpeg = encoder.compress_rgb422(&rgb, 8, 8, 66).unwrap();
        // JPEG streams start with the SOI marker.
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn wrong_buffer_size_is_rejected() {
        let mut encoder = TurboJpegEncoder::new().unwrap();
        assert!(encoder.compress_rgb422(&[0u8; 10], 8, 8, 66).is_err());
    }
}
