//! JPEG compression for the Tight encoding's lossy path.
//!
//! TurboJPEG support is optional; without the `turbojpeg` feature the Tight
//! encoder falls back to its basic zlib tiles for every quality level.

#[cfg(feature = "turbojpeg")]
pub mod turbojpeg;

#[cfg(feature = "turbojpeg")]
pub use turbojpeg::TurboJpegEncoder;
