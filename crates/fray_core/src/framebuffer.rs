//! Render output buffer.
//!
//! The renderer accumulates into a float buffer and converts to 8-bit with a
//! gamma ramp only on export. Byte-precision buffers are supported for
//! callers that want a display-ready image without keeping the float data
//! around.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Colorspace {
    Linear,
    Srgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Float,
    Byte,
}

#[derive(Debug, Clone)]
enum PixelData {
    Float(Vec<f32>),
    Byte(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Framebuffer {
    width: u32,
    height: u32,
    /// Channels per pixel.
    stride: usize,
    colorspace: Colorspace,
    data: PixelData,
}

impl Framebuffer {
    pub fn new_float(width: u32, height: u32, stride: usize) -> Self {
        Framebuffer {
            width,
            height,
            stride,
            colorspace: Colorspace::Linear,
            data: PixelData::Float(vec![0.0; width as usize * height as usize * stride]),
        }
    }

    pub fn new_byte(width: u32, height: u32, stride: usize) -> Self {
        Framebuffer {
            width,
            height,
            stride,
            colorspace: Colorspace::Srgb,
            data: PixelData::Byte(vec![0; width as usize * height as usize * stride]),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    pub fn precision(&self) -> Precision {
        match self.data {
            PixelData::Float(_) => Precision::Float,
            PixelData::Byte(_) => Precision::Byte,
        }
    }

    pub fn clear(&mut self) {
        match &mut self.data {
            PixelData::Float(buf) => buf.fill(0.0),
            PixelData::Byte(buf) => buf.fill(0),
        }
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.stride
    }

    /// Read back a pixel as float RGBA. Missing channels read as zero, alpha
    /// defaults to one.
    pub fn get_pixel(&self, x: u32, y: u32) -> [f32; 4] {
        let mut out = [0.0, 0.0, 0.0, 1.0];
        if x >= self.width || y >= self.height {
            return out;
        }
        let at = self.offset(x, y);
        for c in 0..self.stride.min(4) {
            out[c] = match &self.data {
                PixelData::Float(buf) => buf[at + c],
                PixelData::Byte(buf) => buf[at + c] as f32 / 255.0,
            };
        }
        out
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: [f32; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let at = self.offset(x, y);
        let stride = self.stride.min(4);
        match &mut self.data {
            PixelData::Float(buf) => {
                for c in 0..stride {
                    buf[at + c] = value[c];
                }
            }
            PixelData::Byte(buf) => {
                for c in 0..stride {
                    buf[at + c] = (value[c].clamp(0.0, 1.0) * 255.0) as u8;
                }
            }
        }
    }

    /// Blend a freshly rendered block into the buffer. The stored pixel
    /// becomes `old * (1 - weight) + new * weight`, which with
    /// `weight = samples_this_pass / samples_total` keeps a running average
    /// across progressive passes. `pixels` is `w * h` RGBA values in row-major
    /// order.
    pub fn blend_region(
        &mut self,
        x0: u32,
        y0: u32,
        w: u32,
        h: u32,
        pixels: &[[f32; 4]],
        weight: f32,
    ) {
        debug_assert_eq!(pixels.len(), w as usize * h as usize);
        let keep = 1.0 - weight;
        for row in 0..h {
            for col in 0..w {
                let x = x0 + col;
                let y = y0 + row;
                if x >= self.width || y >= self.height {
                    continue;
                }
                let src = pixels[(row * w + col) as usize];
                let dst = self.get_pixel(x, y);
                self.set_pixel(
                    x,
                    y,
                    [
                        dst[0] * keep + src[0] * weight,
                        dst[1] * keep + src[1] * weight,
                        dst[2] * keep + src[2] * weight,
                        dst[3] * keep + src[3] * weight,
                    ],
                );
            }
        }
    }

    /// Convert to display-ready RGBA bytes, applying gamma when the stored
    /// data is linear.
    pub fn to_rgba8(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for y in 0..self.height {
            for x in 0..self.width {
                let px = self.get_pixel(x, y);
                for (c, &v) in px.iter().enumerate() {
                    let v = if self.colorspace == Colorspace::Linear && c < 3 {
                        linear_to_gamma(v)
                    } else {
                        v
                    };
                    out.push((v.clamp(0.0, 1.0) * 255.0) as u8);
                }
            }
        }
        out
    }
}

/// Gamma 2.0 ramp, matching the accumulation buffer's cheap inverse.
pub fn linear_to_gamma(component: f32) -> f32 {
    if component > 0.0 {
        component.sqrt()
    } else {
        0.0
    }
}

/// Handle to the renderer's output buffer, shared between the render workers
/// and anyone displaying or saving the result. The buffer behind the handle
/// is replaced in place on restart, so clones observe resizes.
#[derive(Clone)]
pub struct SharedFramebuffer {
    inner: Arc<Mutex<Framebuffer>>,
}

impl SharedFramebuffer {
    pub fn new(fb: Framebuffer) -> Self {
        SharedFramebuffer {
            inner: Arc::new(Mutex::new(fb)),
        }
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Framebuffer> {
        self.inner.lock()
    }

    /// Replace the buffer contents, keeping every existing handle valid.
    pub fn replace(&self, fb: Framebuffer) {
        *self.inner.lock() = fb;
    }

    pub fn snapshot(&self) -> Framebuffer {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_roundtrip() {
        let mut fb = Framebuffer::new_float(4, 4, 4);
        fb.set_pixel(1, 2, [0.25, 0.5, 0.75, 1.0]);
        assert_eq!(fb.get_pixel(1, 2), [0.25, 0.5, 0.75, 1.0]);
        assert_eq!(fb.get_pixel(0, 0), [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_byte_buffer_quantizes() {
        let mut fb = Framebuffer::new_byte(2, 2, 4);
        fb.set_pixel(0, 0, [1.0, 0.0, 0.5, 1.0]);
        let px = fb.get_pixel(0, 0);
        assert_eq!(px[0], 1.0);
        assert!((px[2] - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_out_of_bounds_writes_ignored() {
        let mut fb = Framebuffer::new_float(2, 2, 4);
        fb.set_pixel(5, 5, [1.0; 4]);
        assert_eq!(fb.get_pixel(0, 0)[0], 0.0);
    }

    #[test]
    fn test_blend_region_running_average() {
        let mut fb = Framebuffer::new_float(2, 1, 4);
        // First pass writes at full weight, second averages in.
        fb.blend_region(0, 0, 2, 1, &[[1.0; 4], [0.0, 0.0, 0.0, 1.0]], 1.0);
        fb.blend_region(0, 0, 2, 1, &[[0.0, 0.0, 0.0, 1.0], [1.0; 4]], 0.5);
        assert!((fb.get_pixel(0, 0)[0] - 0.5).abs() < 1e-6);
        assert!((fb.get_pixel(1, 0)[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_blend_region_clips_at_edges() {
        let mut fb = Framebuffer::new_float(2, 2, 4);
        // 2x2 block placed so half of it falls outside the buffer.
        fb.blend_region(1, 1, 2, 2, &[[1.0; 4]; 4], 1.0);
        assert_eq!(fb.get_pixel(1, 1)[0], 1.0);
        assert_eq!(fb.get_pixel(0, 0)[0], 0.0);
    }

    #[test]
    fn test_to_rgba8_applies_gamma() {
        let mut fb = Framebuffer::new_float(1, 1, 4);
        fb.set_pixel(0, 0, [0.25, 0.0, 0.0, 1.0]);
        let bytes = fb.to_rgba8();
        // sqrt(0.25) = 0.5
        assert_eq!(bytes[0], 127);
        assert_eq!(bytes[3], 255);
    }

    #[test]
    fn test_shared_replace_visible_through_clones() {
        let shared = SharedFramebuffer::new(Framebuffer::new_float(2, 2, 4));
        let handle = shared.clone();
        shared.replace(Framebuffer::new_float(8, 8, 4));
        assert_eq!(handle.lock().width(), 8);
    }
}
