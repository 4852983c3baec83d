use std::sync::Arc;

use image::RgbaImage;

/// Color space tag carried on output frames. The engine does not convert
/// between spaces; it only propagates what the source stream declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    #[default]
    Unknown,
    Bt601,
    Bt709,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    #[default]
    Unknown,
    Limited,
    Full,
}

/// Pixel layout of the composed output. The engine composes in 8-bit RGBA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorFormat {
    #[default]
    Rgba8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureType {
    #[default]
    Unknown,
    I,
    P,
    B,
}

/// Refcounted RGBA image with a presentation timestamp and the color
/// metadata of the frame it was converted from. Cloning shares the pixel
/// buffer, so readers may copy the currently published frame freely.
#[derive(Debug, Clone, Default)]
pub struct ImageMat {
    buf: Option<Arc<RgbaImage>>,
    /// Presentation time in seconds.
    pub timestamp: f64,
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
    pub color_format: ColorFormat,
    pub bit_depth: u8,
    pub picture_type: PictureType,
    pub interlaced: bool,
}

impl ImageMat {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_image(image: RgbaImage, timestamp: f64) -> Self {
        Self {
            buf: Some(Arc::new(image)),
            timestamp,
            bit_depth: 8,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_none()
    }

    pub fn image(&self) -> Option<&RgbaImage> {
        self.buf.as_deref()
    }

    pub fn width(&self) -> u32 {
        self.buf.as_ref().map(|b| b.width()).unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.buf.as_ref().map(|b| b.height()).unwrap_or(0)
    }
}

/// Single-channel `f32` coverage plane used for event and node masks.
/// `1.0` means the effect fully applies at that pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct AlphaMat {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl AlphaMat {
    pub fn new(width: u32, height: u32, fill: f32) -> Self {
        Self {
            width,
            height,
            data: vec![fill; (width * height) as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> f32) -> Self {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y).clamp(0.0, 1.0));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn value_at(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    /// Pixel-wise union of two masks. Sizes must match; a mismatched mask
    /// is ignored.
    pub fn max_in_place(&mut self, other: &AlphaMat) {
        if self.width != other.width || self.height != other.height {
            return;
        }
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            if *src > *dst {
                *dst = *src;
            }
        }
    }
}

/// Interleaved `f32` PCM with its format and the presentation time of the
/// first sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PcmBuf {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Presentation time of the first sample, in milliseconds.
    pub timestamp_ms: i64,
}

impl PcmBuf {
    pub fn silent(frames: usize, channels: u16, sample_rate: u32, timestamp_ms: i64) -> Self {
        Self {
            samples: vec![0.0; frames * channels as usize],
            channels,
            sample_rate,
            timestamp_ms,
        }
    }

    /// Samples per channel.
    pub fn frame_len(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration_ms(&self) -> i64 {
        if self.sample_rate == 0 {
            0
        } else {
            (self.frame_len() as i64 * 1000) / self.sample_rate as i64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Alpha composition over RGBA mats. Both the overlap transition and the
/// event-mask confinement go through this seam, so an alternative mixer can
/// be installed without touching the model.
pub trait Blender: Send + Sync {
    /// `out = base·α + overlay·(1−α)` per pixel. Where sizes disagree the
    /// base is returned unchanged.
    fn blend(&self, base: &ImageMat, overlay: &ImageMat, alpha: &AlphaMat) -> ImageMat;

    /// Linear crossfade, `t = 0` yielding `front` and `t = 1` yielding
    /// `rear`.
    fn crossfade(&self, front: &ImageMat, rear: &ImageMat, t: f32) -> ImageMat;
}

/// Plain CPU blender.
pub struct CpuBlender;

impl Blender for CpuBlender {
    fn blend(&self, base: &ImageMat, overlay: &ImageMat, alpha: &AlphaMat) -> ImageMat {
        let (Some(base_img), Some(over_img)) = (base.image(), overlay.image()) else {
            return base.clone();
        };
        if base_img.dimensions() != over_img.dimensions()
            || base_img.width() != alpha.width()
            || base_img.height() != alpha.height()
        {
            return base.clone();
        }

        let mut out = RgbaImage::new(base_img.width(), base_img.height());
        for y in 0..out.height() {
            for x in 0..out.width() {
                let a = alpha.value_at(x, y).clamp(0.0, 1.0);
                let bp = base_img.get_pixel(x, y).0;
                let op = over_img.get_pixel(x, y).0;
                let mut px = [0u8; 4];
                for c in 0..4 {
                    px[c] = lerp_u8(op[c], bp[c], a);
                }
                out.put_pixel(x, y, image::Rgba(px));
            }
        }

        let mut mat = base.clone();
        mat.buf = Some(Arc::new(out));
        mat
    }

    fn crossfade(&self, front: &ImageMat, rear: &ImageMat, t: f32) -> ImageMat {
        let (front_img, rear_img) = match (front.image(), rear.image()) {
            (Some(f), Some(r)) => (f, r),
            (Some(_), None) => return front.clone(),
            _ => return rear.clone(),
        };
        if front_img.dimensions() != rear_img.dimensions() {
            return if t < 0.5 {
                front.clone()
            } else {
                rear.clone()
            };
        }

        let t = t.clamp(0.0, 1.0);
        let mut out = RgbaImage::new(front_img.width(), front_img.height());
        for y in 0..out.height() {
            for x in 0..out.width() {
                let fp = front_img.get_pixel(x, y).0;
                let rp = rear_img.get_pixel(x, y).0;
                let mut px = [0u8; 4];
                for c in 0..4 {
                    px[c] = lerp_u8(fp[c], rp[c], t);
                }
                out.put_pixel(x, y, image::Rgba(px));
            }
        }

        let mut mat = front.clone();
        mat.buf = Some(Arc::new(out));
        mat
    }
}

fn lerp_u8(a: u8, b: u8, t: f32) -> u8 {
    (f32::from(a) + (f32::from(b) - f32::from(a)) * t)
        .round()
        .clamp(0.0, 255.0) as u8
}

impl ImageMat {
    /// Replaces the pixel buffer, keeping timestamp and color tags.
    pub fn set_image(&mut self, image: RgbaImage) {
        self.buf = Some(Arc::new(image));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, px: [u8; 4]) -> ImageMat {
        ImageMat::from_image(RgbaImage::from_pixel(w, h, image::Rgba(px)), 0.0)
    }

    #[test]
    fn clone_shares_pixels() {
        let a = solid(4, 4, [9, 9, 9, 255]);
        let b = a.clone();
        assert!(std::ptr::eq(
            a.image().expect("buf"),
            b.image().expect("buf")
        ));
    }

    #[test]
    fn blend_alpha_1_keeps_base() {
        let base = solid(2, 2, [0, 0, 0, 255]);
        let over = solid(2, 2, [200, 200, 200, 255]);
        let mask = AlphaMat::new(2, 2, 1.0);
        let out = CpuBlender.blend(&base, &over, &mask);
        assert_eq!(out.image().expect("buf").get_pixel(0, 0).0, [0, 0, 0, 255]);
    }

    #[test]
    fn blend_alpha_0_keeps_overlay() {
        let base = solid(2, 2, [0, 0, 0, 255]);
        let over = solid(2, 2, [200, 100, 50, 255]);
        let mask = AlphaMat::new(2, 2, 0.0);
        let out = CpuBlender.blend(&base, &over, &mask);
        assert_eq!(
            out.image().expect("buf").get_pixel(1, 1).0,
            [200, 100, 50, 255]
        );
    }

    #[test]
    fn crossfade_endpoints() {
        let front = solid(2, 2, [10, 20, 30, 255]);
        let rear = solid(2, 2, [210, 220, 230, 255]);
        let at0 = CpuBlender.crossfade(&front, &rear, 0.0);
        let at1 = CpuBlender.crossfade(&front, &rear, 1.0);
        assert_eq!(at0.image().expect("buf").get_pixel(0, 0).0, [10, 20, 30, 255]);
        assert_eq!(
            at1.image().expect("buf").get_pixel(0, 0).0,
            [210, 220, 230, 255]
        );
    }

    #[test]
    fn alpha_mat_max_union() {
        let mut a = AlphaMat::from_fn(2, 1, |x, _| if x == 0 { 1.0 } else { 0.0 });
        let b = AlphaMat::from_fn(2, 1, |x, _| if x == 1 { 0.5 } else { 0.0 });
        a.max_in_place(&b);
        assert_eq!(a.value_at(0, 0), 1.0);
        assert_eq!(a.value_at(1, 0), 0.5);
    }

    #[test]
    fn pcm_frame_len_counts_per_channel() {
        let buf = PcmBuf::silent(480, 2, 48_000, 0);
        assert_eq!(buf.frame_len(), 480);
        assert_eq!(buf.duration_ms(), 10);
    }
}
