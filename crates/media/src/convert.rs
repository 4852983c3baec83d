use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{self, flag::Flags as ScaleFlags};
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg_the_third as ffmpeg;

use crate::error::{Error, Result};
use crate::frame::{ColorFormat, ColorRange, ColorSpace, ImageMat, PictureType};

/// Converts decoded frames into `ImageMat`s: optional hardware-frame
/// download, scale/format conversion, fit-and-pad to the requested output
/// size, and color metadata tagging.
pub struct FrameConverter {
    scaler: Option<ScalerState>,
    out_size: Option<(u32, u32)>,
    interpolation: ScaleFlags,
}

struct ScalerState {
    ctx: scaling::Context,
    src_w: u32,
    src_h: u32,
    src_fmt: Pixel,
    dst_w: u32,
    dst_h: u32,
    flags: ScaleFlags,
}

impl Default for FrameConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameConverter {
    pub fn new() -> Self {
        Self {
            scaler: None,
            out_size: None,
            interpolation: ScaleFlags::BILINEAR,
        }
    }

    /// Requests a fixed output size; `(0, 0)` restores native sizing.
    pub fn set_out_size(&mut self, width: u32, height: u32) {
        self.out_size = if width == 0 || height == 0 {
            None
        } else {
            Some((width, height))
        };
    }

    pub fn set_resize_interpolation(&mut self, flags: ScaleFlags) {
        self.interpolation = flags;
    }

    /// The engine composes in 8-bit RGBA; any other request is refused.
    pub fn set_out_color_format(&mut self, format: ColorFormat) -> Result<()> {
        match format {
            ColorFormat::Rgba8 => Ok(()),
        }
    }

    /// Converts `frame`, stamping the result with `timestamp` (seconds).
    pub fn convert(&mut self, frame: &VideoFrame, timestamp: f64) -> Result<ImageMat> {
        let transferred;
        let frame = if is_hw_frame(frame) {
            transferred = transfer_hw_frame(frame)?;
            &transferred
        } else {
            frame
        };

        let src_w = frame.width();
        let src_h = frame.height();
        if src_w == 0 || src_h == 0 {
            return Ok(ImageMat::empty());
        }

        let (target_w, target_h) = self.out_size.unwrap_or((src_w, src_h));
        let (dst_w, dst_h) = scale_to_fit(src_w, src_h, target_w, target_h);
        if dst_w == 0 || dst_h == 0 {
            return Ok(ImageMat::empty());
        }

        self.ensure_scaler(src_w, src_h, frame.format(), dst_w, dst_h)?;
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| Error::Fatal("scaler missing after rebuild".into()))?;

        let mut rgba_frame = VideoFrame::empty();
        scaler.ctx.run(frame, &mut rgba_frame)?;

        let stride = rgba_frame.stride(0);
        let data = rgba_frame.data(0);

        let expected = (target_w * target_h * 4) as usize;
        let mut pixels = vec![0u8; expected];
        let x_offset = ((target_w - dst_w) / 2) as usize;
        let y_offset = ((target_h - dst_h) / 2) as usize;
        for y in 0..dst_h as usize {
            let src_start = y * stride;
            let src_end = src_start + (dst_w as usize * 4);
            let dst_start = ((y_offset + y) * target_w as usize + x_offset) * 4;
            let dst_end = dst_start + dst_w as usize * 4;
            if src_end <= data.len() && dst_end <= pixels.len() {
                pixels[dst_start..dst_end].copy_from_slice(&data[src_start..src_end]);
            }
        }

        let image = image::RgbaImage::from_raw(target_w, target_h, pixels)
            .ok_or_else(|| Error::Fatal("converted frame has wrong byte length".into()))?;

        let mut mat = ImageMat::from_image(image, timestamp);
        mat.color_space = map_color_space(frame.color_space());
        mat.color_range = map_color_range(frame.color_range());
        mat.color_format = ColorFormat::Rgba8;
        mat.bit_depth = 8;
        mat.picture_type = map_picture_type(frame.kind());
        mat.interlaced = frame.is_interlaced();
        Ok(mat)
    }

    fn ensure_scaler(
        &mut self,
        src_w: u32,
        src_h: u32,
        src_fmt: Pixel,
        dst_w: u32,
        dst_h: u32,
    ) -> Result<()> {
        let needs_rebuild = match &self.scaler {
            Some(s) => {
                s.src_w != src_w
                    || s.src_h != src_h
                    || s.src_fmt != src_fmt
                    || s.dst_w != dst_w
                    || s.dst_h != dst_h
                    || s.flags != self.interpolation
            }
            None => true,
        };

        if needs_rebuild {
            let ctx = scaling::Context::get(
                src_fmt,
                src_w,
                src_h,
                Pixel::RGBA,
                dst_w,
                dst_h,
                self.interpolation,
            )?;
            self.scaler = Some(ScalerState {
                ctx,
                src_w,
                src_h,
                src_fmt,
                dst_w,
                dst_h,
                flags: self.interpolation,
            });
        }

        Ok(())
    }
}

/// Largest even-dimensioned size with the source aspect ratio that fits
/// inside the bounds. Which axis binds falls out of cross-multiplying the
/// two aspect ratios, so the whole computation stays in integers.
pub fn scale_to_fit(src_w: u32, src_h: u32, bound_w: u32, bound_h: u32) -> (u32, u32) {
    if src_w == 0 || src_h == 0 {
        return (bound_w, bound_h);
    }
    let wide = u64::from(src_w) * u64::from(bound_h) >= u64::from(src_h) * u64::from(bound_w);
    let (w, h) = if wide {
        let h = u64::from(src_h) * u64::from(bound_w) / u64::from(src_w);
        (bound_w, h as u32)
    } else {
        let w = u64::from(src_w) * u64::from(bound_h) / u64::from(src_h);
        (w as u32, bound_h)
    };
    (snap_even(w).min(bound_w), snap_even(h).min(bound_h))
}

fn snap_even(n: u32) -> u32 {
    (n - n % 2).max(2)
}

fn is_hw_frame(frame: &VideoFrame) -> bool {
    unsafe {
        let desc = ffmpeg::ffi::av_pix_fmt_desc_get(frame.format().into());
        if desc.is_null() {
            return false;
        }
        ((*desc).flags & ffmpeg::ffi::AV_PIX_FMT_FLAG_HWACCEL as u64) != 0
    }
}

/// Downloads a hardware-surface frame into system memory, preserving pts.
fn transfer_hw_frame(frame: &VideoFrame) -> Result<VideoFrame> {
    let mut sw = VideoFrame::empty();
    let ret = unsafe {
        ffmpeg::ffi::av_hwframe_transfer_data(sw.as_mut_ptr(), frame.as_ptr(), 0)
    };
    if ret < 0 {
        return Err(Error::Media(ffmpeg::Error::from(ret)));
    }
    sw.set_pts(frame.pts());
    Ok(sw)
}

fn map_color_space(space: ffmpeg::color::Space) -> ColorSpace {
    use ffmpeg::color::Space;
    match space {
        Space::BT709 => ColorSpace::Bt709,
        Space::BT470BG | Space::SMPTE170M | Space::SMPTE240M => ColorSpace::Bt601,
        Space::BT2020NCL | Space::BT2020CL => ColorSpace::Bt2020,
        _ => ColorSpace::Unknown,
    }
}

fn map_color_range(range: ffmpeg::color::Range) -> ColorRange {
    use ffmpeg::color::Range;
    match range {
        Range::MPEG => ColorRange::Limited,
        Range::JPEG => ColorRange::Full,
        _ => ColorRange::Unknown,
    }
}

fn map_picture_type(kind: ffmpeg::picture::Type) -> PictureType {
    use ffmpeg::picture::Type;
    match kind {
        Type::I => PictureType::I,
        Type::P => PictureType::P,
        Type::B => PictureType::B,
        _ => PictureType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::scale_to_fit;

    #[test]
    fn fit_preserves_aspect_and_evenness() {
        assert_eq!(scale_to_fit(1920, 1080, 480, 480), (480, 270));
        let (w, h) = scale_to_fit(1279, 721, 640, 360);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
        assert!(w <= 640 && h <= 360);
    }

    #[test]
    fn tall_sources_bind_on_height() {
        assert_eq!(scale_to_fit(1080, 1920, 480, 480), (270, 480));
    }

    #[test]
    fn fit_zero_source_falls_back_to_target() {
        assert_eq!(scale_to_fit(0, 0, 320, 240), (320, 240));
    }
}
