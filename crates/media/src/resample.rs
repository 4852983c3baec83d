use ffmpeg::format::Sample;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg_the_third as ffmpeg;

type ChannelLayout = ffmpeg::ChannelLayout<'static>;

use crate::error::{Error, Result};
use crate::frame::PcmBuf;

/// Converts decoded audio frames into the engine's interleaved `f32` PCM.
///
/// When the source already matches the target format, layout and rate the
/// samples are lifted out verbatim ("pass-through"); otherwise they go
/// through a software resampler.
pub struct Resampler {
    ctx: Option<ffmpeg::software::resampling::Context>,
    src_format: Sample,
    src_layout: ChannelLayout,
    src_rate: u32,
    dst_layout: ChannelLayout,
    dst_rate: u32,
    dst_channels: u16,
}

impl Resampler {
    pub const DST_FORMAT: Sample = Sample::F32(SampleType::Packed);

    pub fn new(
        src_format: Sample,
        src_layout: ChannelLayout,
        src_rate: u32,
        dst_layout: ChannelLayout,
        dst_rate: u32,
    ) -> Result<Self> {
        let dst_channels = dst_layout.channels() as u16;
        let pass_through = src_format == Self::DST_FORMAT
            && src_layout.channels() == dst_layout.channels()
            && src_rate == dst_rate;

        let ctx = if pass_through {
            None
        } else {
            Some(
                ffmpeg::software::resampling::Context::get2(
                    src_format,
                    src_layout.clone(),
                    src_rate,
                    Self::DST_FORMAT,
                    dst_layout.clone(),
                    dst_rate,
                )
                .map_err(Error::Media)?,
            )
        };

        Ok(Self {
            ctx,
            src_format,
            src_layout,
            src_rate,
            dst_layout,
            dst_rate,
            dst_channels,
        })
    }

    pub fn is_pass_through(&self) -> bool {
        self.ctx.is_none()
    }

    pub fn dst_rate(&self) -> u32 {
        self.dst_rate
    }

    pub fn dst_channels(&self) -> u16 {
        self.dst_channels
    }

    /// True when `frame` still matches the source format this resampler
    /// was configured for.
    pub fn matches_source(&self, frame: &ffmpeg::frame::Audio) -> bool {
        frame.format() == self.src_format
            && frame.rate() == self.src_rate
            && frame.ch_layout().channels() == self.src_layout.channels()
    }

    /// Converts one decoded frame, stamping the output with `timestamp_ms`.
    pub fn convert(&mut self, frame: &ffmpeg::frame::Audio, timestamp_ms: i64) -> Result<PcmBuf> {
        match self.ctx.as_mut() {
            None => Ok(lift_f32_packed(frame, self.dst_rate, timestamp_ms)),
            Some(ctx) => {
                let mut resampled = ffmpeg::frame::Audio::empty();
                ctx.run(frame, &mut resampled).map_err(Error::Media)?;
                Ok(lift_f32_packed(&resampled, self.dst_rate, timestamp_ms))
            }
        }
    }

    /// Drains the resampler's internal delay buffer at end of stream.
    pub fn flush(&mut self, timestamp_ms: i64) -> Result<Option<PcmBuf>> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Ok(None);
        };
        let mut resampled = ffmpeg::frame::Audio::empty();
        match ctx.flush(&mut resampled) {
            Ok(_) if resampled.samples() > 0 => {
                Ok(Some(lift_f32_packed(&resampled, self.dst_rate, timestamp_ms)))
            }
            Ok(_) => Ok(None),
            Err(e) => Err(Error::Media(e)),
        }
    }
}

/// Copies the interleaved `f32` samples out of a packed frame.
fn lift_f32_packed(frame: &ffmpeg::frame::Audio, sample_rate: u32, timestamp_ms: i64) -> PcmBuf {
    let channels = frame.ch_layout().channels() as usize;
    let sample_count = frame.samples() * channels;
    let byte_count = sample_count * 4;
    let data = frame.data(0);

    let mut samples = Vec::with_capacity(sample_count);
    for chunk in data[..byte_count.min(data.len())].chunks_exact(4) {
        samples.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }

    PcmBuf {
        samples,
        channels: channels as u16,
        sample_rate,
        timestamp_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::init_once;

    fn packed_f32_frame(values: &[f32], channels: u16, rate: u32) -> ffmpeg::frame::Audio {
        init_once();
        let layout = ChannelLayout::default_for_channels(channels.into());
        let mut frame = ffmpeg::frame::Audio::new(
            Resampler::DST_FORMAT,
            values.len() / channels as usize,
            layout,
        );
        frame.set_rate(rate);
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        frame.data_mut(0)[..bytes.len()].copy_from_slice(&bytes);
        frame
    }

    #[test]
    fn pass_through_is_byte_identical() {
        init_once();
        let layout = ChannelLayout::default_for_channels(2);
        let mut resampler = Resampler::new(
            Resampler::DST_FORMAT,
            layout.clone(),
            48_000,
            layout,
            48_000,
        )
        .expect("resampler");
        assert!(resampler.is_pass_through());

        let input = [0.25_f32, -0.5, 0.75, -1.0];
        let frame = packed_f32_frame(&input, 2, 48_000);
        let out = resampler.convert(&frame, 40).expect("convert");
        assert_eq!(out.samples, input);
        assert_eq!(out.timestamp_ms, 40);
        assert_eq!(out.channels, 2);
    }

    #[test]
    fn rate_change_requires_conversion() {
        init_once();
        let layout = ChannelLayout::default_for_channels(1);
        let resampler = Resampler::new(
            Resampler::DST_FORMAT,
            layout.clone(),
            44_100,
            layout,
            48_000,
        )
        .expect("resampler");
        assert!(!resampler.is_pass_through());
    }
}
