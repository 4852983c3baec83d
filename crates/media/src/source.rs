use std::path::{Path, PathBuf};

use ffmpeg::media::Type;
use ffmpeg_the_third as ffmpeg;
use tracing::debug;

use crate::convert::FrameConverter;
use crate::decode::{AudioDecoder, DecodePoll, VideoDecoder};
use crate::demux::Demuxer;
use crate::error::{Error, Result};
use crate::frame::{ImageMat, PcmBuf};
use crate::time::{Rational, to_millis};

/// Video side of the clip "parser handle": a positioned frame producer
/// over one media source. Positions are source-local milliseconds.
pub trait VideoSource: Send {
    fn duration_ms(&self) -> i64;

    fn seek_to(&mut self, pos_ms: i64);

    /// Decodes the frame presented at `pos_ms`, or `None` when the source
    /// cannot produce one there.
    fn read_frame(&mut self, pos_ms: i64) -> Option<ImageMat>;

    fn set_direction(&mut self, _forward: bool) {}
}

/// Audio side of the clip "parser handle". Reads produce interleaved
/// `f32` PCM at the rate and channel count the source was opened for.
pub trait AudioSource: Send {
    fn duration_ms(&self) -> i64;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    fn seek_to(&mut self, pos_ms: i64);

    fn read_samples(&mut self, pos_ms: i64, frames: usize) -> Option<PcmBuf>;
}

const SEQUENTIAL_WINDOW_MS: i64 = 1000;
const MAX_DECODE_FRAMES: u32 = 180;

/// File-backed `VideoSource` built on the demux/decode/convert wrappers.
/// Sequential reads continue decoding from the last position; anything
/// else seeks and drains up to the requested timestamp.
pub struct VideoSourceReader {
    demuxer: Demuxer,
    decoder: VideoDecoder,
    converter: FrameConverter,
    stream_index: usize,
    time_base: Rational,
    duration_ms: i64,
    last_pts_ms: Option<i64>,
}

impl VideoSourceReader {
    pub fn open(path: &Path) -> Result<Self> {
        let demuxer = Demuxer::open(path)?;
        let stream_index = demuxer
            .best_stream(Type::Video)
            .ok_or_else(|| Error::not_found(format!("no video stream in {}", path.display())))?;
        let params = demuxer
            .codec_parameters(stream_index)
            .ok_or_else(|| Error::not_found("video stream parameters".to_string()))?;
        let decoder = VideoDecoder::open(params, false)?;
        let time_base = demuxer
            .stream_time_base(stream_index)
            .unwrap_or(Rational::MILLIS);
        let duration_ms = demuxer.duration_ms();

        Ok(Self {
            demuxer,
            decoder,
            converter: FrameConverter::new(),
            stream_index,
            time_base,
            duration_ms,
            last_pts_ms: None,
        })
    }

    fn reposition(&mut self, pos_ms: i64) {
        if self.demuxer.seek_ms(pos_ms.max(0)).is_err() {
            debug!(pos_ms, "video source seek failed");
        }
        self.decoder.flush();
        self.last_pts_ms = None;
    }

    /// Decodes the next frame in stream order.
    fn decode_next(&mut self) -> Option<(ImageMat, i64)> {
        let mut frame = ffmpeg::frame::Video::empty();
        for _ in 0..5000 {
            match self.decoder.poll_frame(&mut frame) {
                Ok(DecodePoll::Frame) => {
                    let pts_ms = frame
                        .pts()
                        .map(|p| to_millis(p, self.time_base))
                        .unwrap_or(0);
                    self.last_pts_ms = Some(pts_ms);
                    let mat = self
                        .converter
                        .convert(&frame, pts_ms as f64 / 1000.0)
                        .ok()?;
                    return Some((mat, pts_ms));
                }
                Ok(DecodePoll::Eof) => return None,
                Ok(DecodePoll::Again) => {}
                Err(_) => return None,
            }

            match self.demuxer.read_packet() {
                Ok(Some(packet)) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    if self.decoder.send_packet(&packet).is_err() {
                        continue;
                    }
                }
                Ok(None) => {
                    if self.decoder.send_eof().is_err() {
                        return None;
                    }
                }
                Err(_) => return None,
            }
        }
        None
    }
}

impl VideoSource for VideoSourceReader {
    fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    fn seek_to(&mut self, pos_ms: i64) {
        self.reposition(pos_ms);
    }

    fn read_frame(&mut self, pos_ms: i64) -> Option<ImageMat> {
        let pos_ms = pos_ms.max(0);
        let sequential = self
            .last_pts_ms
            .is_some_and(|last| pos_ms >= last && pos_ms - last < SEQUENTIAL_WINDOW_MS);
        if !sequential {
            self.reposition(pos_ms);
        }

        let mut best_before: Option<ImageMat> = None;
        for _ in 0..MAX_DECODE_FRAMES {
            let (mat, pts_ms) = self.decode_next()?;
            if pts_ms >= pos_ms {
                return Some(mat);
            }
            best_before = Some(mat);
        }
        best_before
    }
}

/// File-backed `AudioSource`: decodes, downmixes to mono, linearly
/// resamples to the requested output rate and fans out to the requested
/// channel count.
pub struct AudioSourceReader {
    demuxer: Demuxer,
    decoder: AudioDecoder,
    stream_index: usize,
    duration_ms: i64,
    out_rate: u32,
    out_channels: u16,
    /// Source-domain end of the last decoded range.
    last_end_ms: Option<i64>,
    path: PathBuf,
}

impl AudioSourceReader {
    pub fn open(path: &Path, out_rate: u32, out_channels: u16) -> Result<Self> {
        let demuxer = Demuxer::open(path)?;
        let stream_index = demuxer
            .best_stream(Type::Audio)
            .ok_or_else(|| Error::not_found(format!("no audio stream in {}", path.display())))?;
        let params = demuxer
            .codec_parameters(stream_index)
            .ok_or_else(|| Error::not_found("audio stream parameters".to_string()))?;
        let decoder = AudioDecoder::open(params)?;
        let duration_ms = demuxer.duration_ms();

        Ok(Self {
            demuxer,
            decoder,
            stream_index,
            duration_ms,
            out_rate,
            out_channels: out_channels.max(1),
            last_end_ms: None,
            path: path.to_path_buf(),
        })
    }

    fn reposition(&mut self, pos_ms: i64) {
        if self.demuxer.seek_ms(pos_ms.max(0)).is_err() {
            debug!(pos_ms, path = %self.path.display(), "audio source seek failed");
        }
        self.decoder.flush();
        self.last_end_ms = Some(pos_ms.max(0));
    }

    /// Decodes mono samples at the source rate until `needed` have been
    /// collected or the stream ends.
    fn decode_mono(&mut self, needed: usize) -> Vec<f32> {
        let src_rate = self.decoder.sample_rate().max(1);
        let mut output = Vec::with_capacity(needed);
        let mut frame = ffmpeg::frame::Audio::empty();

        while output.len() < needed {
            match self.decoder.poll_frame(&mut frame) {
                Ok(DecodePoll::Frame) => {
                    extract_mono_samples(&frame, &mut output);
                    continue;
                }
                Ok(DecodePoll::Eof) => break,
                Ok(DecodePoll::Again) => {}
                Err(_) => break,
            }

            match self.demuxer.read_packet() {
                Ok(Some(packet)) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    if self.decoder.send_packet(&packet).is_err() {
                        continue;
                    }
                }
                Ok(None) => {
                    if self.decoder.send_eof().is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        if let Some(end) = self.last_end_ms.as_mut() {
            *end += output.len() as i64 * 1000 / i64::from(src_rate);
        }
        output
    }
}

impl AudioSource for AudioSourceReader {
    fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    fn sample_rate(&self) -> u32 {
        self.out_rate
    }

    fn channels(&self) -> u16 {
        self.out_channels
    }

    fn seek_to(&mut self, pos_ms: i64) {
        self.reposition(pos_ms);
    }

    fn read_samples(&mut self, pos_ms: i64, frames: usize) -> Option<PcmBuf> {
        if frames == 0 {
            return None;
        }
        let pos_ms = pos_ms.max(0);
        let sequential = self
            .last_end_ms
            .is_some_and(|end| (pos_ms - end).abs() < SEQUENTIAL_WINDOW_MS / 2);
        if !sequential {
            self.reposition(pos_ms);
        }

        let src_rate = self.decoder.sample_rate().max(1);
        let needed_src = frames * src_rate as usize / self.out_rate.max(1) as usize + 1;
        let mono = self.decode_mono(needed_src);
        if mono.is_empty() {
            return None;
        }

        let mono = if src_rate != self.out_rate {
            resample_linear(&mono, src_rate, self.out_rate)
        } else {
            mono
        };

        let mut samples = Vec::with_capacity(frames * self.out_channels as usize);
        for i in 0..frames {
            let v = mono.get(i).copied().unwrap_or(0.0);
            for _ in 0..self.out_channels {
                samples.push(v);
            }
        }

        Some(PcmBuf {
            samples,
            channels: self.out_channels,
            sample_rate: self.out_rate,
            timestamp_ms: pos_ms,
        })
    }
}

/// Downmixes one decoded frame to mono `f32`, handling the packed and
/// planar variants of the common sample formats.
fn extract_mono_samples(frame: &ffmpeg::frame::Audio, output: &mut Vec<f32>) {
    use ffmpeg::format::Sample;

    let sample_count = frame.samples();
    let channels = (frame.ch_layout().channels() as usize).max(1);
    let is_planar = !frame.is_packed();

    match (frame.format(), is_planar) {
        (Sample::F32(_), false) => {
            let data = frame.data(0);
            for i in 0..sample_count {
                let mut sum = 0.0f32;
                for ch in 0..channels {
                    let offset = (i * channels + ch) * 4;
                    if offset + 4 <= data.len() {
                        sum += f32::from_le_bytes([
                            data[offset],
                            data[offset + 1],
                            data[offset + 2],
                            data[offset + 3],
                        ]);
                    }
                }
                output.push(sum / channels as f32);
            }
        }
        (Sample::F32(_), true) => {
            for i in 0..sample_count {
                let mut sum = 0.0f32;
                for ch in 0..channels.min(frame.planes()) {
                    let plane = frame.data(ch);
                    let offset = i * 4;
                    if offset + 4 <= plane.len() {
                        sum += f32::from_le_bytes([
                            plane[offset],
                            plane[offset + 1],
                            plane[offset + 2],
                            plane[offset + 3],
                        ]);
                    }
                }
                output.push(sum / channels as f32);
            }
        }
        (Sample::I16(_), false) => {
            let data = frame.data(0);
            for i in 0..sample_count {
                let mut sum = 0.0f32;
                for ch in 0..channels {
                    let offset = (i * channels + ch) * 2;
                    if offset + 2 <= data.len() {
                        let sample = i16::from_le_bytes([data[offset], data[offset + 1]]);
                        sum += f32::from(sample) / 32768.0;
                    }
                }
                output.push(sum / channels as f32);
            }
        }
        (Sample::I16(_), true) => {
            for i in 0..sample_count {
                let mut sum = 0.0f32;
                for ch in 0..channels.min(frame.planes()) {
                    let plane = frame.data(ch);
                    let offset = i * 2;
                    if offset + 2 <= plane.len() {
                        let sample = i16::from_le_bytes([plane[offset], plane[offset + 1]]);
                        sum += f32::from(sample) / 32768.0;
                    }
                }
                output.push(sum / channels as f32);
            }
        }
        _ => {
            for _ in 0..sample_count {
                output.push(0.0);
            }
        }
    }
}

fn resample_linear(input: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if input.is_empty() || src_rate == 0 || dst_rate == 0 {
        return Vec::new();
    }
    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (input.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;
        let a = input[idx.min(input.len() - 1)];
        let b = input[(idx + 1).min(input.len() - 1)];
        output.push(a + (b - a) * frac);
    }
    output
}

#[cfg(test)]
mod tests {
    use ffmpeg::format::Sample;
    use ffmpeg::format::sample::Type as SampleType;
    use ffmpeg_the_third as ffmpeg;

    use super::{extract_mono_samples, resample_linear};
    use crate::demux::init_once;

    fn audio_frame(format: Sample, channels: u16, samples: usize) -> ffmpeg::frame::Audio {
        init_once();
        let layout = ffmpeg::ChannelLayout::default_for_channels(channels.into());
        let mut frame = ffmpeg::frame::Audio::new(format, samples, layout);
        frame.set_rate(48_000);
        frame
    }

    fn fill_plane_f32(frame: &mut ffmpeg::frame::Audio, plane: usize, values: &[f32]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        frame.data_mut(plane)[..bytes.len()].copy_from_slice(&bytes);
    }

    fn fill_plane_i16(frame: &mut ffmpeg::frame::Audio, plane: usize, values: &[i16]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        frame.data_mut(plane)[..bytes.len()].copy_from_slice(&bytes);
    }

    #[test]
    fn downmix_averages_packed_f32() {
        let mut frame = audio_frame(Sample::F32(SampleType::Packed), 2, 2);
        fill_plane_f32(&mut frame, 0, &[0.5, -0.5, 1.0, 0.0]);

        let mut out = Vec::new();
        extract_mono_samples(&frame, &mut out);
        assert_eq!(out, vec![0.0, 0.5]);
    }

    #[test]
    fn downmix_averages_planar_f32() {
        let mut frame = audio_frame(Sample::F32(SampleType::Planar), 2, 2);
        fill_plane_f32(&mut frame, 0, &[0.25, 0.75]);
        fill_plane_f32(&mut frame, 1, &[0.75, 0.25]);

        let mut out = Vec::new();
        extract_mono_samples(&frame, &mut out);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn downmix_scales_packed_i16() {
        let mut frame = audio_frame(Sample::I16(SampleType::Packed), 2, 2);
        fill_plane_i16(&mut frame, 0, &[16384, -16384, 16384, 16384]);

        let mut out = Vec::new();
        extract_mono_samples(&frame, &mut out);
        assert_eq!(out, vec![0.0, 0.5]);
    }

    #[test]
    fn downmix_scales_planar_i16() {
        let mut frame = audio_frame(Sample::I16(SampleType::Planar), 2, 2);
        fill_plane_i16(&mut frame, 0, &[16384, 0]);
        fill_plane_i16(&mut frame, 1, &[16384, -32768]);

        let mut out = Vec::new();
        extract_mono_samples(&frame, &mut out);
        assert_eq!(out, vec![0.5, -0.5]);
    }

    #[test]
    fn unsupported_sample_formats_downmix_to_silence() {
        let frame = audio_frame(Sample::I32(SampleType::Packed), 2, 3);
        let mut out = Vec::new();
        extract_mono_samples(&frame, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn resample_identity_ratio_copies() {
        let input = [0.0, 0.5, 1.0];
        assert_eq!(resample_linear(&input, 48_000, 48_000), input.to_vec());
    }

    #[test]
    fn resample_halving_rate_halves_length() {
        let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = resample_linear(&input, 48_000, 24_000);
        assert_eq!(out.len(), 50);
        assert_eq!(out[0], 0.0);
    }
}
