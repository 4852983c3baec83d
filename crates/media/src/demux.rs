use std::path::Path;

use ffmpeg::media::Type;
use ffmpeg_the_third as ffmpeg;

use crate::error::{Error, Result};
use crate::time::Rational;

pub fn init_once() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        ffmpeg::init().expect("failed to initialize ffmpeg");
        unsafe {
            ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_FATAL);
        }
    });
}

/// Container reader: stream selection, sequential packet reads and bounded
/// seeks, with timestamps surfaced in the engine's millisecond domain.
pub struct Demuxer {
    input: ffmpeg::format::context::Input,
}

impl Demuxer {
    pub fn open(path: &Path) -> Result<Self> {
        init_once();
        let input = ffmpeg::format::input(path).map_err(|e| {
            Error::FileInvalid(format!("failed to open {}: {e}", path.display()))
        })?;
        Ok(Self { input })
    }

    pub fn best_stream(&self, kind: Type) -> Option<usize> {
        self.input.streams().best(kind).map(|s| s.index())
    }

    pub fn stream_time_base(&self, index: usize) -> Option<Rational> {
        self.input
            .streams()
            .nth(index)
            .map(|s| Rational::from(s.time_base()))
    }

    pub fn stream_avg_frame_rate(&self, index: usize) -> Option<Rational> {
        let rate = self.input.streams().nth(index)?.avg_frame_rate();
        if rate.numerator() <= 0 || rate.denominator() <= 0 {
            return None;
        }
        Some(Rational::from(rate))
    }

    pub fn codec_parameters(&self, index: usize) -> Option<ffmpeg::codec::Parameters> {
        self.input.streams().nth(index).map(|s| s.parameters())
    }

    /// Container duration in milliseconds, 0 when unknown.
    pub fn duration_ms(&self) -> i64 {
        let dur = self.input.duration();
        if dur <= 0 {
            return 0;
        }
        dur * 1000 / i64::from(ffmpeg::ffi::AV_TIME_BASE)
    }

    /// Container start time in milliseconds.
    pub fn start_time_ms(&self) -> i64 {
        let start = unsafe { (*self.input.as_ptr()).start_time };
        if start == ffmpeg::ffi::AV_NOPTS_VALUE || start < 0 {
            return 0;
        }
        start * 1000 / i64::from(ffmpeg::ffi::AV_TIME_BASE)
    }

    /// Reads the next packet of any stream; `None` at end of file.
    pub fn read_packet(&mut self) -> Result<Option<ffmpeg::Packet>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(Error::Media(e)),
        }
    }

    /// Bounded seek: lands on a key frame with timestamp inside
    /// `[min, max]`, as close to `target` as possible. Timestamps are in
    /// the stream's own time base, or `AV_TIME_BASE` units when `stream`
    /// is `None`.
    pub fn seek_file(
        &mut self,
        stream: Option<usize>,
        min: i64,
        target: i64,
        max: i64,
    ) -> Result<()> {
        let stream_index = stream.map(|s| s as i32).unwrap_or(-1);
        let ret = unsafe {
            ffmpeg::ffi::avformat_seek_file(
                self.input.as_mut_ptr(),
                stream_index,
                min,
                target,
                max,
                0,
            )
        };
        if ret < 0 {
            return Err(Error::Media(ffmpeg::Error::from(ret)));
        }
        Ok(())
    }

    /// Seeks every stream to the engine position `pos_ms`.
    pub fn seek_ms(&mut self, pos_ms: i64) -> Result<()> {
        let target = pos_ms * i64::from(ffmpeg::ffi::AV_TIME_BASE) / 1000;
        self.seek_file(None, i64::MIN, target, target)
    }

    /// Rewinds to the container start.
    pub fn seek_to_start(&mut self) -> Result<()> {
        let start = unsafe { (*self.input.as_ptr()).start_time };
        let start = if start == ffmpeg::ffi::AV_NOPTS_VALUE {
            0
        } else {
            start
        };
        self.seek_file(None, i64::MIN, start, start)
    }
}
