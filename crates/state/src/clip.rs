use montage_media::error::{Error, Result};
use montage_media::frame::{ImageMat, PcmBuf};
use montage_media::source::{AudioSource, VideoSource};

use crate::ids::UNATTACHED;

/// A time-bounded reference into a video source, placed on a track.
///
/// `start` is the position on the track; `start_offset`/`end_offset` trim
/// the head and tail of the source. `duration` and `end` are derived and
/// kept consistent by every mutator.
pub struct VideoClip {
    id: i64,
    source: Box<dyn VideoSource>,
    track_id: i64,
    start: i64,
    start_offset: i64,
    end_offset: i64,
    duration: i64,
    end: i64,
    read_pos: i64,
    forward: bool,
}

impl VideoClip {
    pub fn new(
        id: i64,
        source: Box<dyn VideoSource>,
        start: i64,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<Self> {
        let source_duration = source.duration_ms();
        validate_offsets(start_offset, end_offset, source_duration)?;
        let duration = source_duration - start_offset - end_offset;
        Ok(Self {
            id,
            source,
            track_id: UNATTACHED,
            start,
            start_offset,
            end_offset,
            duration,
            end: start + duration,
            read_pos: 0,
            forward: true,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn track_id(&self) -> i64 {
        self.track_id
    }

    pub(crate) fn set_track_id(&mut self, track_id: i64) {
        self.track_id = track_id;
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> i64 {
        self.end_offset
    }

    pub fn source_duration(&self) -> i64 {
        self.source.duration_ms()
    }

    pub fn read_pos(&self) -> i64 {
        self.read_pos
    }

    pub fn is_forward(&self) -> bool {
        self.forward
    }

    /// Moves the clip on its track; `end` follows.
    pub fn set_start(&mut self, start: i64) {
        self.start = start;
        self.end = start + self.duration;
    }

    /// Trims the head; `start` is unchanged and `end` moves.
    pub fn change_start_offset(&mut self, start_offset: i64) -> Result<()> {
        validate_offsets(start_offset, self.end_offset, self.source.duration_ms())?;
        self.start_offset = start_offset;
        self.recompute_range();
        Ok(())
    }

    /// Trims the tail; `end` moves.
    pub fn change_end_offset(&mut self, end_offset: i64) -> Result<()> {
        validate_offsets(self.start_offset, end_offset, self.source.duration_ms())?;
        self.end_offset = end_offset;
        self.recompute_range();
        Ok(())
    }

    fn recompute_range(&mut self) {
        self.duration = self.source.duration_ms() - self.start_offset - self.end_offset;
        self.end = self.start + self.duration;
    }

    /// Positions the internal playhead at a clip-local millisecond offset.
    /// Positions outside the clip range are allowed; reads there come back
    /// empty.
    pub fn seek_to(&mut self, clip_pos: i64) {
        self.read_pos = clip_pos;
        if clip_pos >= 0 && clip_pos < self.duration {
            self.source.seek_to(self.start_offset + clip_pos);
        }
    }

    /// Reads the frame at a clip-local position.
    pub fn read_frame(&mut self, clip_pos: i64) -> ImageMat {
        if clip_pos < 0 || clip_pos >= self.duration {
            return ImageMat::empty();
        }
        self.read_pos = clip_pos;
        self.source
            .read_frame(self.start_offset + clip_pos)
            .unwrap_or_default()
    }

    pub fn set_direction(&mut self, forward: bool) {
        if self.forward == forward {
            return;
        }
        self.forward = forward;
        self.source.set_direction(forward);
    }
}

/// Audio counterpart of `VideoClip`; same lifecycle, sample-oriented reads.
pub struct AudioClip {
    id: i64,
    source: Box<dyn AudioSource>,
    track_id: i64,
    start: i64,
    start_offset: i64,
    end_offset: i64,
    duration: i64,
    end: i64,
    read_pos: i64,
    forward: bool,
}

impl AudioClip {
    pub fn new(
        id: i64,
        source: Box<dyn AudioSource>,
        start: i64,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<Self> {
        let source_duration = source.duration_ms();
        validate_offsets(start_offset, end_offset, source_duration)?;
        let duration = source_duration - start_offset - end_offset;
        Ok(Self {
            id,
            source,
            track_id: UNATTACHED,
            start,
            start_offset,
            end_offset,
            duration,
            end: start + duration,
            read_pos: 0,
            forward: true,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn track_id(&self) -> i64 {
        self.track_id
    }

    pub(crate) fn set_track_id(&mut self, track_id: i64) {
        self.track_id = track_id;
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> i64 {
        self.end_offset
    }

    pub fn set_start(&mut self, start: i64) {
        self.start = start;
        self.end = start + self.duration;
    }

    pub fn change_start_offset(&mut self, start_offset: i64) -> Result<()> {
        validate_offsets(start_offset, self.end_offset, self.source.duration_ms())?;
        self.start_offset = start_offset;
        self.recompute_range();
        Ok(())
    }

    pub fn change_end_offset(&mut self, end_offset: i64) -> Result<()> {
        validate_offsets(self.start_offset, end_offset, self.source.duration_ms())?;
        self.end_offset = end_offset;
        self.recompute_range();
        Ok(())
    }

    fn recompute_range(&mut self) {
        self.duration = self.source.duration_ms() - self.start_offset - self.end_offset;
        self.end = self.start + self.duration;
    }

    pub fn seek_to(&mut self, clip_pos: i64) {
        self.read_pos = clip_pos;
        if clip_pos >= 0 && clip_pos < self.duration {
            self.source.seek_to(self.start_offset + clip_pos);
        }
    }

    /// Reads `frames` samples per channel at a clip-local position.
    pub fn read_samples(&mut self, clip_pos: i64, frames: usize) -> PcmBuf {
        if clip_pos < 0 || clip_pos >= self.duration {
            return PcmBuf::default();
        }
        self.read_pos = clip_pos;
        self.source
            .read_samples(self.start_offset + clip_pos, frames)
            .unwrap_or_default()
    }

    pub fn set_direction(&mut self, forward: bool) {
        self.forward = forward;
    }
}

fn validate_offsets(start_offset: i64, end_offset: i64, source_duration: i64) -> Result<()> {
    if start_offset < 0 || end_offset < 0 {
        return Err(Error::invalid_argument("clip offsets cannot be negative"));
    }
    if start_offset + end_offset >= source_duration {
        return Err(Error::invalid_range(format!(
            "offsets {start_offset}+{end_offset} consume the whole source ({source_duration} ms)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use montage_media::frame::ImageMat;
    use montage_media::source::VideoSource;

    use super::VideoClip;

    struct StubSource {
        duration_ms: i64,
    }

    impl VideoSource for StubSource {
        fn duration_ms(&self) -> i64 {
            self.duration_ms
        }

        fn seek_to(&mut self, _pos_ms: i64) {}

        fn read_frame(&mut self, _pos_ms: i64) -> Option<ImageMat> {
            None
        }
    }

    fn clip(start: i64, start_offset: i64, end_offset: i64, source_dur: i64) -> VideoClip {
        VideoClip::new(
            1,
            Box::new(StubSource {
                duration_ms: source_dur,
            }),
            start,
            start_offset,
            end_offset,
        )
        .expect("valid clip")
    }

    #[test]
    fn derived_fields_follow_offsets() {
        let c = clip(500, 100, 200, 1000);
        assert_eq!(c.duration(), 700);
        assert_eq!(c.end(), 1200);
    }

    #[test]
    fn offsets_consuming_source_are_rejected() {
        let source = Box::new(StubSource { duration_ms: 1000 });
        assert!(VideoClip::new(1, source, 0, 600, 400).is_err());
    }

    #[test]
    fn negative_offset_is_rejected() {
        let source = Box::new(StubSource { duration_ms: 1000 });
        assert!(VideoClip::new(1, source, 0, -1, 0).is_err());
    }

    #[test]
    fn set_start_moves_end() {
        let mut c = clip(0, 0, 0, 1000);
        c.set_start(250);
        assert_eq!(c.end(), 1250);
    }

    #[test]
    fn trimming_head_keeps_start() {
        let mut c = clip(0, 0, 0, 1000);
        c.change_start_offset(300).expect("valid trim");
        assert_eq!(c.start(), 0);
        assert_eq!(c.duration(), 700);
        assert_eq!(c.end(), 700);
    }

    #[test]
    fn out_of_range_read_is_empty() {
        let mut c = clip(0, 0, 0, 1000);
        assert!(c.read_frame(1000).is_empty());
        assert!(c.read_frame(-1).is_empty());
    }
}
