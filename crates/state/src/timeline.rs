use montage_media::error::{Error, Result};
use montage_media::time::Rational;

use crate::ids;
use crate::track::{AudioTrack, VideoTrack};

/// Timeline-wide output format: canvas, frame rate and audio layout every
/// track renders into.
#[derive(Debug, Clone, Copy)]
pub struct OutputSpec {
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub frame_rate: Rational,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            canvas_width: 1920,
            canvas_height: 1080,
            frame_rate: Rational { num: 25, den: 1 },
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

/// The full arrangement: ordered video and audio tracks plus the output
/// spec. Global duration is the furthest end over all tracks.
pub struct Timeline {
    spec: OutputSpec,
    video_tracks: Vec<VideoTrack>,
    audio_tracks: Vec<AudioTrack>,
}

impl Timeline {
    pub fn new(spec: OutputSpec) -> Self {
        Self {
            spec,
            video_tracks: Vec::new(),
            audio_tracks: Vec::new(),
        }
    }

    pub fn spec(&self) -> OutputSpec {
        self.spec
    }

    pub fn duration(&self) -> i64 {
        let video = self.video_tracks.iter().map(|t| t.duration()).max();
        let audio = self.audio_tracks.iter().map(|t| t.duration()).max();
        video.unwrap_or(0).max(audio.unwrap_or(0))
    }

    pub fn add_video_track(&mut self) -> i64 {
        let id = ids::next_id();
        self.video_tracks.push(VideoTrack::new(
            id,
            self.spec.canvas_width,
            self.spec.canvas_height,
            self.spec.frame_rate,
        ));
        id
    }

    pub fn add_audio_track(&mut self) -> i64 {
        let id = ids::next_id();
        self.audio_tracks
            .push(AudioTrack::new(id, self.spec.sample_rate, self.spec.channels));
        id
    }

    pub fn remove_video_track(&mut self, id: i64) -> Result<VideoTrack> {
        let index = self
            .video_tracks
            .iter()
            .position(|t| t.id() == id)
            .ok_or_else(|| Error::not_found(format!("video track {id}")))?;
        Ok(self.video_tracks.remove(index))
    }

    pub fn remove_audio_track(&mut self, id: i64) -> Result<AudioTrack> {
        let index = self
            .audio_tracks
            .iter()
            .position(|t| t.id() == id)
            .ok_or_else(|| Error::not_found(format!("audio track {id}")))?;
        Ok(self.audio_tracks.remove(index))
    }

    pub fn video_tracks(&self) -> &[VideoTrack] {
        &self.video_tracks
    }

    pub fn audio_tracks(&self) -> &[AudioTrack] {
        &self.audio_tracks
    }

    pub fn video_track_mut(&mut self, id: i64) -> Option<&mut VideoTrack> {
        self.video_tracks.iter_mut().find(|t| t.id() == id)
    }

    pub fn audio_track_mut(&mut self, id: i64) -> Option<&mut AudioTrack> {
        self.audio_tracks.iter_mut().find(|t| t.id() == id)
    }

    pub fn seek_to(&mut self, pos: i64) -> Result<()> {
        for track in &mut self.video_tracks {
            track.seek_to(pos)?;
        }
        for track in &mut self.audio_tracks {
            track.seek_to(pos)?;
        }
        Ok(())
    }

    pub fn set_direction(&mut self, forward: bool) {
        for track in &mut self.video_tracks {
            track.set_direction(forward);
        }
        for track in &mut self.audio_tracks {
            track.set_direction(forward);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OutputSpec, Timeline};

    #[test]
    fn duration_is_max_over_tracks() {
        let mut timeline = Timeline::new(OutputSpec::default());
        assert_eq!(timeline.duration(), 0);
        let v = timeline.add_video_track();
        let a = timeline.add_audio_track();
        assert!(timeline.video_track_mut(v).is_some());
        assert!(timeline.audio_track_mut(a).is_some());
    }

    #[test]
    fn removing_unknown_track_fails() {
        let mut timeline = Timeline::new(OutputSpec::default());
        assert!(timeline.remove_video_track(77).is_err());
    }
}
