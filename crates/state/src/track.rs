use std::sync::Arc;

use montage_media::error::{Error, Result};
use montage_media::frame::{Blender, CpuBlender, ImageMat, PcmBuf};
use montage_media::source::{AudioSource, VideoSource};
use montage_media::time::Rational;
use tracing::{debug, warn};

use crate::clip::{AudioClip, VideoClip};
use crate::ids::{self, UNATTACHED};
use crate::overlap::{Overlap, ranges_intersect};

/// A lane of video clips with managed overlaps and a frame-counter read
/// cursor. Clips are kept sorted by `(start, id)`; overlaps are derived
/// state, reconciled after every mutation.
pub struct VideoTrack {
    id: i64,
    out_width: u32,
    out_height: u32,
    frame_rate: Rational,
    clips: Vec<VideoClip>,
    overlaps: Vec<Overlap>,
    duration: i64,
    read_frames: i64,
    read_clip_idx: usize,
    read_overlap_idx: usize,
    forward: bool,
    blender: Arc<dyn Blender>,
}

impl VideoTrack {
    pub fn new(id: i64, out_width: u32, out_height: u32, frame_rate: Rational) -> Self {
        Self {
            id,
            out_width,
            out_height,
            frame_rate,
            clips: Vec::new(),
            overlaps: Vec::new(),
            duration: 0,
            read_frames: 0,
            read_clip_idx: 0,
            read_overlap_idx: 0,
            forward: true,
            blender: Arc::new(CpuBlender),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn out_size(&self) -> (u32, u32) {
        (self.out_width, self.out_height)
    }

    pub fn frame_rate(&self) -> Rational {
        self.frame_rate
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }

    pub fn clips(&self) -> &[VideoClip] {
        &self.clips
    }

    pub fn overlaps(&self) -> &[Overlap] {
        &self.overlaps
    }

    pub fn clip_by_id(&self, id: i64) -> Option<&VideoClip> {
        self.clips.iter().find(|c| c.id() == id)
    }

    pub fn clip_by_index(&self, index: usize) -> Option<&VideoClip> {
        self.clips.get(index)
    }

    pub fn is_forward(&self) -> bool {
        self.forward
    }

    /// Installs the mixer used for overlap transitions.
    pub fn set_blender(&mut self, blender: Arc<dyn Blender>) {
        self.blender = blender;
    }

    /// Creates a clip over `source` and inserts it. The id must be unused
    /// on this track.
    pub fn add_new_clip(
        &mut self,
        id: i64,
        source: Box<dyn VideoSource>,
        start: i64,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<i64> {
        ids::observe_id(id);
        let clip = VideoClip::new(id, source, start, start_offset, end_offset)?;
        self.insert_clip(clip)?;
        Ok(id)
    }

    pub fn insert_clip(&mut self, mut clip: VideoClip) -> Result<()> {
        if self.clip_by_id(clip.id()).is_some() {
            return Err(Error::AlreadyExists(format!(
                "clip {} is already on track {}",
                clip.id(),
                self.id
            )));
        }
        if !self.check_clip_range_valid(clip.id(), clip.start(), clip.end()) {
            warn!(
                track = self.id,
                clip = clip.id(),
                start = clip.start(),
                end = clip.end(),
                "insert rejected: range enters a foreign overlap"
            );
            return Err(Error::invalid_range(format!(
                "clip range [{}, {}) conflicts with an existing overlap",
                clip.start(),
                clip.end()
            )));
        }

        clip.set_direction(self.forward);
        clip.set_track_id(self.id);
        let clip_id = clip.id();
        debug!(track = self.id, clip = clip_id, start = clip.start(), "insert accepted");
        self.clips.push(clip);
        self.sort_clips();
        self.update_duration();
        self.update_clip_overlap(clip_id);
        self.reposition(self.read_pos_ms());
        Ok(())
    }

    pub fn remove_clip_by_id(&mut self, id: i64) -> Result<VideoClip> {
        let index = self
            .clips
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| Error::not_found(format!("clip {id}")))?;
        self.remove_clip_by_index(index)
    }

    pub fn remove_clip_by_index(&mut self, index: usize) -> Result<VideoClip> {
        if index >= self.clips.len() {
            return Err(Error::invalid_argument(format!(
                "clip index {index} exceeds clip count {}",
                self.clips.len()
            )));
        }
        let mut clip = self.clips.remove(index);
        clip.set_track_id(UNATTACHED);
        let clip_id = clip.id();
        self.overlaps.retain(|ov| !ov.involves(clip_id));
        self.update_duration();
        self.reposition(self.read_pos_ms());
        Ok(clip)
    }

    /// Moves a clip to a new start position; the edit is validated before
    /// anything changes.
    pub fn move_clip(&mut self, id: i64, new_start: i64) -> Result<()> {
        let index = self
            .clips
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| Error::not_found(format!("clip {id}")))?;
        if self.clips[index].start() == new_start {
            return Ok(());
        }

        let new_end = new_start + self.clips[index].duration();
        if !self.check_clip_range_valid(id, new_start, new_end) {
            warn!(track = self.id, clip = id, new_start, "move rejected");
            return Err(Error::invalid_range(format!(
                "clip range [{new_start}, {new_end}) conflicts with an existing overlap"
            )));
        }

        self.clips[index].set_start(new_start);
        debug!(track = self.id, clip = id, new_start, "move accepted");
        self.sort_clips();
        self.update_duration();
        self.update_clip_overlap(id);
        self.reposition(self.read_pos_ms());
        Ok(())
    }

    /// Re-trims a clip; the edit is validated before anything changes.
    pub fn change_clip_range(
        &mut self,
        id: i64,
        new_start_offset: i64,
        new_end_offset: i64,
    ) -> Result<()> {
        let index = self
            .clips
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| Error::not_found(format!("clip {id}")))?;
        let clip = &self.clips[index];
        if clip.start_offset() == new_start_offset && clip.end_offset() == new_end_offset {
            return Ok(());
        }

        if new_start_offset < 0
            || new_end_offset < 0
            || new_start_offset + new_end_offset >= clip.source_duration()
        {
            return Err(Error::invalid_range(format!(
                "offsets {new_start_offset}+{new_end_offset} consume the whole source"
            )));
        }
        let new_duration = clip.source_duration() - new_start_offset - new_end_offset;
        let new_end = clip.start() + new_duration;
        if !self.check_clip_range_valid(id, clip.start(), new_end) {
            warn!(track = self.id, clip = id, new_start_offset, new_end_offset, "trim rejected");
            return Err(Error::invalid_range(format!(
                "clip range [{}, {new_end}) conflicts with an existing overlap",
                clip.start()
            )));
        }

        let clip = &mut self.clips[index];
        clip.change_start_offset(new_start_offset)?;
        clip.change_end_offset(new_end_offset)?;
        self.sort_clips();
        self.update_duration();
        self.update_clip_overlap(id);
        self.reposition(self.read_pos_ms());
        Ok(())
    }

    /// Positions the read cursors at `pos` and re-seeks every clip.
    pub fn seek_to(&mut self, pos: i64) -> Result<()> {
        if pos < 0 {
            return Err(Error::invalid_argument("seek position cannot be negative"));
        }
        self.reposition(pos);
        Ok(())
    }

    /// Current read position in milliseconds, derived from the frame
    /// counter.
    pub fn read_pos_ms(&self) -> i64 {
        self.read_frames * 1000 * i64::from(self.frame_rate.den) / i64::from(self.frame_rate.num)
    }

    pub fn set_direction(&mut self, forward: bool) {
        if self.forward == forward {
            return;
        }
        self.forward = forward;
        for clip in &mut self.clips {
            clip.set_direction(forward);
        }
    }

    /// Emits the frame at the current read position and steps the frame
    /// counter (forward or backward). Overlapped regions win over their
    /// member clips; positions covered by nothing yield an empty mat.
    pub fn read_video_frame(&mut self) -> ImageMat {
        let read_pos = self.read_pos_ms();
        let mut mat = ImageMat::empty();

        if self.forward {
            while self.read_overlap_idx < self.overlaps.len()
                && read_pos >= self.overlaps[self.read_overlap_idx].start()
            {
                let overlap = self.overlaps[self.read_overlap_idx];
                if read_pos < overlap.end() {
                    mat = self.read_overlap_frame(overlap, read_pos);
                    break;
                }
                self.read_overlap_idx += 1;
            }

            if mat.is_empty() {
                while self.read_clip_idx < self.clips.len()
                    && read_pos >= self.clips[self.read_clip_idx].start()
                {
                    if read_pos < self.clips[self.read_clip_idx].end() {
                        let local = read_pos - self.clips[self.read_clip_idx].start();
                        mat = self.clips[self.read_clip_idx].read_frame(local);
                        break;
                    }
                    self.read_clip_idx += 1;
                }
            }

            self.read_frames += 1;
        } else {
            while self.read_overlap_idx > 0
                && (self.read_overlap_idx == self.overlaps.len()
                    || read_pos < self.overlaps[self.read_overlap_idx].start())
            {
                self.read_overlap_idx -= 1;
            }
            if self.read_overlap_idx < self.overlaps.len() {
                let overlap = self.overlaps[self.read_overlap_idx];
                if overlap.contains(read_pos) {
                    mat = self.read_overlap_frame(overlap, read_pos);
                }
            }

            if mat.is_empty() {
                while self.read_clip_idx > 0
                    && (self.read_clip_idx == self.clips.len()
                        || read_pos < self.clips[self.read_clip_idx].start())
                {
                    self.read_clip_idx -= 1;
                }
                if self.read_clip_idx < self.clips.len() {
                    let clip = &mut self.clips[self.read_clip_idx];
                    if read_pos >= clip.start() && read_pos < clip.end() {
                        mat = clip.read_frame(read_pos - clip.start());
                    }
                }
            }

            self.read_frames -= 1;
        }

        mat.timestamp = read_pos as f64 / 1000.0;
        mat
    }

    /// The candidate `[start, end)` may touch but not strictly enter any
    /// overlap it does not own; anything else would stack three clips.
    pub fn check_clip_range_valid(&self, clip_id: i64, start: i64, end: i64) -> bool {
        for overlap in &self.overlaps {
            if overlap.involves(clip_id) {
                continue;
            }
            let strictly_inside = |p: i64| p > overlap.start() && p < overlap.end();
            if strictly_inside(start) || strictly_inside(end) {
                return false;
            }
            // candidate swallowing the overlap whole is the same conflict
            if start <= overlap.start() && end >= overlap.end() {
                return false;
            }
        }
        true
    }

    fn read_overlap_frame(&mut self, overlap: Overlap, read_pos: i64) -> ImageMat {
        let blender = self.blender.clone();
        let Some((front, rear)) = self.two_clips_mut(overlap.front_id(), overlap.rear_id()) else {
            return ImageMat::empty();
        };
        let front_mat = front.read_frame(read_pos - front.start());
        let rear_mat = rear.read_frame(read_pos - rear.start());
        let t = if overlap.duration() > 0 {
            (read_pos - overlap.start()) as f32 / overlap.duration() as f32
        } else {
            0.0
        };
        blender.crossfade(&front_mat, &rear_mat, t)
    }

    fn two_clips_mut(&mut self, a: i64, b: i64) -> Option<(&mut VideoClip, &mut VideoClip)> {
        let ia = self.clips.iter().position(|c| c.id() == a)?;
        let ib = self.clips.iter().position(|c| c.id() == b)?;
        if ia == ib {
            return None;
        }
        if ia < ib {
            let (left, right) = self.clips.split_at_mut(ib);
            Some((&mut left[ia], &mut right[0]))
        } else {
            let (left, right) = self.clips.split_at_mut(ia);
            Some((&mut right[0], &mut left[ib]))
        }
    }

    fn sort_clips(&mut self) {
        self.clips.sort_by_key(|c| (c.start(), c.id()));
    }

    fn update_duration(&mut self) {
        self.duration = self.clips.iter().map(|c| c.end()).max().unwrap_or(0);
    }

    /// Overlap reconciliation after a mutation of `updated_id`:
    /// refresh overlaps involving it, drop the invalid and the orphaned,
    /// create overlaps for new pairwise intersections, re-sort.
    fn update_clip_overlap(&mut self, updated_id: i64) {
        let ranges: Vec<(i64, i64, i64)> = self
            .clips
            .iter()
            .map(|c| (c.id(), c.start(), c.end()))
            .collect();
        let find = |id: i64| ranges.iter().copied().find(|r| r.0 == id);

        self.overlaps.retain_mut(|ov| {
            match (find(ov.front_id()), find(ov.rear_id())) {
                (Some(front), Some(rear)) => {
                    if ov.involves(updated_id) {
                        ov.update(front, rear)
                    } else {
                        true
                    }
                }
                _ => false,
            }
        });

        if let Some(updated) = find(updated_id) {
            for other in ranges.iter().copied().filter(|r| r.0 != updated_id) {
                if ranges_intersect((updated.1, updated.2), (other.1, other.2))
                    && !self.overlaps.iter().any(|ov| ov.is_pair(updated_id, other.0))
                {
                    if let Some(overlap) = Overlap::between(ids::next_id(), updated, other) {
                        self.overlaps.push(overlap);
                    }
                }
            }
        }

        self.overlaps.sort_by_key(|ov| (ov.start(), ov.id()));
    }

    fn reposition(&mut self, pos: i64) {
        let pos = pos.max(0);
        for clip in &mut self.clips {
            clip.seek_to(pos - clip.start());
        }

        if self.forward {
            self.read_clip_idx = self
                .clips
                .iter()
                .position(|c| pos < c.end())
                .unwrap_or(self.clips.len());
            self.read_overlap_idx = self
                .overlaps
                .iter()
                .position(|ov| pos < ov.end())
                .unwrap_or(self.overlaps.len());
        } else {
            self.read_clip_idx = self.clips.partition_point(|c| c.start() <= pos);
            self.read_overlap_idx = self.overlaps.partition_point(|ov| ov.start() <= pos);
            if self.read_clip_idx > 0 {
                self.read_clip_idx -= 1;
            }
            if self.read_overlap_idx > 0 {
                self.read_overlap_idx -= 1;
            }
        }

        self.read_frames =
            pos * i64::from(self.frame_rate.num) / (1000 * i64::from(self.frame_rate.den));
    }
}

/// A lane of audio clips; structurally the video track with
/// sample-oriented reads. Uncovered regions produce silence so the output
/// stream stays continuous.
pub struct AudioTrack {
    id: i64,
    sample_rate: u32,
    channels: u16,
    clips: Vec<AudioClip>,
    overlaps: Vec<Overlap>,
    duration: i64,
    read_samples: i64,
    read_clip_idx: usize,
    read_overlap_idx: usize,
    forward: bool,
}

impl AudioTrack {
    pub fn new(id: i64, sample_rate: u32, channels: u16) -> Self {
        Self {
            id,
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            clips: Vec::new(),
            overlaps: Vec::new(),
            duration: 0,
            read_samples: 0,
            read_clip_idx: 0,
            read_overlap_idx: 0,
            forward: true,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }

    pub fn clips(&self) -> &[AudioClip] {
        &self.clips
    }

    pub fn overlaps(&self) -> &[Overlap] {
        &self.overlaps
    }

    pub fn clip_by_id(&self, id: i64) -> Option<&AudioClip> {
        self.clips.iter().find(|c| c.id() == id)
    }

    pub fn add_new_clip(
        &mut self,
        id: i64,
        source: Box<dyn AudioSource>,
        start: i64,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<i64> {
        ids::observe_id(id);
        let clip = AudioClip::new(id, source, start, start_offset, end_offset)?;
        self.insert_clip(clip)?;
        Ok(id)
    }

    pub fn insert_clip(&mut self, mut clip: AudioClip) -> Result<()> {
        if self.clip_by_id(clip.id()).is_some() {
            return Err(Error::AlreadyExists(format!(
                "clip {} is already on track {}",
                clip.id(),
                self.id
            )));
        }
        if !self.check_clip_range_valid(clip.id(), clip.start(), clip.end()) {
            return Err(Error::invalid_range(format!(
                "clip range [{}, {}) conflicts with an existing overlap",
                clip.start(),
                clip.end()
            )));
        }

        clip.set_direction(self.forward);
        clip.set_track_id(self.id);
        let clip_id = clip.id();
        self.clips.push(clip);
        self.sort_clips();
        self.update_duration();
        self.update_clip_overlap(clip_id);
        self.reposition(self.read_pos_ms());
        Ok(())
    }

    pub fn remove_clip_by_id(&mut self, id: i64) -> Result<AudioClip> {
        let index = self
            .clips
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| Error::not_found(format!("clip {id}")))?;
        self.remove_clip_by_index(index)
    }

    pub fn remove_clip_by_index(&mut self, index: usize) -> Result<AudioClip> {
        if index >= self.clips.len() {
            return Err(Error::invalid_argument(format!(
                "clip index {index} exceeds clip count {}",
                self.clips.len()
            )));
        }
        let mut clip = self.clips.remove(index);
        clip.set_track_id(UNATTACHED);
        let clip_id = clip.id();
        self.overlaps.retain(|ov| !ov.involves(clip_id));
        self.update_duration();
        self.reposition(self.read_pos_ms());
        Ok(clip)
    }

    pub fn move_clip(&mut self, id: i64, new_start: i64) -> Result<()> {
        let index = self
            .clips
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| Error::not_found(format!("clip {id}")))?;
        if self.clips[index].start() == new_start {
            return Ok(());
        }
        let new_end = new_start + self.clips[index].duration();
        if !self.check_clip_range_valid(id, new_start, new_end) {
            return Err(Error::invalid_range(format!(
                "clip range [{new_start}, {new_end}) conflicts with an existing overlap"
            )));
        }

        self.clips[index].set_start(new_start);
        self.sort_clips();
        self.update_duration();
        self.update_clip_overlap(id);
        self.reposition(self.read_pos_ms());
        Ok(())
    }

    pub fn change_clip_range(
        &mut self,
        id: i64,
        new_start_offset: i64,
        new_end_offset: i64,
    ) -> Result<()> {
        let index = self
            .clips
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| Error::not_found(format!("clip {id}")))?;
        let clip = &self.clips[index];
        if clip.start_offset() == new_start_offset && clip.end_offset() == new_end_offset {
            return Ok(());
        }
        let source_duration = clip.duration() + clip.start_offset() + clip.end_offset();
        if new_start_offset < 0
            || new_end_offset < 0
            || new_start_offset + new_end_offset >= source_duration
        {
            return Err(Error::invalid_range(format!(
                "offsets {new_start_offset}+{new_end_offset} consume the whole source"
            )));
        }
        let new_end = clip.start() + (source_duration - new_start_offset - new_end_offset);
        if !self.check_clip_range_valid(id, clip.start(), new_end) {
            return Err(Error::invalid_range(format!(
                "clip range [{}, {new_end}) conflicts with an existing overlap",
                clip.start()
            )));
        }

        let clip = &mut self.clips[index];
        clip.change_start_offset(new_start_offset)?;
        clip.change_end_offset(new_end_offset)?;
        self.sort_clips();
        self.update_duration();
        self.update_clip_overlap(id);
        self.reposition(self.read_pos_ms());
        Ok(())
    }

    pub fn seek_to(&mut self, pos: i64) -> Result<()> {
        if pos < 0 {
            return Err(Error::invalid_argument("seek position cannot be negative"));
        }
        self.reposition(pos);
        Ok(())
    }

    pub fn read_pos_ms(&self) -> i64 {
        self.read_samples * 1000 / i64::from(self.sample_rate)
    }

    pub fn set_direction(&mut self, forward: bool) {
        if self.forward == forward {
            return;
        }
        self.forward = forward;
        for clip in &mut self.clips {
            clip.set_direction(forward);
        }
    }

    /// Emits `frames` samples per channel at the current read position and
    /// steps the sample counter.
    pub fn read_audio_samples(&mut self, frames: usize) -> PcmBuf {
        let read_pos = self.read_pos_ms();
        let mut buf = PcmBuf::default();

        if self.forward {
            while self.read_overlap_idx < self.overlaps.len()
                && read_pos >= self.overlaps[self.read_overlap_idx].start()
            {
                let overlap = self.overlaps[self.read_overlap_idx];
                if read_pos < overlap.end() {
                    buf = self.read_overlap_samples(overlap, read_pos, frames);
                    break;
                }
                self.read_overlap_idx += 1;
            }
            if buf.is_empty() {
                while self.read_clip_idx < self.clips.len()
                    && read_pos >= self.clips[self.read_clip_idx].start()
                {
                    if read_pos < self.clips[self.read_clip_idx].end() {
                        let local = read_pos - self.clips[self.read_clip_idx].start();
                        buf = self.clips[self.read_clip_idx].read_samples(local, frames);
                        break;
                    }
                    self.read_clip_idx += 1;
                }
            }
            self.read_samples += frames as i64;
        } else {
            while self.read_overlap_idx > 0
                && (self.read_overlap_idx == self.overlaps.len()
                    || read_pos < self.overlaps[self.read_overlap_idx].start())
            {
                self.read_overlap_idx -= 1;
            }
            if self.read_overlap_idx < self.overlaps.len() {
                let overlap = self.overlaps[self.read_overlap_idx];
                if overlap.contains(read_pos) {
                    buf = self.read_overlap_samples(overlap, read_pos, frames);
                }
            }
            if buf.is_empty() {
                while self.read_clip_idx > 0
                    && (self.read_clip_idx == self.clips.len()
                        || read_pos < self.clips[self.read_clip_idx].start())
                {
                    self.read_clip_idx -= 1;
                }
                if self.read_clip_idx < self.clips.len() {
                    let clip = &mut self.clips[self.read_clip_idx];
                    if read_pos >= clip.start() && read_pos < clip.end() {
                        buf = clip.read_samples(read_pos - clip.start(), frames);
                    }
                }
            }
            self.read_samples -= frames as i64;
        }

        if buf.is_empty() {
            buf = PcmBuf::silent(frames, self.channels, self.sample_rate, read_pos);
        } else {
            buf.timestamp_ms = read_pos;
        }
        buf
    }

    pub fn check_clip_range_valid(&self, clip_id: i64, start: i64, end: i64) -> bool {
        for overlap in &self.overlaps {
            if overlap.involves(clip_id) {
                continue;
            }
            let strictly_inside = |p: i64| p > overlap.start() && p < overlap.end();
            if strictly_inside(start) || strictly_inside(end) {
                return false;
            }
            if start <= overlap.start() && end >= overlap.end() {
                return false;
            }
        }
        true
    }

    /// Linear crossfade of the two member clips' sample blocks.
    fn read_overlap_samples(&mut self, overlap: Overlap, read_pos: i64, frames: usize) -> PcmBuf {
        let channels = self.channels;
        let sample_rate = self.sample_rate;
        let Some((front, rear)) = self.two_clips_mut(overlap.front_id(), overlap.rear_id()) else {
            return PcmBuf::default();
        };
        let front_buf = front.read_samples(read_pos - front.start(), frames);
        let rear_buf = rear.read_samples(read_pos - rear.start(), frames);
        let t = if overlap.duration() > 0 {
            ((read_pos - overlap.start()) as f32 / overlap.duration() as f32).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let len = frames * channels as usize;
        let mut samples = Vec::with_capacity(len);
        for i in 0..len {
            let f = front_buf.samples.get(i).copied().unwrap_or(0.0);
            let r = rear_buf.samples.get(i).copied().unwrap_or(0.0);
            samples.push(f * (1.0 - t) + r * t);
        }
        PcmBuf {
            samples,
            channels,
            sample_rate,
            timestamp_ms: read_pos,
        }
    }

    fn two_clips_mut(&mut self, a: i64, b: i64) -> Option<(&mut AudioClip, &mut AudioClip)> {
        let ia = self.clips.iter().position(|c| c.id() == a)?;
        let ib = self.clips.iter().position(|c| c.id() == b)?;
        if ia == ib {
            return None;
        }
        if ia < ib {
            let (left, right) = self.clips.split_at_mut(ib);
            Some((&mut left[ia], &mut right[0]))
        } else {
            let (left, right) = self.clips.split_at_mut(ia);
            Some((&mut right[0], &mut left[ib]))
        }
    }

    fn sort_clips(&mut self) {
        self.clips.sort_by_key(|c| (c.start(), c.id()));
    }

    fn update_duration(&mut self) {
        self.duration = self.clips.iter().map(|c| c.end()).max().unwrap_or(0);
    }

    fn update_clip_overlap(&mut self, updated_id: i64) {
        let ranges: Vec<(i64, i64, i64)> = self
            .clips
            .iter()
            .map(|c| (c.id(), c.start(), c.end()))
            .collect();
        let find = |id: i64| ranges.iter().copied().find(|r| r.0 == id);

        self.overlaps.retain_mut(|ov| {
            match (find(ov.front_id()), find(ov.rear_id())) {
                (Some(front), Some(rear)) => {
                    if ov.involves(updated_id) {
                        ov.update(front, rear)
                    } else {
                        true
                    }
                }
                _ => false,
            }
        });

        if let Some(updated) = find(updated_id) {
            for other in ranges.iter().copied().filter(|r| r.0 != updated_id) {
                if ranges_intersect((updated.1, updated.2), (other.1, other.2))
                    && !self.overlaps.iter().any(|ov| ov.is_pair(updated_id, other.0))
                {
                    if let Some(overlap) = Overlap::between(ids::next_id(), updated, other) {
                        self.overlaps.push(overlap);
                    }
                }
            }
        }

        self.overlaps.sort_by_key(|ov| (ov.start(), ov.id()));
    }

    fn reposition(&mut self, pos: i64) {
        let pos = pos.max(0);
        for clip in &mut self.clips {
            clip.seek_to(pos - clip.start());
        }

        if self.forward {
            self.read_clip_idx = self
                .clips
                .iter()
                .position(|c| pos < c.end())
                .unwrap_or(self.clips.len());
            self.read_overlap_idx = self
                .overlaps
                .iter()
                .position(|ov| pos < ov.end())
                .unwrap_or(self.overlaps.len());
        } else {
            self.read_clip_idx = self.clips.partition_point(|c| c.start() <= pos);
            self.read_overlap_idx = self.overlaps.partition_point(|ov| ov.start() <= pos);
            if self.read_clip_idx > 0 {
                self.read_clip_idx -= 1;
            }
            if self.read_overlap_idx > 0 {
                self.read_overlap_idx -= 1;
            }
        }

        self.read_samples = pos * i64::from(self.sample_rate) / 1000;
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};
    use montage_media::error::Error;
    use montage_media::frame::ImageMat;
    use montage_media::source::VideoSource;
    use montage_media::time::Rational;

    use super::VideoTrack;

    struct SolidSource {
        duration_ms: i64,
        color: [u8; 4],
    }

    impl VideoSource for SolidSource {
        fn duration_ms(&self) -> i64 {
            self.duration_ms
        }

        fn seek_to(&mut self, _pos_ms: i64) {}

        fn read_frame(&mut self, pos_ms: i64) -> Option<ImageMat> {
            Some(ImageMat::from_image(
                RgbaImage::from_pixel(8, 8, Rgba(self.color)),
                pos_ms as f64 / 1000.0,
            ))
        }
    }

    const RED: [u8; 4] = [255, 0, 0, 255];
    const GREEN: [u8; 4] = [0, 255, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];

    fn solid(duration_ms: i64, color: [u8; 4]) -> Box<SolidSource> {
        Box::new(SolidSource { duration_ms, color })
    }

    fn track() -> VideoTrack {
        VideoTrack::new(1, 1920, 1080, Rational::new(25, 1).expect("valid rate"))
    }

    fn pixel(mat: &ImageMat) -> [u8; 4] {
        mat.image().expect("frame has pixels").get_pixel(4, 4).0
    }

    #[test]
    fn abutting_insert_produces_no_overlap() {
        let mut t = track();
        t.add_new_clip(1, solid(1000, RED), 0, 0, 0).expect("insert A");
        t.add_new_clip(2, solid(500, BLUE), 1000, 0, 0).expect("insert B");

        assert_eq!(t.duration(), 1500);
        assert_eq!(t.overlaps().len(), 0);

        t.seek_to(1000).expect("seek");
        let frame = t.read_video_frame();
        assert_eq!(frame.timestamp, 1.0);
        assert_eq!(pixel(&frame), BLUE);
    }

    #[test]
    fn intersecting_insert_creates_one_overlap() {
        let mut t = track();
        t.add_new_clip(1, solid(1000, RED), 0, 0, 0).expect("insert A");
        t.add_new_clip(3, solid(400, GREEN), 900, 0, 0).expect("insert C");

        assert_eq!(t.overlaps().len(), 1);
        let overlap = t.overlaps()[0];
        assert_eq!(overlap.start(), 900);
        assert_eq!(overlap.end(), 1000);
        assert_eq!(overlap.duration(), 100);

        // frame-grid position 960 ms sits at t = 0.6 through the overlap
        t.seek_to(960).expect("seek");
        let frame = t.read_video_frame();
        assert_eq!(pixel(&frame), [102, 153, 0, 255]);
    }

    #[test]
    fn entering_a_foreign_overlap_is_rejected() {
        let mut t = track();
        t.add_new_clip(1, solid(1000, RED), 0, 0, 0).expect("insert A");
        t.add_new_clip(3, solid(400, GREEN), 900, 0, 0).expect("insert C");

        let result = t.add_new_clip(4, solid(200, BLUE), 950, 0, 0);
        assert!(matches!(result, Err(Error::InvalidRange(_))));
        assert_eq!(t.clip_count(), 2);
    }

    #[test]
    fn abutting_an_overlap_boundary_is_allowed() {
        let mut t = track();
        t.add_new_clip(1, solid(1000, RED), 0, 0, 0).expect("insert A");
        t.add_new_clip(3, solid(400, GREEN), 900, 0, 0).expect("insert C");

        // [1000, 1200) touches the overlap end but never enters it
        t.add_new_clip(4, solid(200, BLUE), 1000, 0, 0)
            .expect("abutting insert");
    }

    #[test]
    fn clips_stay_ordered_by_start_then_id() {
        let mut t = track();
        t.add_new_clip(5, solid(300, RED), 600, 0, 0).expect("insert");
        t.add_new_clip(2, solid(300, GREEN), 0, 0, 0).expect("insert");
        t.add_new_clip(9, solid(300, BLUE), 300, 0, 0).expect("insert");

        let order: Vec<(i64, i64)> = t.clips().iter().map(|c| (c.start(), c.id())).collect();
        assert_eq!(order, vec![(0, 2), (300, 9), (600, 5)]);
    }

    #[test]
    fn removing_last_clip_resets_duration() {
        let mut t = track();
        t.add_new_clip(1, solid(1000, RED), 0, 0, 0).expect("insert");
        let removed = t.remove_clip_by_id(1).expect("remove");
        assert_eq!(removed.track_id(), crate::ids::UNATTACHED);
        assert_eq!(t.duration(), 0);
        assert_eq!(t.clip_count(), 0);
    }

    #[test]
    fn removing_overlap_member_drops_the_overlap() {
        let mut t = track();
        t.add_new_clip(1, solid(1000, RED), 0, 0, 0).expect("insert A");
        t.add_new_clip(3, solid(400, GREEN), 900, 0, 0).expect("insert C");
        assert_eq!(t.overlaps().len(), 1);

        t.remove_clip_by_id(3).expect("remove");
        assert_eq!(t.overlaps().len(), 0);
    }

    #[test]
    fn seek_on_empty_track_is_a_noop() {
        let mut t = track();
        t.seek_to(0).expect("seek");
        let frame = t.read_video_frame();
        assert!(frame.is_empty());
    }

    #[test]
    fn failed_move_leaves_model_unchanged() {
        let mut t = track();
        t.add_new_clip(1, solid(1000, RED), 0, 0, 0).expect("insert A");
        t.add_new_clip(3, solid(400, GREEN), 900, 0, 0).expect("insert C");
        t.add_new_clip(4, solid(200, BLUE), 2000, 0, 0).expect("insert D");

        // moving D into the middle of the (A, C) overlap must fail
        let result = t.move_clip(4, 950);
        assert!(matches!(result, Err(Error::InvalidRange(_))));
        let d = t.clip_by_id(4).expect("still present");
        assert_eq!(d.start(), 2000);
    }

    #[test]
    fn move_away_dissolves_overlap() {
        let mut t = track();
        t.add_new_clip(1, solid(1000, RED), 0, 0, 0).expect("insert A");
        t.add_new_clip(3, solid(400, GREEN), 900, 0, 0).expect("insert C");
        assert_eq!(t.overlaps().len(), 1);

        t.move_clip(3, 1000).expect("move to abut");
        assert_eq!(t.overlaps().len(), 0);
        assert_eq!(t.duration(), 1400);
    }

    #[test]
    fn trim_updates_overlap_extent() {
        let mut t = track();
        t.add_new_clip(1, solid(1000, RED), 0, 0, 0).expect("insert A");
        t.add_new_clip(3, solid(400, GREEN), 900, 0, 0).expect("insert C");

        // trimming A's tail by 50 ms shrinks the overlap to [900, 950)
        t.change_clip_range(1, 0, 50).expect("trim");
        assert_eq!(t.overlaps().len(), 1);
        assert_eq!(t.overlaps()[0].end(), 950);
    }

    #[test]
    fn reverse_read_prefers_overlap() {
        let mut t = track();
        t.add_new_clip(1, solid(1000, RED), 0, 0, 0).expect("insert A");
        t.add_new_clip(3, solid(400, GREEN), 900, 0, 0).expect("insert C");

        t.set_direction(false);
        t.seek_to(960).expect("seek");
        let frame = t.read_video_frame();
        // both cursors cover 960 ms; the overlap wins in reverse too
        assert_eq!(pixel(&frame), [102, 153, 0, 255]);

        // the counter stepped backwards
        let next = t.read_video_frame();
        assert!(next.timestamp < frame.timestamp);
    }

    #[test]
    fn forward_read_steps_through_a_hole() {
        let mut t = track();
        t.add_new_clip(1, solid(200, RED), 0, 0, 0).expect("insert A");
        t.add_new_clip(2, solid(200, BLUE), 1000, 0, 0).expect("insert B");

        t.seek_to(500).expect("seek");
        let frame = t.read_video_frame();
        assert!(frame.is_empty());
        // 500 ms snaps to frame 12 of the 25 fps grid
        assert_eq!(frame.timestamp, 0.48);
    }
}
