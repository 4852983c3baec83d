use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use ffmpeg::media::Type;
use ffmpeg::software::scaling::flag::Flags as ScaleFlags;
use ffmpeg_the_third as ffmpeg;
use tracing::{debug, warn};

use crate::convert::FrameConverter;
use crate::decode::{DecodePoll, VideoDecoder};
use crate::demux::Demuxer;
use crate::error::{Error, Result};
use crate::frame::{ColorFormat, ImageMat};
use crate::queue::BoundedQueue;
use crate::time::from_millis;

const PACKET_Q_LEN: usize = 8;
const FRAME_Q_LEN: usize = 4;
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// One snapshot slot. `same_as` marks shots whose seek landed on the same
/// key frame as an earlier shot; they borrow that shot's image instead of
/// decoding it again.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub target_ms: i64,
    pub image: ImageMat,
    pub same_as: Option<usize>,
}

struct OverviewShared {
    quit: AtomicBool,
    demux_done: AtomicBool,
    decode_done: AtomicBool,
    packet_q: BoundedQueue<(usize, ffmpeg::Packet)>,
    frame_q: BoundedQueue<(usize, ffmpeg::frame::Video)>,
    slots: Mutex<Vec<Snapshot>>,
}

impl OverviewShared {
    fn new(slots: Vec<Snapshot>) -> Self {
        Self {
            quit: AtomicBool::new(false),
            demux_done: AtomicBool::new(false),
            decode_done: AtomicBool::new(false),
            packet_q: BoundedQueue::new(PACKET_Q_LEN),
            frame_q: BoundedQueue::new(FRAME_Q_LEN),
            slots: Mutex::new(slots),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Vec<Snapshot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Fixed-count thumbnail extractor: one bounded demux → decode → generate
/// pipeline that seeks per shot instead of streaming the whole file.
pub struct MediaOverview {
    url: Option<PathBuf>,
    snapshot_count: u32,
    snapshot_size: Option<(u32, u32)>,
    resize_factor: Option<(f32, f32)>,
    interpolation: ScaleFlags,
    video_size: (u32, u32),
    shared: Option<Arc<OverviewShared>>,
    threads: Vec<JoinHandle<()>>,
}

impl Default for MediaOverview {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaOverview {
    pub fn new() -> Self {
        Self {
            url: None,
            snapshot_count: 0,
            snapshot_size: None,
            resize_factor: None,
            interpolation: ScaleFlags::AREA,
            video_size: (0, 0),
            shared: None,
            threads: Vec::new(),
        }
    }

    /// Opens `path` and starts producing `snapshot_count` evenly spaced
    /// snapshots across the video duration.
    pub fn open(&mut self, path: &Path, snapshot_count: u32) -> Result<()> {
        if snapshot_count == 0 {
            return Err(Error::invalid_argument("snapshot count must be positive"));
        }
        self.close();

        let demuxer = Demuxer::open(path)?;
        let stream_index = demuxer
            .best_stream(Type::Video)
            .ok_or_else(|| Error::not_found(format!("no video stream in {}", path.display())))?;
        let duration_ms = demuxer.duration_ms();
        if duration_ms <= 0 {
            return Err(Error::FileInvalid(format!(
                "{} has no known duration",
                path.display()
            )));
        }
        let params = demuxer
            .codec_parameters(stream_index)
            .ok_or_else(|| Error::not_found("video stream parameters".to_string()))?;
        let probe = VideoDecoder::open(params, false)?;
        self.video_size = (probe.width(), probe.height());
        drop(probe);
        drop(demuxer);

        // a resize factor configured before open resolves against the
        // source dimensions now
        if let (Some((wf, hf)), None) = (self.resize_factor, self.snapshot_size) {
            let (w, h) = self.video_size;
            self.snapshot_size = Some((
                ((w as f32 * wf) as u32).max(2),
                ((h as f32 * hf) as u32).max(2),
            ));
        }

        self.url = Some(path.to_path_buf());
        self.snapshot_count = snapshot_count;
        self.rebuild()
    }

    pub fn close(&mut self) {
        self.stop_threads();
        self.shared = None;
        self.url = None;
        self.snapshot_count = 0;
        self.video_size = (0, 0);
    }

    pub fn is_opened(&self) -> bool {
        self.url.is_some()
    }

    pub fn snapshot_count(&self) -> u32 {
        self.snapshot_count
    }

    /// Current snapshot images, `same_as` references resolved. Slots still
    /// being produced come back empty.
    pub fn snapshots(&self) -> Vec<ImageMat> {
        let Some(shared) = self.shared.as_ref() else {
            return Vec::new();
        };
        let slots = shared.slots();
        slots
            .iter()
            .map(|slot| match slot.same_as {
                Some(source) => slots
                    .get(source)
                    .map(|s| s.image.clone())
                    .unwrap_or_default(),
                None => slot.image.clone(),
            })
            .collect()
    }

    pub fn set_snapshot_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.snapshot_size = if width == 0 || height == 0 {
            None
        } else {
            Some((width, height))
        };
        self.resize_factor = None;
        if self.is_opened() { self.rebuild() } else { Ok(()) }
    }

    /// Sizes snapshots as a fraction of the source dimensions.
    pub fn set_snapshot_resize_factor(&mut self, width_factor: f32, height_factor: f32) -> Result<()> {
        if width_factor <= 0.0 || height_factor <= 0.0 {
            return Err(Error::invalid_argument(
                "resize factors must be positive",
            ));
        }
        self.resize_factor = Some((width_factor, height_factor));
        if self.is_opened() {
            let (w, h) = self.video_size;
            self.snapshot_size = Some((
                ((w as f32 * width_factor) as u32).max(2),
                ((h as f32 * height_factor) as u32).max(2),
            ));
            self.rebuild()
        } else {
            Ok(())
        }
    }

    pub fn set_out_color_format(&mut self, format: ColorFormat) -> Result<()> {
        FrameConverter::new().set_out_color_format(format)?;
        if self.is_opened() { self.rebuild() } else { Ok(()) }
    }

    pub fn set_resize_interpolate_mode(&mut self, flags: ScaleFlags) -> Result<()> {
        self.interpolation = flags;
        if self.is_opened() { self.rebuild() } else { Ok(()) }
    }

    /// Stops the pipeline, flushes everything and starts over with the
    /// current configuration.
    fn rebuild(&mut self) -> Result<()> {
        self.stop_threads();

        let path = self
            .url
            .clone()
            .ok_or(Error::NotOpened)?;
        let count = self.snapshot_count;

        let demuxer = Demuxer::open(&path)?;
        let stream_index = demuxer
            .best_stream(Type::Video)
            .ok_or_else(|| Error::not_found("video stream".to_string()))?;
        let duration_ms = demuxer.duration_ms();
        let start_ms = demuxer.start_time_ms();
        let time_base = demuxer
            .stream_time_base(stream_index)
            .ok_or_else(|| Error::not_found("video stream time base".to_string()))?;
        drop(demuxer);

        let interval_ms = duration_ms as f64 / count as f64;
        let slots: Vec<Snapshot> = (0..count)
            .map(|i| Snapshot {
                target_ms: start_ms + (interval_ms * i as f64) as i64,
                image: ImageMat::empty(),
                same_as: None,
            })
            .collect();
        let targets_ms: Vec<i64> = slots.iter().map(|s| s.target_ms).collect();

        let shared = Arc::new(OverviewShared::new(slots));
        self.shared = Some(shared.clone());

        let demux_shared = shared.clone();
        let demux_path = path.clone();
        let demux_handle = std::thread::Builder::new()
            .name("overview-demux".into())
            .spawn(move || {
                demux_proc(demux_shared, demux_path, stream_index, time_base, targets_ms);
            })
            .map_err(Error::IoFailed)?;

        let decode_shared = shared.clone();
        let decode_path = path.clone();
        let decode_handle = std::thread::Builder::new()
            .name("overview-decode".into())
            .spawn(move || {
                decode_proc(decode_shared, decode_path, stream_index);
            })
            .map_err(Error::IoFailed)?;

        let gen_shared = shared;
        let snapshot_size = self.snapshot_size;
        let interpolation = self.interpolation;
        let gen_handle = std::thread::Builder::new()
            .name("overview-generate".into())
            .spawn(move || {
                generate_proc(gen_shared, snapshot_size, interpolation);
            })
            .map_err(Error::IoFailed)?;

        self.threads = vec![demux_handle, decode_handle, gen_handle];
        Ok(())
    }

    fn stop_threads(&mut self) {
        if let Some(shared) = self.shared.as_ref() {
            shared.quit.store(true, Ordering::Relaxed);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(shared) = self.shared.as_ref() {
            shared.packet_q.flush();
            shared.frame_q.flush();
        }
    }
}

impl Drop for MediaOverview {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

/// Seeks once per shot and forwards the key-frame packet for that shot.
/// When two consecutive shots land on the same packet the later one is
/// marked `same_as` and skipped.
fn demux_proc(
    shared: Arc<OverviewShared>,
    path: PathBuf,
    stream_index: usize,
    time_base: crate::time::Rational,
    targets_ms: Vec<i64>,
) {
    debug!(path = %path.display(), shots = targets_ms.len(), "overview demux start");
    let Ok(mut demuxer) = Demuxer::open(&path) else {
        shared.demux_done.store(true, Ordering::Relaxed);
        return;
    };

    let mut prev_pts: Option<i64> = None;
    let mut prev_slot: Option<usize> = None;
    let mut last_enqueued: Option<usize> = None;

    'shots: for (index, target_ms) in targets_ms.iter().copied().enumerate() {
        if shared.quit.load(Ordering::Relaxed) {
            break;
        }

        let target_pts = from_millis(target_ms, time_base);
        if demuxer
            .seek_file(Some(stream_index), i64::MIN, target_pts, target_pts)
            .is_err()
        {
            warn!(index, target_ms, "overview shot seek failed");
            continue;
        }

        // first video packet after a bounded seek is the chosen key frame
        let packet = loop {
            if shared.quit.load(Ordering::Relaxed) {
                break 'shots;
            }
            match demuxer.read_packet() {
                Ok(Some(packet)) if packet.stream() == stream_index => break packet,
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => continue 'shots,
            }
        };

        if packet.pts().is_some() && packet.pts() == prev_pts {
            let mut slots = shared.slots();
            if let Some(prev) = prev_slot {
                let resolved = slots[prev].same_as.unwrap_or(prev);
                slots[index].same_as = Some(resolved);
            }
            prev_slot = Some(index);
            continue;
        }
        prev_pts = packet.pts();
        prev_slot = Some(index);
        last_enqueued = Some(index);

        let mut item = (index, packet);
        loop {
            match shared.packet_q.try_push(item) {
                Ok(()) => break,
                Err(back) => {
                    if shared.quit.load(Ordering::Relaxed) {
                        break 'shots;
                    }
                    item = back;
                    std::thread::sleep(IDLE_SLEEP);
                }
            }
        }
    }

    // shots never reached (seek landed past EOF) borrow the last real one
    if let Some(last) = last_enqueued {
        let mut slots = shared.slots();
        for slot in slots.iter_mut().skip(last + 1) {
            if slot.same_as.is_none() {
                slot.same_as = Some(last);
            }
        }
    }

    shared.demux_done.store(true, Ordering::Relaxed);
    debug!("overview demux done");
}

/// Decodes each shot's packet into a frame, forcing the codec to emit by
/// draining it per shot.
fn decode_proc(shared: Arc<OverviewShared>, path: PathBuf, stream_index: usize) {
    let decoder = Demuxer::open(&path)
        .ok()
        .and_then(|d| d.codec_parameters(stream_index))
        .and_then(|p| VideoDecoder::open(p, false).ok());
    let Some(mut decoder) = decoder else {
        shared.decode_done.store(true, Ordering::Relaxed);
        return;
    };

    let mut frame = ffmpeg::frame::Video::empty();
    while !shared.quit.load(Ordering::Relaxed) {
        let Some((index, packet)) = shared.packet_q.pop() else {
            if shared.demux_done.load(Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(IDLE_SLEEP);
            continue;
        };

        decoder.flush();
        if decoder.send_packet(&packet).is_err() {
            continue;
        }
        if decoder.send_eof().is_err() {
            continue;
        }

        loop {
            match decoder.poll_frame(&mut frame) {
                Ok(DecodePoll::Frame) => {
                    let mut item = (index, std::mem::replace(&mut frame, ffmpeg::frame::Video::empty()));
                    loop {
                        match shared.frame_q.try_push(item) {
                            Ok(()) => break,
                            Err(back) => {
                                if shared.quit.load(Ordering::Relaxed) {
                                    shared.decode_done.store(true, Ordering::Relaxed);
                                    return;
                                }
                                item = back;
                                std::thread::sleep(IDLE_SLEEP);
                            }
                        }
                    }
                    break;
                }
                Ok(DecodePoll::Again) => continue,
                Ok(DecodePoll::Eof) | Err(_) => break,
            }
        }
        decoder.flush();
    }

    shared.decode_done.store(true, Ordering::Relaxed);
}

/// Converts decoded shot frames at the configured snapshot size and stores
/// them in their slots.
fn generate_proc(
    shared: Arc<OverviewShared>,
    snapshot_size: Option<(u32, u32)>,
    interpolation: ScaleFlags,
) {
    let mut converter = FrameConverter::new();
    if let Some((w, h)) = snapshot_size {
        converter.set_out_size(w, h);
    }
    converter.set_resize_interpolation(interpolation);

    while !shared.quit.load(Ordering::Relaxed) {
        let Some((index, frame)) = shared.frame_q.pop() else {
            if shared.decode_done.load(Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(IDLE_SLEEP);
            continue;
        };

        let target_ms = {
            let slots = shared.slots();
            slots.get(index).map(|s| s.target_ms).unwrap_or(0)
        };
        match converter.convert(&frame, target_ms as f64 / 1000.0) {
            Ok(mat) => {
                let mut slots = shared.slots();
                if let Some(slot) = slots.get_mut(index) {
                    slot.image = mat;
                }
            }
            Err(e) => warn!(index, error = %e, "overview frame conversion failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Snapshot;
    use crate::frame::ImageMat;

    #[test]
    fn snapshot_targets_are_evenly_spaced() {
        let duration_ms = 10_000i64;
        let count = 4u32;
        let interval = duration_ms as f64 / count as f64;
        let targets: Vec<i64> = (0..count).map(|i| (interval * i as f64) as i64).collect();
        assert_eq!(targets, vec![0, 2500, 5000, 7500]);
    }

    #[test]
    fn same_as_chain_resolves_to_first_real_slot() {
        // slot 1 borrows 0, slot 2 borrows via 1's resolution
        let mut slots = vec![
            Snapshot { target_ms: 0, image: ImageMat::empty(), same_as: None },
            Snapshot { target_ms: 100, image: ImageMat::empty(), same_as: None },
            Snapshot { target_ms: 200, image: ImageMat::empty(), same_as: None },
        ];
        slots[1].same_as = Some(slots[0].same_as.unwrap_or(0));
        slots[2].same_as = Some(slots[1].same_as.unwrap_or(1));
        assert_eq!(slots[2].same_as, Some(0));
    }
}
