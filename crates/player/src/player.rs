use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ffmpeg::media::Type;
use ffmpeg_the_third as ffmpeg;
use tracing::{debug, error, info, warn};

use montage_audio::{AudioRender, PcmFormat};
use montage_media::convert::FrameConverter;
use montage_media::decode::{AudioDecoder, DecodePoll, VideoDecoder};
use montage_media::demux::Demuxer;
use montage_media::error::{Error, Result};
use montage_media::frame::{ImageMat, PcmBuf};
use montage_media::queue::BoundedQueue;
use montage_media::resample::Resampler;
use montage_media::time::{Rational, from_millis, to_millis};

use crate::cache::ScrubFrameCache;
use crate::stream::PlayerByteStream;

/// Stream selection applied at `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayMode {
    #[default]
    Normal,
    VideoOnly,
    AudioOnly,
}

/// Seconds of video packets the demuxer may run ahead of the decoder.
const VID_PKT_Q_DURATION_S: f64 = 2.0;
/// Seconds of resampled audio kept ready for the device.
const AUDIO_Q_DURATION_S: f64 = 0.5;
const AUD_PKT_Q_LEN: usize = 64;
const VID_FRM_Q_LEN: usize = 4;
const AUD_FRM_Q_LEN: usize = 5;
const SWR_Q_INITIAL_LEN: usize = 24;
/// Demux/decode stages idle at 5 ms, the render stage at 1 ms.
const STAGE_SLEEP: Duration = Duration::from_millis(5);
const RENDER_SLEEP: Duration = Duration::from_millis(1);

/// Wall-clock bookkeeping for the no-audio case. With audio present, the
/// device callback's consumption position is the clock instead.
#[derive(Default)]
struct ClockState {
    run_start: Option<Instant>,
    pause_start: Option<Instant>,
    paused_dur_ms: i64,
    pos_offset_ms: i64,
}

/// State shared between the control surface and the pipeline threads.
struct PlayerShared {
    quit: AtomicBool,
    playing: AtomicBool,
    demux_eof: AtomicBool,
    viddec_eof: AtomicBool,
    auddec_eof: AtomicBool,
    swr_eof: AtomicBool,
    render_eof: AtomicBool,
    after_seek: AtomicBool,
    seek_to_i: AtomicBool,
    seek_to_mts: AtomicI64,
    /// Scrub target; `i64::MIN` means "not set".
    async_seek_pos: AtomicI64,
    audio_mts: Arc<AtomicI64>,
    audio_offset: AtomicI64,
    play_pos: AtomicI64,
    qvp: BoundedQueue<ffmpeg::Packet>,
    qap: BoundedQueue<ffmpeg::Packet>,
    qvf: BoundedQueue<ffmpeg::frame::Video>,
    qaf: BoundedQueue<ffmpeg::frame::Audio>,
    qsw: Arc<BoundedQueue<PcmBuf>>,
    current_video: Mutex<ImageMat>,
    clock: Mutex<ClockState>,
}

impl PlayerShared {
    fn new(vid_pkt_q_len: usize) -> Self {
        Self {
            quit: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            demux_eof: AtomicBool::new(false),
            viddec_eof: AtomicBool::new(false),
            auddec_eof: AtomicBool::new(false),
            swr_eof: AtomicBool::new(false),
            render_eof: AtomicBool::new(false),
            after_seek: AtomicBool::new(false),
            seek_to_i: AtomicBool::new(false),
            seek_to_mts: AtomicI64::new(i64::MIN),
            async_seek_pos: AtomicI64::new(i64::MIN),
            audio_mts: Arc::new(AtomicI64::new(0)),
            audio_offset: AtomicI64::new(0),
            play_pos: AtomicI64::new(0),
            qvp: BoundedQueue::new(vid_pkt_q_len),
            qap: BoundedQueue::new(AUD_PKT_Q_LEN),
            qvf: BoundedQueue::new(VID_FRM_Q_LEN),
            qaf: BoundedQueue::new(AUD_FRM_Q_LEN),
            qsw: Arc::new(BoundedQueue::new(SWR_Q_INITIAL_LEN)),
            current_video: Mutex::new(ImageMat::empty()),
            clock: Mutex::new(ClockState::default()),
        }
    }

    fn flush_queues(&self) {
        self.qvp.flush();
        self.qap.flush();
        self.qvf.flush();
        self.qaf.flush();
        self.qsw.flush();
    }

    fn reset_eof_flags(&self) {
        self.demux_eof.store(false, Ordering::Relaxed);
        self.viddec_eof.store(false, Ordering::Relaxed);
        self.auddec_eof.store(false, Ordering::Relaxed);
        self.swr_eof.store(false, Ordering::Relaxed);
        self.render_eof.store(false, Ordering::Relaxed);
    }

    fn clock(&self) -> MutexGuard<'_, ClockState> {
        match self.clock.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish_video(&self, mat: ImageMat) {
        let mut current = match self.current_video.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = mat;
    }
}

/// Everything learned about the opened media at `open` time.
struct OpenMedia {
    url: PathBuf,
    video_stream: Option<usize>,
    audio_stream: Option<usize>,
    video_time_base: Rational,
    audio_time_base: Rational,
    duration_ms: i64,
    start_time_ms: i64,
    audio_rate: u32,
    audio_channels: u16,
}

/// Start parameters handed to a fresh set of pipeline threads.
#[derive(Clone, Copy)]
struct PendingStart {
    start_ms: i64,
    seek_to_mts: i64,
    seek_to_i: bool,
    after_seek: bool,
}

impl PendingStart {
    fn from_beginning() -> Self {
        Self {
            start_ms: 0,
            seek_to_mts: i64::MIN,
            seek_to_i: false,
            after_seek: false,
        }
    }

    fn from_seek(pos: i64, seek_to_i: bool) -> Self {
        Self {
            start_ms: pos,
            seek_to_mts: pos,
            seek_to_i,
            after_seek: true,
        }
    }
}

/// The playback controller: one opened media, a staged demux → decode →
/// resample → render pipeline over bounded queues, synchronous seek and
/// asynchronous scrub.
///
/// Control methods take `&mut self`, so the control plane is serialized
/// by construction; pipeline threads only ever touch the shared state.
pub struct Player {
    play_mode: PlayMode,
    prefer_hw: bool,
    audio_render: Option<Box<dyn AudioRender>>,
    media: Option<OpenMedia>,
    shared: Option<Arc<PlayerShared>>,
    byte_stream: Option<Arc<PlayerByteStream>>,
    threads: Vec<JoinHandle<()>>,
    pending_start: PendingStart,
    is_playing: bool,
    is_seeking: bool,
    playing_before_seek: bool,
}

impl Default for Player {
    fn default() -> Self {
        Self::new()
    }
}

impl Player {
    pub fn new() -> Self {
        Self {
            play_mode: PlayMode::Normal,
            prefer_hw: false,
            audio_render: None,
            media: None,
            shared: None,
            byte_stream: None,
            threads: Vec::new(),
            pending_start: PendingStart::from_beginning(),
            is_playing: false,
            is_seeking: false,
            playing_before_seek: false,
        }
    }

    pub fn is_opened(&self) -> bool {
        self.media.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn is_seeking(&self) -> bool {
        self.is_seeking
    }

    pub fn has_video(&self) -> bool {
        self.media
            .as_ref()
            .is_some_and(|m| m.video_stream.is_some())
    }

    pub fn has_audio(&self) -> bool {
        self.media
            .as_ref()
            .is_some_and(|m| m.audio_stream.is_some())
    }

    pub fn duration_ms(&self) -> i64 {
        self.media.as_ref().map(|m| m.duration_ms).unwrap_or(0)
    }

    /// Current position in milliseconds, derived from the audio clock
    /// when audio is rendered, otherwise from the steady clock.
    pub fn play_pos(&self) -> i64 {
        self.shared
            .as_ref()
            .map(|s| s.play_pos.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// The most recently published frame; cloning shares pixels.
    pub fn current_video(&self) -> ImageMat {
        let Some(shared) = self.shared.as_ref() else {
            return ImageMat::empty();
        };
        match shared.current_video.lock() {
            Ok(mat) => mat.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stream selection can only change while no media is open.
    pub fn set_play_mode(&mut self, mode: PlayMode) -> Result<()> {
        if self.is_opened() {
            return Err(Error::InvalidState(
                "play mode can only change while no media is open".to_string(),
            ));
        }
        self.play_mode = mode;
        Ok(())
    }

    pub fn set_prefer_hw_decoder(&mut self, prefer: bool) {
        self.prefer_hw = prefer;
    }

    /// Installs the output device; refused mid-playback.
    pub fn set_audio_render(&mut self, render: Box<dyn AudioRender>) -> Result<()> {
        if self.is_playing {
            return Err(Error::InvalidState(
                "cannot swap the audio render while playing".to_string(),
            ));
        }
        self.audio_render = Some(render);
        Ok(())
    }

    pub fn open(&mut self, url: &Path) -> Result<()> {
        if self.is_opened() {
            self.close();
        }
        match self.open_media(url) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn open_media(&mut self, url: &Path) -> Result<()> {
        let demuxer = Demuxer::open(url)?;

        let video_stream = if self.play_mode != PlayMode::AudioOnly {
            demuxer.best_stream(Type::Video)
        } else {
            None
        };
        let audio_stream = if self.play_mode != PlayMode::VideoOnly {
            demuxer.best_stream(Type::Audio)
        } else {
            None
        };
        if video_stream.is_none() && audio_stream.is_none() {
            return Err(Error::FileInvalid(format!(
                "neither video nor audio stream found in {}",
                url.display()
            )));
        }

        let video_time_base = video_stream
            .and_then(|s| demuxer.stream_time_base(s))
            .unwrap_or(Rational::MILLIS);
        let audio_time_base = audio_stream
            .and_then(|s| demuxer.stream_time_base(s))
            .unwrap_or(Rational::MILLIS);

        // verify the video decoder opens (with the hw preference applied)
        // before any thread depends on it
        let mut vid_pkt_q_len = 20;
        if let Some(stream) = video_stream {
            let params = demuxer
                .codec_parameters(stream)
                .ok_or_else(|| Error::not_found("video stream parameters".to_string()))?;
            let probe = VideoDecoder::open(params, self.prefer_hw)?;
            drop(probe);
            if let Some(rate) = demuxer.stream_avg_frame_rate(stream) {
                let per_second = rate.as_f64();
                vid_pkt_q_len = ((VID_PKT_Q_DURATION_S * per_second) as usize).max(20);
            }
        }

        let mut audio_rate = 0;
        let mut audio_channels = 0;
        if let Some(stream) = audio_stream {
            let params = demuxer
                .codec_parameters(stream)
                .ok_or_else(|| Error::not_found("audio stream parameters".to_string()))?;
            let probe = AudioDecoder::open(params)?;
            audio_rate = probe.sample_rate();
            audio_channels = (probe.ch_layout().channels() as u16).min(2).max(1);
        }

        let shared = Arc::new(PlayerShared::new(vid_pkt_q_len));

        if audio_stream.is_some() {
            if let Some(render) = self.audio_render.as_mut() {
                let stream = Arc::new(PlayerByteStream::new(
                    shared.qsw.clone(),
                    shared.audio_mts.clone(),
                ));
                render.open_device(audio_rate, audio_channels, PcmFormat::F32, stream.clone())?;
                self.byte_stream = Some(stream);
            }
        }

        info!(
            url = %url.display(),
            video = ?video_stream,
            audio = ?audio_stream,
            duration_ms = demuxer.duration_ms(),
            "media opened"
        );

        self.media = Some(OpenMedia {
            url: url.to_path_buf(),
            video_stream,
            audio_stream,
            video_time_base,
            audio_time_base,
            duration_ms: demuxer.duration_ms(),
            start_time_ms: demuxer.start_time_ms(),
            audio_rate,
            audio_channels,
        });
        self.shared = Some(shared);
        self.pending_start = PendingStart::from_beginning();
        Ok(())
    }

    pub fn close(&mut self) {
        self.stop_threads();
        if let Some(shared) = self.shared.as_ref() {
            shared.flush_queues();
        }
        if let Some(render) = self.audio_render.as_mut() {
            render.close_device();
        }
        self.byte_stream = None;
        self.shared = None;
        self.media = None;
        self.is_playing = false;
        self.is_seeking = false;
        self.playing_before_seek = false;
        self.pending_start = PendingStart::from_beginning();
    }

    /// Starts (or resumes) playback. Repeated calls are no-ops; playback
    /// past the end restarts from the beginning.
    pub fn play(&mut self) -> Result<()> {
        if self.is_playing {
            return Ok(());
        }
        let shared = self.shared_ref()?;
        if shared.render_eof.load(Ordering::Relaxed) {
            self.reset()?;
        }

        if !self.uses_audio_clock() {
            let shared = self.shared_ref()?;
            let mut clock = shared.clock();
            if clock.run_start.is_none() {
                clock.run_start = Some(Instant::now());
            }
            if let Some(pause_start) = clock.pause_start.take() {
                clock.paused_dur_ms += pause_start.elapsed().as_millis() as i64;
            }
        }

        if self.threads.is_empty() {
            self.start_playback_threads()?;
        }
        if let Some(render) = self.audio_render.as_mut() {
            if render.is_device_open() {
                render.resume()?;
            }
        }
        if let Some(shared) = self.shared.as_ref() {
            shared.playing.store(true, Ordering::Relaxed);
        }
        self.is_playing = true;
        Ok(())
    }

    /// Pauses the clock and the renderer; pipeline threads keep filling
    /// the queues until they are full.
    pub fn pause(&mut self) -> Result<()> {
        let shared = self.shared_ref()?.clone();
        if let Some(render) = self.audio_render.as_mut() {
            if render.is_device_open() {
                render.pause()?;
            }
        }
        if !self.uses_audio_clock() {
            let mut clock = shared.clock();
            if clock.pause_start.is_none() {
                clock.pause_start = Some(Instant::now());
            }
        }
        shared.playing.store(false, Ordering::Relaxed);
        self.is_playing = false;
        Ok(())
    }

    /// Stops the pipeline, flushes everything and rewinds to the start.
    pub fn reset(&mut self) -> Result<()> {
        let shared = self.shared_ref()?.clone();
        if let Some(render) = self.audio_render.as_mut() {
            if render.is_device_open() {
                render.pause()?;
                render.flush()?;
            }
        }
        self.stop_threads();
        shared.flush_queues();
        if let Some(stream) = self.byte_stream.as_ref() {
            stream.reset();
        }

        shared.reset_eof_flags();
        shared.audio_mts.store(0, Ordering::Relaxed);
        shared.audio_offset.store(0, Ordering::Relaxed);
        shared.play_pos.store(0, Ordering::Relaxed);
        *shared.clock() = ClockState::default();

        self.pending_start = PendingStart::from_beginning();
        self.is_playing = false;
        Ok(())
    }

    /// Synchronous seek: stop, flush, restart at `pos`. The next
    /// published frame has `pts >= pos`, or the nearest preceding
    /// key frame's pts with `seek_to_i`.
    pub fn seek(&mut self, pos: i64, seek_to_i: bool) -> Result<()> {
        let shared = self.shared_ref()?.clone();
        let was_playing = self.is_playing;

        if let Some(render) = self.audio_render.as_mut() {
            if render.is_device_open() {
                render.pause()?;
                render.flush()?;
            }
        }
        self.stop_threads();
        shared.flush_queues();
        if let Some(stream) = self.byte_stream.as_ref() {
            stream.reset();
        }
        shared.reset_eof_flags();
        shared.clock().pause_start = None;

        info!(pos, seek_to_i, "seek");
        self.pending_start = PendingStart::from_seek(pos, seek_to_i);
        self.is_playing = false;

        if was_playing {
            self.start_playback_threads()?;
            if let Some(render) = self.audio_render.as_mut() {
                if render.is_device_open() {
                    render.resume()?;
                }
            }
            shared.playing.store(true, Ordering::Relaxed);
            self.is_playing = true;
        }
        Ok(())
    }

    /// Asynchronous scrub. The first call swaps the pipeline into scrub
    /// mode; later calls only move the target.
    pub fn seek_async(&mut self, pos: i64) -> Result<()> {
        let shared = self.shared_ref()?.clone();

        if !self.is_seeking {
            self.playing_before_seek = self.is_playing;
            if let Some(render) = self.audio_render.as_mut() {
                if render.is_device_open() {
                    render.pause()?;
                    render.flush()?;
                }
            }
            self.stop_threads();
            shared.flush_queues();
            if let Some(stream) = self.byte_stream.as_ref() {
                stream.reset();
            }
            shared.reset_eof_flags();
            shared.clock().pause_start = None;
            shared.async_seek_pos.store(i64::MIN, Ordering::Relaxed);

            self.start_scrub_threads()?;
            self.is_seeking = true;
        }

        debug!(pos, "seek (async)");
        shared.async_seek_pos.store(pos, Ordering::Relaxed);
        Ok(())
    }

    /// Leaves scrub mode: commits the last target with a synchronous seek
    /// and restores the pre-scrub play state.
    pub fn quit_seek_async(&mut self) -> Result<()> {
        let shared = self.shared_ref()?.clone();
        if !self.is_seeking {
            return Ok(());
        }

        self.stop_threads();
        shared.flush_queues();
        if let Some(stream) = self.byte_stream.as_ref() {
            stream.reset();
        }
        shared.reset_eof_flags();
        shared.clock().pause_start = None;

        let committed = shared.async_seek_pos.load(Ordering::Relaxed);
        let committed = if committed == i64::MIN {
            self.media.as_ref().map(|m| m.start_time_ms).unwrap_or(0)
        } else {
            committed
        };
        info!(pos = committed, "seek committed after scrub");
        self.pending_start = PendingStart::from_seek(committed, false);
        self.is_seeking = false;
        self.is_playing = false;

        if self.playing_before_seek {
            self.start_playback_threads()?;
            if let Some(render) = self.audio_render.as_mut() {
                if render.is_device_open() {
                    render.resume()?;
                }
            }
            shared.playing.store(true, Ordering::Relaxed);
            self.is_playing = true;
        }
        Ok(())
    }

    fn shared_ref(&self) -> Result<&Arc<PlayerShared>> {
        self.shared.as_ref().ok_or(Error::NotOpened)
    }

    /// Whether the audio device drives the clock for this media.
    fn uses_audio_clock(&self) -> bool {
        self.has_audio()
            && self
                .audio_render
                .as_ref()
                .is_some_and(|r| r.is_device_open())
    }

    fn stop_threads(&mut self) {
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        shared.quit.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        shared.quit.store(false, Ordering::Relaxed);
        shared.playing.store(false, Ordering::Relaxed);
    }

    fn start_playback_threads(&mut self) -> Result<()> {
        let media = self.media.as_ref().ok_or(Error::NotOpened)?;
        let shared = self.shared.as_ref().ok_or(Error::NotOpened)?.clone();
        let pending = self.pending_start;
        let decode_audio = media.audio_stream.is_some() && self.uses_audio_clock();

        shared
            .seek_to_mts
            .store(pending.seek_to_mts, Ordering::Relaxed);
        shared.seek_to_i.store(pending.seek_to_i, Ordering::Relaxed);
        shared.after_seek.store(pending.after_seek, Ordering::Relaxed);
        if pending.after_seek {
            shared.play_pos.store(pending.seek_to_mts, Ordering::Relaxed);
        }

        let mut threads = Vec::new();

        {
            let shared = shared.clone();
            let url = media.url.clone();
            let video_stream = media.video_stream;
            let audio_stream = decode_audio.then_some(media.audio_stream).flatten();
            let start_ms = pending.start_ms;
            threads.push(
                std::thread::Builder::new()
                    .name("player-demux".into())
                    .spawn(move || {
                        demux_proc(shared, url, video_stream, audio_stream, start_ms);
                    })
                    .map_err(Error::IoFailed)?,
            );
        }

        if let Some(video_stream) = media.video_stream {
            let shared = shared.clone();
            let url = media.url.clone();
            let time_base = media.video_time_base;
            let prefer_hw = self.prefer_hw;
            let has_audio = decode_audio;
            threads.push(
                std::thread::Builder::new()
                    .name("player-video".into())
                    .spawn(move || {
                        video_decode_proc(shared, url, video_stream, time_base, prefer_hw, has_audio);
                    })
                    .map_err(Error::IoFailed)?,
            );
        }

        if decode_audio {
            if let Some(audio_stream) = media.audio_stream {
                let has_video = media.video_stream.is_some();
                {
                    let shared = shared.clone();
                    let url = media.url.clone();
                    let time_base = media.audio_time_base;
                    threads.push(
                        std::thread::Builder::new()
                            .name("player-audio".into())
                            .spawn(move || {
                                audio_decode_proc(shared, url, audio_stream, time_base, has_video);
                            })
                            .map_err(Error::IoFailed)?,
                    );
                }
                {
                    let shared = shared.clone();
                    let time_base = media.audio_time_base;
                    let dst_rate = media.audio_rate;
                    let dst_channels = media.audio_channels;
                    threads.push(
                        std::thread::Builder::new()
                            .name("player-swr".into())
                            .spawn(move || {
                                resample_proc(shared, time_base, dst_rate, dst_channels);
                            })
                            .map_err(Error::IoFailed)?,
                    );
                }
            }
        }

        {
            let shared = shared.clone();
            let time_base = media.video_time_base;
            let has_video = media.video_stream.is_some();
            let audio_clock = decode_audio;
            threads.push(
                std::thread::Builder::new()
                    .name("player-render".into())
                    .spawn(move || {
                        render_proc(shared, time_base, has_video, audio_clock);
                    })
                    .map_err(Error::IoFailed)?,
            );
        }

        self.threads = threads;
        Ok(())
    }

    fn start_scrub_threads(&mut self) -> Result<()> {
        let media = self.media.as_ref().ok_or(Error::NotOpened)?;
        let shared = self.shared.as_ref().ok_or(Error::NotOpened)?.clone();
        let Some(video_stream) = media.video_stream else {
            // nothing to preview while scrubbing audio-only media; the
            // committed position still takes effect on quit
            return Ok(());
        };

        shared.after_seek.store(false, Ordering::Relaxed);
        shared.seek_to_mts.store(i64::MIN, Ordering::Relaxed);

        let mut threads = Vec::new();
        {
            let shared = shared.clone();
            let url = media.url.clone();
            let time_base = media.video_time_base;
            threads.push(
                std::thread::Builder::new()
                    .name("scrub-demux".into())
                    .spawn(move || {
                        scrub_demux_proc(shared, url, video_stream, time_base);
                    })
                    .map_err(Error::IoFailed)?,
            );
        }
        {
            let shared = shared.clone();
            let url = media.url.clone();
            let time_base = media.video_time_base;
            let prefer_hw = self.prefer_hw;
            threads.push(
                std::thread::Builder::new()
                    .name("scrub-video".into())
                    .spawn(move || {
                        video_decode_proc(shared, url, video_stream, time_base, prefer_hw, false);
                    })
                    .map_err(Error::IoFailed)?,
            );
        }
        {
            let shared = shared.clone();
            let time_base = media.video_time_base;
            threads.push(
                std::thread::Builder::new()
                    .name("scrub-render".into())
                    .spawn(move || {
                        scrub_render_proc(shared, time_base);
                    })
                    .map_err(Error::IoFailed)?,
            );
        }

        self.threads = threads;
        Ok(())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}

/// Demuxer stage: reads packets and routes them into the typed packet
/// queues. A full video queue paces the whole pipeline; audio packets
/// bypass their cap while video is present so the interleave can never
/// deadlock the reader.
fn demux_proc(
    shared: Arc<PlayerShared>,
    url: PathBuf,
    video_stream: Option<usize>,
    audio_stream: Option<usize>,
    start_ms: i64,
) {
    debug!(url = %url.display(), "demux thread start");
    let mut demuxer = match Demuxer::open(&url) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "demux thread failed to open input");
            shared.demux_eof.store(true, Ordering::Relaxed);
            return;
        }
    };
    if start_ms > 0 {
        if let Err(e) = demuxer.seek_ms(start_ms) {
            warn!(start_ms, error = %e, "demux start seek failed");
        }
    }

    let mut pending: Option<ffmpeg::Packet> = None;
    while !shared.quit.load(Ordering::Relaxed) {
        let mut idle = true;

        let packet = match pending.take() {
            Some(p) => Some(p),
            None => match demuxer.read_packet() {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "demux read failed");
                    break;
                }
            },
        };
        let Some(packet) = packet else {
            debug!("demuxer eof");
            break;
        };

        let stream = packet.stream();
        if Some(stream) == video_stream {
            match shared.qvp.try_push(packet) {
                Ok(()) => idle = false,
                Err(back) => pending = Some(back),
            }
        } else if Some(stream) == audio_stream {
            if video_stream.is_some() || !shared.qap.is_full() {
                shared.qap.force_push(packet);
                idle = false;
            } else {
                pending = Some(packet);
            }
        }

        if idle {
            std::thread::sleep(STAGE_SLEEP);
        }
    }
    shared.demux_eof.store(true, Ordering::Relaxed);
    debug!("demux thread exit");
}

/// Video decoder stage, shared between playback and scrub modes. After a
/// sync seek, decoded frames before the seek point are dropped (unless
/// the first decoded frame is to become the effective seek point).
fn video_decode_proc(
    shared: Arc<PlayerShared>,
    url: PathBuf,
    video_stream: usize,
    time_base: Rational,
    prefer_hw: bool,
    has_audio: bool,
) {
    debug!("video decode thread start");
    let decoder = Demuxer::open(&url)
        .ok()
        .and_then(|d| d.codec_parameters(video_stream))
        .ok_or(Error::NotOpened)
        .and_then(|p| VideoDecoder::open(p, prefer_hw));
    let mut decoder = match decoder {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "video decoder unavailable");
            shared.viddec_eof.store(true, Ordering::Relaxed);
            return;
        }
    };

    let mut frame = ffmpeg::frame::Video::empty();
    let mut pending_frame: Option<ffmpeg::frame::Video> = None;
    let mut pending_packet: Option<ffmpeg::Packet> = None;
    let mut input_eof = false;

    while !shared.quit.load(Ordering::Relaxed) {
        let mut idle = true;

        if let Some(held) = pending_frame.take() {
            match shared.qvf.try_push(held) {
                Ok(()) => idle = false,
                Err(back) => pending_frame = Some(back),
            }
        }

        if pending_frame.is_none() {
            loop {
                match decoder.poll_frame(&mut frame) {
                    Ok(DecodePoll::Frame) => {
                        idle = false;
                        let pts_ms = frame
                            .pts()
                            .map(|p| to_millis(p, time_base))
                            .unwrap_or(0);
                        if shared.after_seek.load(Ordering::Relaxed) {
                            if shared.seek_to_i.load(Ordering::Relaxed) && !has_audio {
                                shared.seek_to_mts.store(pts_ms, Ordering::Relaxed);
                                shared.seek_to_i.store(false, Ordering::Relaxed);
                            }
                            if pts_ms < shared.seek_to_mts.load(Ordering::Relaxed) {
                                continue;
                            }
                        }
                        let out = std::mem::replace(&mut frame, ffmpeg::frame::Video::empty());
                        match shared.qvf.try_push(out) {
                            Ok(()) => continue,
                            Err(back) => {
                                pending_frame = Some(back);
                                break;
                            }
                        }
                    }
                    Ok(DecodePoll::Again) => break,
                    Ok(DecodePoll::Eof) => {
                        shared.viddec_eof.store(true, Ordering::Relaxed);
                        debug!("video decode thread drained");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "video decode failed");
                        shared.viddec_eof.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }

        if !input_eof && pending_frame.is_none() {
            loop {
                let packet = match pending_packet.take() {
                    Some(p) => p,
                    None => match shared.qvp.pop() {
                        Some(p) => p,
                        None => break,
                    },
                };
                match decoder.send_packet(&packet) {
                    Ok(true) => idle = false,
                    Ok(false) => {
                        pending_packet = Some(packet);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "video packet rejected");
                    }
                }
            }
            if pending_packet.is_none()
                && shared.qvp.is_empty()
                && shared.demux_eof.load(Ordering::Relaxed)
            {
                let _ = decoder.send_eof();
                input_eof = true;
                idle = false;
            }
        }

        if idle {
            std::thread::sleep(STAGE_SLEEP);
        }
    }
    shared.viddec_eof.store(true, Ordering::Relaxed);
    debug!("video decode thread exit");
}

/// Audio decoder stage. Keeps a running estimate of the mean frame
/// duration and resizes the resampled queue so it holds about half a
/// second of audio.
fn audio_decode_proc(
    shared: Arc<PlayerShared>,
    url: PathBuf,
    audio_stream: usize,
    time_base: Rational,
    has_video: bool,
) {
    debug!("audio decode thread start");
    let decoder = Demuxer::open(&url)
        .ok()
        .and_then(|d| d.codec_parameters(audio_stream))
        .ok_or(Error::NotOpened)
        .and_then(AudioDecoder::open);
    let mut decoder = match decoder {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "audio decoder unavailable");
            shared.auddec_eof.store(true, Ordering::Relaxed);
            return;
        }
    };
    let sample_rate = decoder.sample_rate().max(1);

    let mut avg_frame_dur_s = 0.021f64;
    const AVG_WINDOW: f64 = 10.0;

    let mut frame = ffmpeg::frame::Audio::empty();
    let mut pending_frame: Option<ffmpeg::frame::Audio> = None;
    let mut pending_packet: Option<ffmpeg::Packet> = None;
    let mut input_eof = false;

    while !shared.quit.load(Ordering::Relaxed) {
        let mut idle = true;

        if let Some(held) = pending_frame.take() {
            match shared.qaf.try_push(held) {
                Ok(()) => idle = false,
                Err(back) => pending_frame = Some(back),
            }
        }

        if pending_frame.is_none() {
            loop {
                match decoder.poll_frame(&mut frame) {
                    Ok(DecodePoll::Frame) => {
                        idle = false;
                        let frame_dur = frame.samples() as f64 / f64::from(sample_rate);
                        avg_frame_dur_s =
                            (avg_frame_dur_s * (AVG_WINDOW - 1.0) + frame_dur) / AVG_WINDOW;
                        let swr_len = (AUDIO_Q_DURATION_S / avg_frame_dur_s).ceil() as usize;
                        shared.qsw.set_max_len(swr_len.max(1));

                        let pts_ms = frame
                            .pts()
                            .map(|p| to_millis(p, time_base))
                            .unwrap_or(0);
                        if shared.after_seek.load(Ordering::Relaxed) {
                            if shared.seek_to_i.load(Ordering::Relaxed) {
                                shared.seek_to_mts.store(pts_ms, Ordering::Relaxed);
                                shared.seek_to_i.store(false, Ordering::Relaxed);
                            }
                            if pts_ms < shared.seek_to_mts.load(Ordering::Relaxed) {
                                shared.audio_mts.store(pts_ms, Ordering::Relaxed);
                                continue;
                            }
                            if !has_video {
                                shared.after_seek.store(false, Ordering::Relaxed);
                            }
                        }

                        let out = std::mem::replace(&mut frame, ffmpeg::frame::Audio::empty());
                        match shared.qaf.try_push(out) {
                            Ok(()) => continue,
                            Err(back) => {
                                pending_frame = Some(back);
                                break;
                            }
                        }
                    }
                    Ok(DecodePoll::Again) => break,
                    Ok(DecodePoll::Eof) => {
                        shared.auddec_eof.store(true, Ordering::Relaxed);
                        debug!("audio decode thread drained");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "audio decode failed");
                        shared.auddec_eof.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }

        if !input_eof && pending_frame.is_none() {
            loop {
                let packet = match pending_packet.take() {
                    Some(p) => p,
                    None => match shared.qap.pop() {
                        Some(p) => p,
                        None => break,
                    },
                };
                match decoder.send_packet(&packet) {
                    Ok(true) => idle = false,
                    Ok(false) => {
                        pending_packet = Some(packet);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "audio packet rejected");
                    }
                }
            }
            if pending_packet.is_none()
                && shared.qap.is_empty()
                && shared.demux_eof.load(Ordering::Relaxed)
            {
                let _ = decoder.send_eof();
                input_eof = true;
                idle = false;
            }
        }

        if idle {
            std::thread::sleep(STAGE_SLEEP);
        }
    }
    shared.auddec_eof.store(true, Ordering::Relaxed);
    debug!("audio decode thread exit");
}

/// Resampler stage: decoded frames to interleaved `f32` PCM at the device
/// rate. Matching input passes through untouched.
fn resample_proc(shared: Arc<PlayerShared>, time_base: Rational, dst_rate: u32, dst_channels: u16) {
    debug!("resample thread start");
    let dst_layout = ffmpeg::ChannelLayout::default_for_channels(dst_channels.into());
    let mut resampler: Option<Resampler> = None;
    let mut pending: Option<PcmBuf> = None;

    while !shared.quit.load(Ordering::Relaxed) {
        let mut idle = true;

        if let Some(held) = pending.take() {
            match shared.qsw.try_push(held) {
                Ok(()) => idle = false,
                Err(back) => pending = Some(back),
            }
        }

        if pending.is_none() {
            match shared.qaf.pop() {
                Some(frame) => {
                    idle = false;
                    let rebuilt = match resampler.as_ref() {
                        Some(r) => !r.matches_source(&frame),
                        None => true,
                    };
                    if rebuilt {
                        match Resampler::new(
                            frame.format(),
                            ffmpeg::ChannelLayout::from(frame.ch_layout().into_owned()),
                            frame.rate(),
                            dst_layout.clone(),
                            dst_rate,
                        ) {
                            Ok(r) => resampler = Some(r),
                            Err(e) => {
                                error!(error = %e, "resampler configuration failed");
                                break;
                            }
                        }
                    }
                    let Some(active) = resampler.as_mut() else {
                        continue;
                    };
                    let pts_ms = frame
                        .pts()
                        .map(|p| to_millis(p, time_base))
                        .unwrap_or(0);
                    match active.convert(&frame, pts_ms) {
                        Ok(buf) => match shared.qsw.try_push(buf) {
                            Ok(()) => {}
                            Err(back) => pending = Some(back),
                        },
                        Err(e) => warn!(error = %e, "resample failed"),
                    }
                }
                None => {
                    if shared.auddec_eof.load(Ordering::Relaxed) {
                        if let Some(active) = resampler.as_mut() {
                            let tail_ms = shared.audio_mts.load(Ordering::Relaxed);
                            if let Ok(Some(buf)) = active.flush(tail_ms) {
                                shared.qsw.force_push(buf);
                            }
                        }
                        break;
                    }
                }
            }
        }

        if idle {
            std::thread::sleep(STAGE_SLEEP);
        }
    }
    shared.swr_eof.store(true, Ordering::Relaxed);
    debug!("resample thread exit");
}

/// Render stage: derives the play position from the audio clock (or the
/// steady clock), pops due video frames, converts them and publishes the
/// latest image.
fn render_proc(shared: Arc<PlayerShared>, time_base: Rational, has_video: bool, audio_clock: bool) {
    debug!("render thread start");
    let mut converter = FrameConverter::new();

    while !shared.quit.load(Ordering::Relaxed) {
        if !shared.playing.load(Ordering::Relaxed) {
            std::thread::sleep(STAGE_SLEEP);
            continue;
        }

        let play_pos = if audio_clock {
            shared.audio_mts.load(Ordering::Relaxed) - shared.audio_offset.load(Ordering::Relaxed)
        } else if shared.after_seek.load(Ordering::Relaxed) {
            shared.seek_to_mts.load(Ordering::Relaxed)
        } else {
            let clock = shared.clock();
            let elapsed = clock
                .run_start
                .map(|t| t.elapsed().as_millis() as i64)
                .unwrap_or(0);
            elapsed + clock.pos_offset_ms - clock.paused_dur_ms
        };
        shared.play_pos.store(play_pos, Ordering::Relaxed);

        let mut vid_idle = true;
        if has_video {
            let head_pts = shared
                .qvf
                .peek_with(|f| f.pts().map(|p| to_millis(p, time_base)).unwrap_or(0));
            match head_pts {
                Some(pts_ms) => {
                    if shared.after_seek.load(Ordering::Relaxed) {
                        if !audio_clock {
                            let mut clock = shared.clock();
                            clock.run_start = Some(Instant::now());
                            clock.pos_offset_ms = shared.seek_to_mts.load(Ordering::Relaxed);
                            clock.paused_dur_ms = 0;
                        }
                        shared.after_seek.store(false, Ordering::Relaxed);
                    }
                    if play_pos >= pts_ms {
                        if let Some(frame) = shared.qvf.pop() {
                            match converter.convert(&frame, pts_ms as f64 / 1000.0) {
                                Ok(mat) => shared.publish_video(mat),
                                Err(e) => warn!(error = %e, "frame conversion failed"),
                            }
                            vid_idle = false;
                        }
                    }
                }
                None => {
                    let video_done = shared.viddec_eof.load(Ordering::Relaxed);
                    let audio_done = !audio_clock
                        || (shared.swr_eof.load(Ordering::Relaxed) && shared.qsw.is_empty());
                    if video_done && audio_done {
                        shared.render_eof.store(true, Ordering::Relaxed);
                    }
                }
            }
        } else {
            let audio_done =
                shared.swr_eof.load(Ordering::Relaxed) && shared.qsw.is_empty();
            if audio_done {
                shared.render_eof.store(true, Ordering::Relaxed);
            }
        }

        if vid_idle {
            std::thread::sleep(RENDER_SLEEP);
        }
    }
    debug!("render thread exit");
}

/// Scrub demuxer: keeps a `[seek_pos0, seek_pos1)` key-frame window (in
/// video stream pts) around the target and streams packets inside it. The
/// window only moves when the target leaves it.
fn scrub_demux_proc(
    shared: Arc<PlayerShared>,
    url: PathBuf,
    video_stream: usize,
    time_base: Rational,
) {
    debug!("scrub demux thread start");
    let mut demuxer = match Demuxer::open(&url) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "scrub demux failed to open input");
            return;
        }
    };

    let mut seek_pos0 = i64::MAX;
    let mut seek_pos1 = i64::MIN;
    let mut probed_target: Option<i64> = None;
    let mut pending: Option<ffmpeg::Packet> = None;

    while !shared.quit.load(Ordering::Relaxed) {
        let mut idle = true;

        let target = shared.async_seek_pos.load(Ordering::Relaxed);
        if target == i64::MIN {
            std::thread::sleep(STAGE_SLEEP);
            continue;
        }

        let vid_seek_pos = from_millis(target, time_base);
        let outside = vid_seek_pos < seek_pos0 || vid_seek_pos >= seek_pos1;
        if outside && probed_target != Some(vid_seek_pos) {
            pending = None;

            // upper bound: the next key frame strictly after the target
            seek_pos1 = match demuxer.seek_file(
                Some(video_stream),
                vid_seek_pos + 1,
                vid_seek_pos + 1,
                i64::MAX,
            ) {
                Ok(()) => read_next_stream_pts(&mut demuxer, video_stream).unwrap_or(i64::MAX),
                Err(_) => i64::MAX,
            };

            // lower bound: the key frame at or before the target; its
            // packet is also the first one streamed
            if let Err(e) =
                demuxer.seek_file(Some(video_stream), i64::MIN, vid_seek_pos, vid_seek_pos)
            {
                error!(error = %e, "scrub window seek failed");
                break;
            }
            match read_next_stream_packet(&mut demuxer, video_stream) {
                Some(packet) => {
                    seek_pos0 = packet.pts().unwrap_or(i64::MIN);
                    pending = Some(packet);
                }
                None => seek_pos0 = i64::MIN,
            }
            probed_target = Some(vid_seek_pos);
            debug!(
                target,
                seek_pos0,
                seek_pos1,
                "scrub window updated"
            );
        }

        let packet = match pending.take() {
            Some(p) => Some(p),
            None => demuxer.read_packet().ok().flatten(),
        };
        match packet {
            Some(packet) if packet.stream() == video_stream => {
                let in_window = packet.pts().is_some_and(|p| p < seek_pos1);
                if in_window {
                    match shared.qvp.try_push(packet) {
                        Ok(()) => idle = false,
                        Err(back) => pending = Some(back),
                    }
                } else {
                    // past the window: hold until the target moves
                    pending = Some(packet);
                }
            }
            Some(_) => {}
            None => {
                // file tail exhausted; wait for the target to move
            }
        }

        if idle {
            std::thread::sleep(STAGE_SLEEP);
        }
    }
    debug!("scrub demux thread exit");
}

fn read_next_stream_pts(demuxer: &mut Demuxer, stream: usize) -> Option<i64> {
    read_next_stream_packet(demuxer, stream).and_then(|p| p.pts())
}

fn read_next_stream_packet(demuxer: &mut Demuxer, stream: usize) -> Option<ffmpeg::Packet> {
    loop {
        match demuxer.read_packet() {
            Ok(Some(packet)) if packet.stream() == stream => return Some(packet),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Scrub renderer: converts decoded frames into a bounded timestamp cache
/// and snaps the published image to the entry nearest the target.
fn scrub_render_proc(shared: Arc<PlayerShared>, time_base: Rational) {
    debug!("scrub render thread start");
    let mut converter = FrameConverter::new();
    let mut cache = ScrubFrameCache::new();
    let mut prev_target = i64::MIN;

    while !shared.quit.load(Ordering::Relaxed) {
        let mut idle = true;
        let target = shared.async_seek_pos.load(Ordering::Relaxed);

        let mut cache_updated = false;
        while let Some(frame) = shared.qvf.pop() {
            let pts_ms = frame
                .pts()
                .map(|p| to_millis(p, time_base))
                .unwrap_or(0);
            if !cache.accepts(pts_ms) {
                continue;
            }
            match converter.convert(&frame, pts_ms as f64 / 1000.0) {
                Ok(mat) => cache_updated |= cache.insert(mat, target),
                Err(e) => warn!(error = %e, "scrub frame conversion failed"),
            }
        }

        if target != i64::MIN && (target != prev_target || cache_updated) {
            if let Some(mat) = cache.nearest(target) {
                shared.publish_video(mat.clone());
            }
            shared.play_pos.store(target, Ordering::Relaxed);
            prev_target = target;
            idle = false;
        }

        if idle {
            std::thread::sleep(RENDER_SLEEP);
        }
    }
    debug!("scrub render thread exit");
}

#[cfg(test)]
mod tests {
    use super::{PlayMode, Player};
    use montage_media::error::Error;

    #[test]
    fn control_calls_require_an_open_media() {
        let mut player = Player::new();
        assert!(matches!(player.play(), Err(Error::NotOpened)));
        assert!(matches!(player.pause(), Err(Error::NotOpened)));
        assert!(matches!(player.reset(), Err(Error::NotOpened)));
        assert!(matches!(player.seek(0, false), Err(Error::NotOpened)));
        assert!(matches!(player.seek_async(0), Err(Error::NotOpened)));
        assert!(matches!(player.quit_seek_async(), Err(Error::NotOpened)));
    }

    #[test]
    fn fresh_player_reports_idle_state() {
        let player = Player::new();
        assert!(!player.is_opened());
        assert!(!player.is_playing());
        assert!(!player.is_seeking());
        assert_eq!(player.play_pos(), 0);
        assert_eq!(player.duration_ms(), 0);
        assert!(player.current_video().is_empty());
    }

    #[test]
    fn play_mode_is_configurable_while_closed() {
        let mut player = Player::new();
        player.set_play_mode(PlayMode::AudioOnly).expect("closed");
        player.set_play_mode(PlayMode::Normal).expect("closed");
    }

    #[test]
    fn open_missing_file_fails_cleanly() {
        let mut player = Player::new();
        let result = player.open(std::path::Path::new("/nonexistent/media.mp4"));
        assert!(result.is_err());
        assert!(!player.is_opened());
    }
}
