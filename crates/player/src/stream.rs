use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use montage_audio::ByteStream;
use montage_media::frame::PcmBuf;
use montage_media::queue::BoundedQueue;

/// The player's pull stream for the audio device: drains the resampled
/// queue into the device buffer, carries a partial frame across calls and
/// publishes the consumed position as the audio clock.
pub struct PlayerByteStream {
    queue: Arc<BoundedQueue<PcmBuf>>,
    cursor: Mutex<Cursor>,
    audio_mts: Arc<AtomicI64>,
}

#[derive(Default)]
struct Cursor {
    current: Option<PcmBuf>,
    /// Samples (not frames) already consumed from `current`.
    consumed: usize,
}

impl PlayerByteStream {
    pub fn new(queue: Arc<BoundedQueue<PcmBuf>>, audio_mts: Arc<AtomicI64>) -> Self {
        Self {
            queue,
            cursor: Mutex::new(Cursor::default()),
            audio_mts,
        }
    }

    /// Drops the partial frame; called on every flush/seek.
    pub fn reset(&self) {
        let mut cursor = match self.cursor.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        cursor.current = None;
        cursor.consumed = 0;
    }

    fn publish_position(&self, buf: &PcmBuf, consumed_samples: usize) {
        if buf.channels == 0 || buf.sample_rate == 0 {
            return;
        }
        let consumed_frames = consumed_samples / buf.channels as usize;
        let offset_ms = consumed_frames as i64 * 1000 / i64::from(buf.sample_rate);
        self.audio_mts
            .store(buf.timestamp_ms + offset_ms, Ordering::Relaxed);
    }
}

impl ByteStream for PlayerByteStream {
    fn read(&self, buf: &mut [f32], blocking: bool) -> usize {
        let mut guard = match self.cursor.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cursor: &mut Cursor = &mut guard;

        let mut written = 0;
        while written < buf.len() {
            if cursor.current.is_none() {
                match self.queue.pop() {
                    Some(next) => {
                        cursor.current = Some(next);
                        cursor.consumed = 0;
                    }
                    None if blocking => {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    None => break,
                }
            }

            let Some(current) = cursor.current.as_ref() else {
                break;
            };
            let available = current.samples.len() - cursor.consumed;
            let take = available.min(buf.len() - written);
            buf[written..written + take]
                .copy_from_slice(&current.samples[cursor.consumed..cursor.consumed + take]);
            written += take;
            cursor.consumed += take;

            self.publish_position(current, cursor.consumed);
            if cursor.consumed >= current.samples.len() {
                cursor.current = None;
                cursor.consumed = 0;
            }
        }

        written
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    use montage_audio::ByteStream;
    use montage_media::frame::PcmBuf;
    use montage_media::queue::BoundedQueue;

    use super::PlayerByteStream;

    fn pcm(timestamp_ms: i64, samples: Vec<f32>) -> PcmBuf {
        PcmBuf {
            samples,
            channels: 2,
            sample_rate: 1000,
            timestamp_ms,
        }
    }

    fn stream() -> (PlayerByteStream, Arc<BoundedQueue<PcmBuf>>, Arc<AtomicI64>) {
        let queue = Arc::new(BoundedQueue::new(8));
        let mts = Arc::new(AtomicI64::new(0));
        (
            PlayerByteStream::new(queue.clone(), mts.clone()),
            queue,
            mts,
        )
    }

    #[test]
    fn empty_queue_returns_short_read() {
        let (stream, _queue, _mts) = stream();
        let mut buf = [1.0f32; 4];
        assert_eq!(stream.read(&mut buf, false), 0);
    }

    #[test]
    fn partial_frame_survives_across_calls() {
        let (stream, queue, _mts) = stream();
        queue
            .try_push(pcm(0, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]))
            .ok()
            .expect("push");

        let mut first = [0.0f32; 4];
        assert_eq!(stream.read(&mut first, false), 4);
        assert_eq!(first, [0.1, 0.2, 0.3, 0.4]);

        let mut second = [0.0f32; 4];
        assert_eq!(stream.read(&mut second, false), 2);
        assert_eq!(&second[..2], &[0.5, 0.6]);
    }

    #[test]
    fn consumed_position_becomes_audio_clock() {
        let (stream, queue, mts) = stream();
        // 2 channels at 1 kHz: 2 samples = 1 frame = 1 ms
        queue
            .try_push(pcm(500, vec![0.0; 8]))
            .ok()
            .expect("push");

        let mut buf = [0.0f32; 4];
        stream.read(&mut buf, false);
        assert_eq!(mts.load(Ordering::Relaxed), 502);
    }

    #[test]
    fn reset_drops_partial_frame() {
        let (stream, queue, _mts) = stream();
        queue.try_push(pcm(0, vec![0.9; 6])).ok().expect("push");
        let mut buf = [0.0f32; 2];
        stream.read(&mut buf, false);
        stream.reset();
        assert_eq!(stream.read(&mut buf, false), 0);
    }
}
