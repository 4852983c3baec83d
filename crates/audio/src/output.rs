use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat};
use montage_media::error::{Error, Result};
use tracing::{info, warn};

/// PCM sample layout the engine renders in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmFormat {
    F32,
}

/// Pull seam between the audio device and the player: the device callback
/// asks for interleaved `f32` samples whenever it needs more.
///
/// `read` fills as much of `buf` as it can and returns the number of
/// samples written; with `blocking` unset an empty pipeline produces a
/// short read and the device plays silence for the remainder.
pub trait ByteStream: Send + Sync {
    fn read(&self, buf: &mut [f32], blocking: bool) -> usize;
}

/// The audio output device consumed by the player. The device is
/// authoritative for the play clock: the byte stream publishes the
/// timestamp of the last frame it handed over.
pub trait AudioRender {
    fn open_device(
        &mut self,
        sample_rate: u32,
        channels: u16,
        format: PcmFormat,
        stream: Arc<dyn ByteStream>,
    ) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn close_device(&mut self);

    fn is_device_open(&self) -> bool;
}

/// cpal-backed output stream.
pub struct CpalAudioRender {
    stream: Option<cpal::Stream>,
}

impl Default for CpalAudioRender {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalAudioRender {
    pub fn new() -> Self {
        Self { stream: None }
    }
}

impl AudioRender for CpalAudioRender {
    fn open_device(
        &mut self,
        sample_rate: u32,
        channels: u16,
        format: PcmFormat,
        stream: Arc<dyn ByteStream>,
    ) -> Result<()> {
        let PcmFormat::F32 = format;
        if self.stream.is_some() {
            return Err(Error::InvalidState("audio device already open".to_string()));
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::not_found("default audio output device".to_string()))?;
        let sample_format = device
            .default_output_config()
            .map(|c| c.sample_format())
            .unwrap_or(SampleFormat::F32);
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let out_stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, stream)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config, stream)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, stream)?,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported device sample format {other}"
                )));
            }
        };
        // the stream starts paused; playback begins on resume()
        out_stream
            .pause()
            .map_err(|e| Error::InvalidState(format!("failed to pause audio stream: {e}")))?;

        info!(sample_rate, channels, "audio device opened");
        self.stream = Some(out_stream);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::InvalidState("audio device is not open".to_string()))?;
        stream
            .play()
            .map_err(|e| Error::InvalidState(format!("failed to resume audio stream: {e}")))
    }

    fn pause(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::InvalidState("audio device is not open".to_string()))?;
        stream
            .pause()
            .map_err(|e| Error::InvalidState(format!("failed to pause audio stream: {e}")))
    }

    fn flush(&mut self) -> Result<()> {
        // nothing buffered on the device side; the byte stream owns all
        // queued PCM and is flushed by the player
        Ok(())
    }

    fn close_device(&mut self) {
        self.stream = None;
    }

    fn is_device_open(&self) -> bool {
        self.stream.is_some()
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    byte_stream: Arc<dyn ByteStream>,
) -> Result<cpal::Stream>
where
    T: Sample + FromSample<f32> + cpal::SizedSample,
{
    let err_fn = |err| {
        warn!(error = %err, "audio stream error");
    };

    let mut pull_buf: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                pull_buf.resize(data.len(), 0.0);
                let produced = byte_stream.read(&mut pull_buf, false);
                for sample in &mut pull_buf[produced..] {
                    *sample = 0.0;
                }
                for (out, sample) in data.iter_mut().zip(pull_buf.iter()) {
                    *out = T::from_sample(*sample);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::InvalidState(format!("failed to build audio output stream: {e}")))
}
