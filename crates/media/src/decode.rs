use std::ptr;

use ffmpeg::ffi::{
    AVBufferRef, AVCodecContext, AVHWDeviceType, AVPixelFormat,
    AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX, av_buffer_ref, av_buffer_unref,
    av_hwdevice_ctx_create, av_hwdevice_get_type_name, avcodec_find_decoder,
    avcodec_get_hw_config,
};
use ffmpeg_the_third as ffmpeg;
use libc::EAGAIN;
use tracing::{info, warn};

use crate::demux::init_once;
use crate::error::{Error, Result};

/// Outcome of polling a decoder for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePoll {
    /// A frame was written into the caller's buffer.
    Frame,
    /// The decoder needs more input.
    Again,
    /// The decoder has been fully drained.
    Eof,
}

/// Hardware session attached to an opened video decoder: the device
/// context reference and the pixel-format choice leaked into the codec
/// context's opaque for the `get_format` callback.
struct HwSession {
    device_ref: *mut AVBufferRef,
    chosen_fmt: *mut AVPixelFormat,
}

unsafe impl Send for HwSession {}

impl Drop for HwSession {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.device_ref);
            drop(Box::from_raw(self.chosen_fmt));
        }
    }
}

unsafe extern "C" fn choose_hw_pix_fmt(
    ctx: *mut AVCodecContext,
    list: *const AVPixelFormat,
) -> AVPixelFormat {
    let wanted = (*ctx).opaque as *const AVPixelFormat;
    if !wanted.is_null() {
        let mut cursor = list;
        while *cursor != AVPixelFormat::AV_PIX_FMT_NONE {
            if *cursor == *wanted {
                return *cursor;
            }
            cursor = cursor.add(1);
        }
    }
    // the wanted format is not offered; take whatever the decoder proposes
    *list
}

/// Video decoder front end. `send_packet`/`poll_frame` mirror the codec's
/// own push/pull protocol; frames come out in presentation order for the
/// decoders this engine selects.
pub struct VideoDecoder {
    decoder: ffmpeg::decoder::Video,
    hw: Option<HwSession>,
}

impl VideoDecoder {
    /// Opens a decoder for the given stream parameters. With `prefer_hw`
    /// set, every hardware config the codec advertises is tried first and
    /// a failure falls back to the software path.
    pub fn open(params: ffmpeg::codec::Parameters, prefer_hw: bool) -> Result<Self> {
        init_once();
        if prefer_hw {
            match Self::open_hw(params.clone()) {
                Ok(decoder) => return Ok(decoder),
                Err(e) => {
                    warn!(error = %e, "hardware decoder unavailable, falling back to software");
                }
            }
        }
        Self::open_sw(params)
    }

    fn open_sw(params: ffmpeg::codec::Parameters) -> Result<Self> {
        let ctx = ffmpeg::codec::context::Context::from_parameters(params)?;
        let decoder = ctx
            .decoder()
            .video()
            .map_err(|e| Error::DecoderUnavailable(e.to_string()))?;
        Ok(Self { decoder, hw: None })
    }

    fn open_hw(params: ffmpeg::codec::Parameters) -> Result<Self> {
        let codec = unsafe { avcodec_find_decoder((*params.as_ptr()).codec_id) };
        if codec.is_null() {
            return Err(Error::DecoderUnavailable(format!("{:?}", params.id())));
        }

        let mut hw_pix_fmt = AVPixelFormat::AV_PIX_FMT_NONE;
        let mut device_type = AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;
        let mut index = 0;
        loop {
            let config = unsafe { avcodec_get_hw_config(codec, index) };
            if config.is_null() {
                break;
            }
            let config = unsafe { &*config };
            if (config.methods as u32 & AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as u32) != 0 {
                hw_pix_fmt = config.pix_fmt;
                device_type = config.device_type;
                break;
            }
            index += 1;
        }
        if hw_pix_fmt == AVPixelFormat::AV_PIX_FMT_NONE {
            return Err(Error::HwUnavailable(
                "codec advertises no hardware device configs".into(),
            ));
        }

        let mut device_ref: *mut AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            av_hwdevice_ctx_create(&mut device_ref, device_type, ptr::null(), ptr::null_mut(), 0)
        };
        if ret < 0 {
            return Err(Error::HwUnavailable(format!(
                "failed to create hardware device context: {}",
                ffmpeg::Error::from(ret)
            )));
        }
        let session = HwSession {
            device_ref,
            chosen_fmt: Box::into_raw(Box::new(hw_pix_fmt)),
        };

        let mut ctx = ffmpeg::codec::context::Context::from_parameters(params)?;
        unsafe {
            let raw = ctx.as_mut_ptr();
            (*raw).opaque = session.chosen_fmt as *mut _;
            (*raw).get_format = Some(choose_hw_pix_fmt);
            (*raw).hw_device_ctx = av_buffer_ref(session.device_ref);
        }

        let decoder = ctx
            .decoder()
            .video()
            .map_err(|e| Error::HwUnavailable(e.to_string()))?;

        let type_name = unsafe {
            let name = av_hwdevice_get_type_name(device_type);
            if name.is_null() {
                "unknown".to_string()
            } else {
                std::ffi::CStr::from_ptr(name).to_string_lossy().into_owned()
            }
        };
        info!(device = %type_name, "hardware video decoder opened");

        Ok(Self {
            decoder,
            hw: Some(session),
        })
    }

    pub fn is_hw(&self) -> bool {
        self.hw.is_some()
    }

    pub fn width(&self) -> u32 {
        self.decoder.width()
    }

    pub fn height(&self) -> u32 {
        self.decoder.height()
    }

    /// Feeds one packet; `Ok(false)` means the decoder's input is full and
    /// the packet must be retried after draining output.
    pub fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<bool> {
        match self.decoder.send_packet(packet) {
            Ok(()) => Ok(true),
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => Ok(false),
            Err(e) => Err(Error::Media(e)),
        }
    }

    /// Signals end of input so the decoder drains its remaining frames.
    pub fn send_eof(&mut self) -> Result<()> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(Error::Media(e)),
        }
    }

    pub fn poll_frame(&mut self, frame: &mut ffmpeg::frame::Video) -> Result<DecodePoll> {
        match self.decoder.receive_frame(frame) {
            Ok(()) => Ok(DecodePoll::Frame),
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => Ok(DecodePoll::Again),
            Err(ffmpeg::Error::Eof) => Ok(DecodePoll::Eof),
            Err(e) => Err(Error::Media(e)),
        }
    }

    /// Drops all buffered frames; required after a demuxer seek.
    pub fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// Audio decoder front end (software only).
pub struct AudioDecoder {
    decoder: ffmpeg::decoder::Audio,
}

impl AudioDecoder {
    pub fn open(params: ffmpeg::codec::Parameters) -> Result<Self> {
        init_once();
        let ctx = ffmpeg::codec::context::Context::from_parameters(params)?;
        let decoder = ctx
            .decoder()
            .audio()
            .map_err(|e| Error::DecoderUnavailable(e.to_string()))?;
        Ok(Self { decoder })
    }

    pub fn sample_rate(&self) -> u32 {
        self.decoder.rate()
    }

    pub fn format(&self) -> ffmpeg::format::Sample {
        self.decoder.format()
    }

    pub fn ch_layout(&self) -> ffmpeg::ChannelLayout<'static> {
        ffmpeg::ChannelLayout::from(self.decoder.ch_layout().into_owned())
    }

    pub fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<bool> {
        match self.decoder.send_packet(packet) {
            Ok(()) => Ok(true),
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => Ok(false),
            Err(e) => Err(Error::Media(e)),
        }
    }

    pub fn send_eof(&mut self) -> Result<()> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(Error::Media(e)),
        }
    }

    pub fn poll_frame(&mut self, frame: &mut ffmpeg::frame::Audio) -> Result<DecodePoll> {
        match self.decoder.receive_frame(frame) {
            Ok(()) => Ok(DecodePoll::Frame),
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => Ok(DecodePoll::Again),
            Err(ffmpeg::Error::Eof) => Ok(DecodePoll::Eof),
            Err(e) => Err(Error::Media(e)),
        }
    }

    pub fn flush(&mut self) {
        self.decoder.flush();
    }
}
