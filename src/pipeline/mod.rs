//! Decode → re-encode → mux pipeline: one [`DecoderSlot`] per recovered RTP
//! identity, owning its own decoder, encoder, and output container. See
//! spec.md §3 ("Decoder slot") and SPEC_FULL.md §4.7.
//!
//! This binds `ffmpeg-next` directly rather than through `video-rs`'s
//! file-oriented `Decoder`/`Encoder` API, because the input codec context
//! here is built from scratch (a codec id plus SDP-derived extradata) and
//! fed one access unit at a time, not demuxed from a file. The construction
//! sequence (raw context → open decoder/encoder → `add_stream` →
//! `set_parameters` → `write_header`/`write_trailer`) follows
//! `oddity-ai-video-rs`'s `encode.rs`/`decode.rs`.

mod ffi;

use std::collections::VecDeque;
use std::path::PathBuf;

use ffmpeg_next as ffmpeg;
use ffmpeg::codec::Id as AvCodecId;
use ffmpeg::util::error::EAGAIN;
use ffmpeg::Error as AvError;

use crate::codec::{AccessUnit, Depacketizer, NewDepacketizerError};
use crate::reassembler::{Reassembler, SeqAdvance, Skipped};
use crate::rtp;
use crate::sdp::{MediaType, SdpMedia};

/// Maximum number of decoded frames buffered while waiting to learn enough
/// about the stream (width/height, sample rate) to open the output stream.
/// Past this, the default codec is forced so the stream can open with
/// whatever's known so far (spec.md §4.7).
const FRAME_BUFFER_LIMIT: usize = 100;

const RTP_SEQ_BITS: u32 = 16;
const RTP_MAX_OUT_OF_ORDER: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("media section has neither video nor audio type")]
    UnknownMediaKind,
    #[error(transparent)]
    Depacketizer(#[from] NewDepacketizerError),
    #[error("no input decoder available for encoding {0:?}")]
    NoDecoderForEncoding(String),
    #[error("no decoder registered for codec {0:?}")]
    NoDecoder(AvCodecId),
    #[error("no encoder available, neither native nor default ({0:?})")]
    NoEncoder(AvCodecId),
    #[error("ffmpeg backend error: {0}")]
    Backend(#[from] ffmpeg::Error),
}

/// Everything a [`DecoderSlot`] needs that isn't derivable from the SDP
/// media section alone: where to write, and the fallback codecs/format from
/// the CLI configuration.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub output_path: PathBuf,
    pub format: String,
    pub default_video_codec: AvCodecId,
    pub default_audio_codec: AvCodecId,
    pub force_video_codec: bool,
    pub force_audio_codec: bool,
    /// Enables codec-internal frame threading on both the input decoder and
    /// output encoder contexts. Opaque to observable output (spec.md §5);
    /// mirrors `oddity-ai-video-rs::threading::ThreadingConfig::Auto`.
    pub fast: bool,
}

fn threading_config(fast: bool) -> ffmpeg::threading::Config {
    ffmpeg::threading::Config {
        kind: if fast {
            ffmpeg::threading::Type::Frame
        } else {
            ffmpeg::threading::Type::None
        },
        count: 0,
        safe: true,
    }
}

enum InputDecoder {
    Video(ffmpeg::decoder::Video),
    Audio(ffmpeg::decoder::Audio),
}

enum RawFrame {
    Video(ffmpeg::util::frame::video::Video),
    Audio(ffmpeg::util::frame::audio::Audio),
}

enum OutputEncoder {
    Video(ffmpeg::encoder::video::Video),
    Audio(ffmpeg::encoder::audio::Audio),
}

struct OutputStream {
    index: usize,
    encoder: OutputEncoder,
    encoder_time_base: ffmpeg::Rational,
}

/// Decodes one recovered RTP stream, re-encodes it, and muxes it into its
/// own output container. Owns a private [`Reassembler`] for RTP sequence
/// numbers, independent of the orchestrator's TCP-level ones.
pub struct DecoderSlot {
    kind: MediaKind,
    depacketizer: Depacketizer,
    reassembler: Reassembler<rtp::Packet>,
    input: InputDecoder,
    output: ffmpeg::format::context::Output,
    output_stream: Option<OutputStream>,
    pending: VecDeque<RawFrame>,
    wrote_header: bool,
    closed: bool,
    config: SlotConfig,
}

impl DecoderSlot {
    pub fn new(media: &SdpMedia, config: SlotConfig) -> Result<Self, SlotError> {
        let kind = match media.media_type {
            Some(MediaType::Video) => MediaKind::Video,
            Some(MediaType::Audio) => MediaKind::Audio,
            _ => return Err(SlotError::UnknownMediaKind),
        };
        let depacketizer = Depacketizer::new(media)?;

        let encoding = media.rtpmap_encoding.as_deref().unwrap_or("");
        let decoder_id = native_decoder_id(encoding)
            .ok_or_else(|| SlotError::NoDecoderForEncoding(encoding.to_string()))?;
        let codec = ffmpeg::decoder::find(decoder_id).ok_or(SlotError::NoDecoder(decoder_id))?;
        let mut ctx = ffmpeg::codec::context::Context::new_with_codec(codec);
        ctx.set_threading(threading_config(config.fast));
        if let Some(extradata) = depacketizer.extradata() {
            ffi::set_extradata(&mut ctx, extradata);
        }

        let input = match kind {
            MediaKind::Video => InputDecoder::Video(ctx.decoder().video()?),
            MediaKind::Audio => {
                if matches!(decoder_id, AvCodecId::PCM_ALAW | AvCodecId::PCM_MULAW) {
                    ffi::set_audio_params(
                        &mut ctx,
                        media.clock_rate.unwrap_or(8000),
                        media.channels.unwrap_or(1),
                    );
                }
                InputDecoder::Audio(ctx.decoder().audio()?)
            }
        };

        let output = ffmpeg::format::output_as(&config.output_path, &config.format)?;

        Ok(Self {
            kind,
            depacketizer,
            reassembler: Reassembler::new(RTP_SEQ_BITS, RTP_MAX_OUT_OF_ORDER, SeqAdvance::Packet),
            input,
            output,
            output_stream: None,
            pending: VecDeque::new(),
            wrote_header: false,
            closed: false,
            config,
        })
    }

    /// Feed one RTP packet through reassembly, depacketization, and
    /// decode/encode/mux. Errors at any stage are logged and do not
    /// propagate; a single bad packet must not abort the whole capture.
    pub fn process_packet(&mut self, pkt: rtp::Packet) {
        let seq = pkt.sequence_number as u64;
        let drained = self.reassembler.process(Some(pkt), seq);
        self.consume_drained(drained);
    }

    fn consume_drained(&mut self, drained: Vec<(Option<rtp::Packet>, Skipped)>) {
        for (item, skipped) in drained {
            let Some(item) = item else { continue };
            if skipped.0 {
                log::debug!(
                    "{}: RTP gap in decoder slot, decoding best-effort",
                    self.config.output_path.display()
                );
            }
            let units = self.depacketizer.handle_packet(Some(item));
            for au in units {
                self.decode_access_unit(au);
            }
        }
    }

    fn decode_access_unit(&mut self, au: AccessUnit) {
        if au.data.is_empty() {
            return;
        }
        let mut packet = ffmpeg::codec::packet::Packet::copy(&au.data);
        if let Some(timing) = au.timing {
            packet.set_pts(Some(timing.pts));
        }
        let send_result = match &mut self.input {
            InputDecoder::Video(d) => d.send_packet(&packet),
            InputDecoder::Audio(d) => d.send_packet(&packet),
        };
        if let Err(e) = send_result {
            log::warn!(
                "{}: decoder rejected access unit: {}",
                self.config.output_path.display(),
                e
            );
            return;
        }
        self.drain_decoded_frames();
    }

    fn drain_decoded_frames(&mut self) {
        loop {
            let frame = match &mut self.input {
                InputDecoder::Video(d) => {
                    let mut frame = ffmpeg::util::frame::video::Video::empty();
                    match d.receive_frame(&mut frame) {
                        Ok(()) => RawFrame::Video(frame),
                        Err(AvError::Other { errno }) if errno == EAGAIN => break,
                        Err(AvError::Eof) => break,
                        Err(e) => {
                            log::warn!(
                                "{}: decoder error: {}",
                                self.config.output_path.display(),
                                e
                            );
                            break;
                        }
                    }
                }
                InputDecoder::Audio(d) => {
                    let mut frame = ffmpeg::util::frame::audio::Audio::empty();
                    match d.receive_frame(&mut frame) {
                        Ok(()) => RawFrame::Audio(frame),
                        Err(AvError::Other { errno }) if errno == EAGAIN => break,
                        Err(AvError::Eof) => break,
                        Err(e) => {
                            log::warn!(
                                "{}: decoder error: {}",
                                self.config.output_path.display(),
                                e
                            );
                            break;
                        }
                    }
                }
            };
            self.handle_frame(frame);
        }
    }

    fn handle_frame(&mut self, frame: RawFrame) {
        if self.output_stream.is_none() {
            if self.frame_is_ready(&frame) {
                if let Err(e) = self.open_output_stream(&frame) {
                    log::error!(
                        "{}: failed to open output stream: {}",
                        self.config.output_path.display(),
                        e
                    );
                    return;
                }
                while let Some(buffered) = self.pending.pop_front() {
                    self.encode_frame(buffered);
                }
            } else if self.pending.len() >= FRAME_BUFFER_LIMIT {
                log::warn!(
                    "{}: {} frames buffered without learning stream parameters, forcing default codec",
                    self.config.output_path.display(),
                    FRAME_BUFFER_LIMIT
                );
                if let Err(e) = self.open_output_stream_forced(&frame) {
                    log::error!(
                        "{}: failed to open output stream with default codec: {}",
                        self.config.output_path.display(),
                        e
                    );
                    self.pending.push_back(frame);
                    return;
                }
                while let Some(buffered) = self.pending.pop_front() {
                    self.encode_frame(buffered);
                }
            } else {
                self.pending.push_back(frame);
                return;
            }
        }
        if self.output_stream.is_some() {
            self.encode_frame(frame);
        }
    }

    fn frame_is_ready(&self, frame: &RawFrame) -> bool {
        match frame {
            RawFrame::Video(f) => f.width() > 0 && f.height() > 0,
            RawFrame::Audio(f) => f.rate() > 0,
        }
    }

    fn open_output_stream(&mut self, frame: &RawFrame) -> Result<(), SlotError> {
        let native_id = match &self.input {
            InputDecoder::Video(d) => d.id(),
            InputDecoder::Audio(d) => d.id(),
        };
        let default_id = match self.kind {
            MediaKind::Video => self.config.default_video_codec,
            MediaKind::Audio => self.config.default_audio_codec,
        };
        let force_default = match self.kind {
            MediaKind::Video => self.config.force_video_codec,
            MediaKind::Audio => self.config.force_audio_codec,
        };
        let encoder_codec = if force_default {
            ffmpeg::encoder::find(default_id)
        } else {
            ffmpeg::encoder::find(native_id).or_else(|| ffmpeg::encoder::find(default_id))
        }
        .ok_or(SlotError::NoEncoder(default_id))?;
        self.build_output_stream(encoder_codec, frame)
    }

    fn open_output_stream_forced(&mut self, frame: &RawFrame) -> Result<(), SlotError> {
        let default_id = match self.kind {
            MediaKind::Video => self.config.default_video_codec,
            MediaKind::Audio => self.config.default_audio_codec,
        };
        let encoder_codec =
            ffmpeg::encoder::find(default_id).ok_or(SlotError::NoEncoder(default_id))?;
        self.build_output_stream(encoder_codec, frame)
    }

    fn build_output_stream(
        &mut self,
        codec: ffmpeg::codec::codec::Codec,
        frame: &RawFrame,
    ) -> Result<(), SlotError> {
        let global_header = self
            .output
            .format()
            .flags()
            .contains(ffmpeg::format::flag::Flags::GLOBAL_HEADER);

        // Video has no per-frame rate to read; fall back to whatever the
        // input decoder reports about the container's nominal frame rate,
        // clamped to a plausible range (spec.md §4.7).
        let input_frame_rate = match &self.input {
            InputDecoder::Video(d) => Some(d.frame_rate()),
            InputDecoder::Audio(_) => None,
        };

        let mut stream = self.output.add_stream(codec)?;
        let index = stream.index();
        let mut encoder_ctx = ffmpeg::codec::context::Context::new_with_codec(codec);
        encoder_ctx.set_threading(threading_config(self.config.fast));
        if global_header {
            encoder_ctx.set_flags(ffmpeg::codec::flag::Flags::GLOBAL_HEADER);
        }

        let (encoder, encoder_time_base) = match frame {
            RawFrame::Video(f) => {
                let mut enc = encoder_ctx.encoder().video()?;
                enc.set_width(f.width());
                enc.set_height(f.height());
                enc.set_format(f.format());
                let frame_rate = input_frame_rate
                    .flatten()
                    .filter(|r| r.denominator() != 0)
                    .map(|r| r.numerator() / r.denominator())
                    .filter(|fps| (1..120).contains(fps))
                    .unwrap_or_else(|| {
                        log::warn!(
                            "{}: no usable frame rate from decoder, defaulting to 30fps",
                            self.config.output_path.display()
                        );
                        30
                    });
                let time_base = ffmpeg::Rational::new(1, frame_rate);
                enc.set_time_base(time_base);
                enc.set_frame_rate(Some(ffmpeg::Rational::new(frame_rate, 1)));
                (
                    OutputEncoder::Video(enc.open_with(ffmpeg::Dictionary::new())?),
                    time_base,
                )
            }
            RawFrame::Audio(f) => {
                let mut enc = encoder_ctx.encoder().audio()?;
                enc.set_rate(f.rate() as i32);
                enc.set_format(f.format());
                enc.set_channel_layout(f.channel_layout());
                let time_base = ffmpeg::Rational::new(1, f.rate() as i32);
                enc.set_time_base(time_base);
                (
                    OutputEncoder::Audio(enc.open_with(ffmpeg::Dictionary::new())?),
                    time_base,
                )
            }
        };

        match &encoder {
            OutputEncoder::Video(e) => stream.set_parameters(e),
            OutputEncoder::Audio(e) => stream.set_parameters(e),
        }

        self.output_stream = Some(OutputStream {
            index,
            encoder,
            encoder_time_base,
        });
        Ok(())
    }

    fn encode_frame(&mut self, frame: RawFrame) {
        let Some(stream) = self.output_stream.as_mut() else {
            return;
        };
        let send_result = match (&mut stream.encoder, &frame) {
            (OutputEncoder::Video(e), RawFrame::Video(f)) => e.send_frame(f),
            (OutputEncoder::Audio(e), RawFrame::Audio(f)) => e.send_frame(f),
            _ => {
                log::warn!(
                    "{}: media kind mismatch between decoded frame and encoder",
                    self.config.output_path.display()
                );
                return;
            }
        };
        if let Err(e) = send_result {
            log::warn!(
                "{}: encoder rejected frame: {}",
                self.config.output_path.display(),
                e
            );
            return;
        }
        self.drain_encoded_packets();
    }

    fn drain_encoded_packets(&mut self) {
        if !self.wrote_header {
            if let Err(e) = self.output.write_header() {
                log::error!(
                    "{}: failed to write container header: {}",
                    self.config.output_path.display(),
                    e
                );
                return;
            }
            self.wrote_header = true;
        }
        let Some(stream) = self.output_stream.as_mut() else {
            return;
        };
        loop {
            let mut packet = ffmpeg::codec::packet::Packet::empty();
            let recv_result = match &mut stream.encoder {
                OutputEncoder::Video(e) => e.receive_packet(&mut packet),
                OutputEncoder::Audio(e) => e.receive_packet(&mut packet),
            };
            match recv_result {
                Ok(()) => {
                    packet.set_stream(stream.index);
                    packet.set_position(-1);
                    let out_time_base = self
                        .output
                        .stream(stream.index)
                        .map(|s| s.time_base())
                        .unwrap_or(stream.encoder_time_base);
                    packet.rescale_ts(stream.encoder_time_base, out_time_base);
                    if let Err(e) = self.output.write_interleaved(&mut packet) {
                        log::warn!(
                            "{}: failed to write packet: {}",
                            self.config.output_path.display(),
                            e
                        );
                    }
                }
                Err(AvError::Other { errno }) if errno == EAGAIN => break,
                Err(AvError::Eof) => break,
                Err(e) => {
                    log::warn!(
                        "{}: encoder error: {}",
                        self.config.output_path.display(),
                        e
                    );
                    break;
                }
            }
        }
    }

    /// Flush the depacketizer, decoder, and encoder in turn, then close the
    /// output container. Errors are logged by the caller; close always runs
    /// to completion on a best-effort basis (spec.md §5/§6).
    pub fn close(&mut self) -> Result<(), SlotError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let drained = self.reassembler.process(None, 0);
        self.consume_drained(drained);
        for au in self.depacketizer.handle_packet(None) {
            self.decode_access_unit(au);
        }

        let eof_result = match &mut self.input {
            InputDecoder::Video(d) => d.send_eof(),
            InputDecoder::Audio(d) => d.send_eof(),
        };
        if let Err(e) = eof_result {
            log::debug!(
                "{}: decoder send_eof: {}",
                self.config.output_path.display(),
                e
            );
        }
        self.drain_decoded_frames();
        if self.output_stream.is_none() {
            if let Some(first) = self.pending.pop_front() {
                if let Err(e) = self.open_output_stream_forced(&first) {
                    log::error!(
                        "{}: failed to open output stream at close: {}",
                        self.config.output_path.display(),
                        e
                    );
                }
                self.encode_frame(first);
                while let Some(buffered) = self.pending.pop_front() {
                    self.encode_frame(buffered);
                }
            }
        }

        if let Some(stream) = self.output_stream.as_mut() {
            let flush_result = match &mut stream.encoder {
                OutputEncoder::Video(e) => e.send_eof(),
                OutputEncoder::Audio(e) => e.send_eof(),
            };
            if let Err(e) = flush_result {
                log::debug!(
                    "{}: encoder send_eof: {}",
                    self.config.output_path.display(),
                    e
                );
            }
            self.drain_encoded_packets();
            if self.wrote_header {
                self.output.write_trailer()?;
            }
        } else {
            log::warn!(
                "{}: no output stream ever opened (no frame decoded); no file written",
                self.config.output_path.display()
            );
        }
        Ok(())
    }
}

/// Maps an SDP `a=rtpmap` encoding name to the ffmpeg decoder id that reads
/// its bitstream, per SPEC_FULL.md §4.5/§4.7 (mirrors `original_source`'s
/// `sdp_to_av.py::SDP_CODEC_TO_AV_CODEC`).
fn native_decoder_id(encoding_name: &str) -> Option<AvCodecId> {
    match encoding_name.to_ascii_lowercase().as_str() {
        "h264" => Some(AvCodecId::H264),
        "h265" => Some(AvCodecId::HEVC),
        "mp4v-es" => Some(AvCodecId::MPEG4),
        "mpeg4-generic" => Some(AvCodecId::AAC),
        "pcma" => Some(AvCodecId::PCM_ALAW),
        "pcmu" => Some(AvCodecId::PCM_MULAW),
        _ => None,
    }
}

/// Parses a user-facing default-codec name (CLI `--default-vcodec`/
/// `--default-acodec`) into an ffmpeg codec id.
pub fn parse_codec_name(name: &str) -> Option<AvCodecId> {
    match name.to_ascii_lowercase().as_str() {
        "h264" | "libx264" => Some(AvCodecId::H264),
        "h265" | "hevc" | "libx265" => Some(AvCodecId::HEVC),
        "mpeg4" | "mp4v-es" => Some(AvCodecId::MPEG4),
        "aac" => Some(AvCodecId::AAC),
        "mp3" | "libmp3lame" => Some(AvCodecId::MP3),
        "pcm_alaw" | "pcma" => Some(AvCodecId::PCM_ALAW),
        "pcm_mulaw" | "pcmu" => Some(AvCodecId::PCM_MULAW),
        _ => None,
    }
}

/// Container format names this crate has validated it can mux into; the
/// CLI rejects anything else up front rather than discovering it mid-run
/// (spec.md §6, fatal validation before processing starts).
pub const SUPPORTED_FORMATS: [&str; 4] = ["mp4", "mov", "mkv", "matroska"];
