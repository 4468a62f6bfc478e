//! Codec-specific RTP depacketization.
//!
//! Turns RTP packets carrying one codec's payload format into codec-native
//! access units ready for an input codec context to decode. See
//! SPEC_FULL.md §4.5.

use bytes::Bytes;

pub mod aac;
pub mod h264;
pub mod h265;
pub mod mp4v;
pub mod simple_audio;

/// Per-access-unit timing supplement produced only by depacketizers that can
/// emit more than one access unit per RTP packet (AAC multi-AU payloads).
/// `pts` is in the media clock rate's units; `au_index` counts from zero
/// within the packet that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTiming {
    pub pts: i64,
    pub au_index: u32,
}

#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub timing: Option<SampleTiming>,
}

impl AccessUnit {
    fn plain(data: Bytes) -> Self {
        Self { data, timing: None }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NewDepacketizerError {
    #[error("no depacketizer for media/encoding {0}/{1}")]
    Unsupported(String, String),
    #[error("missing required fmtp parameter {0:?}")]
    MissingFmtp(&'static str),
    #[error("malformed fmtp parameter {0:?}: {1}")]
    BadFmtp(&'static str, String),
}

/// Turns a stream of RTP packets into codec-native access units.
#[derive(Debug)]
pub struct Depacketizer(Inner);

#[derive(Debug)]
enum Inner {
    H264(h264::Depacketizer),
    H265(h265::Depacketizer),
    Mp4v(mp4v::Depacketizer),
    Aac(aac::Depacketizer),
    SimpleAudio(simple_audio::Depacketizer),
}

impl Depacketizer {
    /// Builds the depacketizer for one SDP media section, dispatching on its
    /// media type (`"video"`/`"audio"`) and `a=rtpmap` encoding name
    /// (matched case-insensitively).
    pub fn new(media: &crate::sdp::SdpMedia) -> Result<Self, NewDepacketizerError> {
        let kind = match &media.media_type {
            Some(crate::sdp::MediaType::Video) => "video",
            Some(crate::sdp::MediaType::Audio) => "audio",
            _ => "",
        };
        let enc = media
            .rtpmap_encoding
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase();
        let clock_rate = media.clock_rate.unwrap_or(90_000);
        let channels = media.channels;
        let fmtp = &media.fmtp;
        Ok(Depacketizer(match (kind, enc.as_str()) {
            ("video", "h264") => Inner::H264(h264::Depacketizer::new(fmtp)?),
            ("video", "h265") => Inner::H265(h265::Depacketizer::new(fmtp, parse_framesize(media))?),
            ("video", "mp4v-es") => Inner::Mp4v(mp4v::Depacketizer::new(fmtp)?),
            ("audio", "mpeg4-generic") => {
                Inner::Aac(aac::Depacketizer::new(clock_rate, channels, fmtp)?)
            }
            ("audio", "pcma") | ("audio", "pcmu") => {
                Inner::SimpleAudio(simple_audio::Depacketizer::new(clock_rate, channels))
            }
            (kind, enc) => {
                return Err(NewDepacketizerError::Unsupported(
                    kind.to_string(),
                    enc.to_string(),
                ))
            }
        }))
    }

    /// Extradata to install on the input codec context before decoding any
    /// access unit, if the codec derives it from SDP parameters.
    pub fn extradata(&self) -> Option<&Bytes> {
        match &self.0 {
            Inner::H264(d) => Some(d.extradata()),
            Inner::H265(d) => Some(d.extradata()),
            Inner::Mp4v(d) => Some(d.extradata()),
            Inner::Aac(d) => Some(d.extradata()),
            Inner::SimpleAudio(_) => None,
        }
    }

    /// Width/height known ahead of decoding any frame, if the codec can
    /// derive it from SDP alone (HEVC's `a=framesize`, SPEC_FULL.md §3).
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match &self.0 {
            Inner::H265(d) => d.dimensions(),
            _ => None,
        }
    }

    /// Feed one RTP packet, or `None` to flush any buffered partial access
    /// unit. Returns the access units that became ready as a result.
    pub fn handle_packet(&mut self, pkt: Option<crate::rtp::Packet>) -> Vec<AccessUnit> {
        match &mut self.0 {
            Inner::H264(d) => d.handle_packet(pkt),
            Inner::H265(d) => d.handle_packet(pkt),
            Inner::Mp4v(d) => d.handle_packet(pkt),
            Inner::Aac(d) => d.handle_packet(pkt),
            Inner::SimpleAudio(d) => d.handle_packet(pkt),
        }
    }
}

pub(crate) const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];
pub(crate) const H264_PADDING_SIZE: usize = 64;

/// Appends `00 00 00 01` + `data` + 64 zero padding bytes, the convention
/// this crate's H.264/H.265 extradata construction uses
/// (`ff_h264_parse_sprop_parameter_sets`-style padding).
pub(crate) fn push_annexb_padded(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&ANNEX_B_START_CODE);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(0u8).take(H264_PADDING_SIZE));
}

/// Appends `00 00 00 01` + `data` only, no padding — used for per-packet NAL
/// emission where trailing padding bytes would corrupt the bitstream.
pub(crate) fn push_annexb(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&ANNEX_B_START_CODE);
    out.extend_from_slice(data);
}

/// Splits a `;`-joined `key=value` fmtp "config"-style list that has
/// already been pulled out of an individual fmtp entry (used for parsing
/// nested comma-separated base64 lists like `sprop-parameter-sets`).
pub(crate) fn split_commas(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(|s| s.trim()).filter(|s| !s.is_empty())
}

/// Parses a `framesize` attribute value of the form `"<pt> <w>-<h>"`.
fn parse_framesize(media: &crate::sdp::SdpMedia) -> Option<(u32, u32)> {
    let value = media.attribute("framesize")?;
    let (_, dims) = value.split_once(' ')?;
    let (w, h) = dims.split_once('-')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}
