//! Minimal SDP (RFC 4566) parser.
//!
//! Only the fields this crate needs are modeled: the attributes relevant to
//! locating a track's RTP payload type, codec name, clock rate, and
//! format-specific parameters. Unrecognized `a=` lines are kept verbatim in
//! [`SdpMedia::attributes`] so codec-specific or non-standard lines (e.g.
//! HEVC's `a=framesize`) can still be consulted. See SPEC_FULL.md §3.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Application,
    Other(String),
}

impl From<&str> for MediaType {
    fn from(s: &str) -> Self {
        match s {
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            "application" => MediaType::Application,
            other => MediaType::Other(other.to_string()),
        }
    }
}

/// One `m=` section and the attribute lines under it, up to the next `m=`
/// or end of the session description.
#[derive(Debug, Clone, Default)]
pub struct SdpMedia {
    pub media_type: Option<MediaType>,
    /// The payload type number from the `m=` line (the first one, if the
    /// line lists several).
    pub payload_type: Option<u8>,
    /// `a=rtpmap:<pt> <encoding>/<clock-rate>[/<channels>]`, parsed.
    pub rtpmap_encoding: Option<String>,
    pub clock_rate: Option<u32>,
    pub channels: Option<u16>,
    /// `a=fmtp:<pt> <key>=<value>; <key>=<value>...`, split into a map.
    pub fmtp: HashMap<String, String>,
    /// `a=control:<value>`.
    pub control: Option<String>,
    /// Every `a=<name>[:<value>]` line, in source order, including ones
    /// already decoded above, for codec-specific catch-all lookups.
    pub attributes: Vec<(String, String)>,
}

impl SdpMedia {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, thiserror::Error)]
pub enum SdpError {
    #[error("no m= line found before end of description")]
    NoMediaSections,
}

/// Parse a full session description body (the bytes after RTSP/HTTP
/// headers, decoded as UTF-8-ish ASCII text). Lines may be separated by
/// `\r\n` or bare `\n`; malformed individual lines are skipped rather than
/// aborting the whole parse, since unrelated session-level lines (`v=`,
/// `o=`, `s=`, `t=`, `c=` at the session level, etc.) are not modeled here
/// and are simply not media-specific.
pub fn parse(body: &str) -> Result<SessionDescription, SdpError> {
    let mut media = Vec::new();
    let mut current: Option<SdpMedia> = None;

    for raw_line in body.lines() {
        let line = raw_line.trim_end_matches('\r');
        if line.len() < 2 || line.as_bytes()[1] != b'=' {
            continue;
        }
        let kind = line.as_bytes()[0] as char;
        let value = &line[2..];

        match kind {
            'm' => {
                if let Some(m) = current.take() {
                    media.push(m);
                }
                let mut m = SdpMedia::default();
                let mut fields = value.split_whitespace();
                if let Some(media_type) = fields.next() {
                    m.media_type = Some(MediaType::from(media_type));
                }
                let _port = fields.next();
                let _proto = fields.next();
                if let Some(pt) = fields.next() {
                    m.payload_type = pt.parse().ok();
                }
                current = Some(m);
            }
            'a' => {
                let (name, val) = match value.split_once(':') {
                    Some((n, v)) => (n, v),
                    None => (value, ""),
                };
                if let Some(m) = current.as_mut() {
                    m.attributes.push((name.to_string(), val.to_string()));
                    match name {
                        "rtpmap" => parse_rtpmap(m, val),
                        "fmtp" => parse_fmtp(m, val),
                        "control" => m.control = Some(val.to_string()),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(m) = current.take() {
        media.push(m);
    }
    if media.is_empty() {
        return Err(SdpError::NoMediaSections);
    }
    Ok(SessionDescription { media })
}

fn parse_rtpmap(m: &mut SdpMedia, val: &str) {
    // "<pt> <encoding>/<clock-rate>[/<channels>]"
    let mut parts = val.splitn(2, ' ');
    let _pt = parts.next();
    let Some(rest) = parts.next() else { return };
    let mut seg = rest.split('/');
    if let Some(enc) = seg.next() {
        m.rtpmap_encoding = Some(enc.to_string());
    }
    if let Some(rate) = seg.next() {
        m.clock_rate = rate.parse().ok();
    }
    if let Some(ch) = seg.next() {
        m.channels = ch.parse().ok();
    }
}

fn parse_fmtp(m: &mut SdpMedia, val: &str) {
    // "<pt> <key>=<value>; <key>=<value> ..."
    let mut parts = val.splitn(2, ' ');
    let _pt = parts.next();
    let Some(params) = parts.next() else { return };
    for kv in params.split(';') {
        let kv = kv.trim();
        if kv.is_empty() {
            continue;
        }
        if let Some((k, v)) = kv.split_once('=') {
            m.fmtp
                .insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=No Name\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z0IAHpZUCg/ULAEAAAMAAQAAAwAwjxgxlg==,aM48gA==\r\n\
a=control:track1\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 mpeg4-generic/16000/1\r\n\
a=fmtp:97 config=1190; streamtype=5; mode=AAC-hbr\r\n\
a=control:track2\r\n";

    #[test]
    fn parses_two_media_sections() {
        let sdp = parse(SAMPLE).unwrap();
        assert_eq!(sdp.media.len(), 2);
    }

    #[test]
    fn parses_h264_fmtp_and_rtpmap() {
        let sdp = parse(SAMPLE).unwrap();
        let video = &sdp.media[0];
        assert_eq!(video.media_type, Some(MediaType::Video));
        assert_eq!(video.payload_type, Some(96));
        assert_eq!(video.rtpmap_encoding.as_deref(), Some("H264"));
        assert_eq!(video.clock_rate, Some(90000));
        assert_eq!(video.control.as_deref(), Some("track1"));
        assert_eq!(
            video.fmtp.get("sprop-parameter-sets").map(|s| s.as_str()),
            Some("Z0IAHpZUCg/ULAEAAAMAAQAAAwAwjxgxlg==,aM48gA==")
        );
        assert_eq!(video.fmtp.get("packetization-mode").map(|s| s.as_str()), Some("1"));
    }

    #[test]
    fn parses_aac_with_channels() {
        let sdp = parse(SAMPLE).unwrap();
        let audio = &sdp.media[1];
        assert_eq!(audio.clock_rate, Some(16000));
        assert_eq!(audio.channels, Some(1));
        assert_eq!(audio.fmtp.get("config").map(|s| s.as_str()), Some("1190"));
    }

    #[test]
    fn catch_all_attribute_lookup() {
        let body = "m=video 0 RTP/AVP 98\r\na=framesize:98 1920-1080\r\n";
        let sdp = parse(body).unwrap();
        assert_eq!(sdp.media[0].attribute("framesize"), Some("98 1920-1080"));
    }

    #[test]
    fn no_media_is_an_error() {
        assert!(parse("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n").is_err());
    }
}
