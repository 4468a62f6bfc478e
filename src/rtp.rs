//! RTP packet parsing; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).
//!
//! Unlike the live-client case this crate is descended from, there is no
//! `StrictSequenceChecker` here: loss and reordering are a normal, expected
//! fact of an offline capture and are handled uniformly by
//! [`crate::reassembler::Reassembler`] rather than rejected at parse time.

use bytes::{Buf, Bytes};
use pretty_hex::PrettyHex;

use crate::reassembler::MaybeLen;

/// A parsed RTP packet, payload only (header and any padding stripped).
#[derive(Clone)]
pub struct Packet {
    pub ssrc: u32,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub mark: bool,
    pub payload: Bytes,
}

impl MaybeLen for Packet {}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("ssrc", &format_args!("{:08x}", self.ssrc))
            .field("sequence_number", &self.sequence_number)
            .field("timestamp", &self.timestamp)
            .field("payload_type", &self.payload_type)
            .field("mark", &self.mark)
            .field("payload", &self.payload.hex_dump())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RtpError {
    #[error("corrupt RTP header: {0}")]
    Malformed(&'static str),
}

/// Parse one RTP packet from `data` (the full UDP datagram or the RTSP
/// interleaved frame's payload). Extension headers are skipped over but not
/// otherwise interpreted; CSRC lists are skipped.
pub fn parse(mut data: Bytes) -> Result<Packet, RtpError> {
    let reader = rtp_rs::RtpReader::new(&data[..]).map_err(|e| {
        log::debug!("corrupt RTP header: {:?}\n{:#?}", e, data.hex_dump());
        RtpError::Malformed("rtp_rs rejected header")
    })?;
    let sequence_number = reader.sequence_number().into();
    let timestamp = reader.timestamp();
    let ssrc = reader.ssrc();
    let mark = reader.mark();
    let payload_type = reader.payload_type();
    let payload_range = as_range(&data, reader.payload())
        .ok_or(RtpError::Malformed("payload range out of bounds"))?;
    data.truncate(payload_range.end);
    data.advance(payload_range.start);
    Ok(Packet {
        ssrc,
        sequence_number,
        timestamp,
        payload_type,
        mark,
        payload: data,
    })
}

/// Computes `subset`'s byte range within `whole`, if `subset` is in fact a
/// subslice of it (as it always should be when `subset` came from parsing
/// `whole`, e.g. via [`rtp_rs::RtpReader::payload`]).
fn as_range(whole: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    let whole_start = whole.as_ptr() as usize;
    let subset_start = subset.as_ptr() as usize;
    let start = subset_start.checked_sub(whole_start)?;
    let end = start + subset.len();
    if end > whole.len() {
        return None;
    }
    Some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal(seq: u16, ts: u32, ssrc: u32, pt: u8, mark: bool, payload: &[u8]) -> Bytes {
        let mut buf = Vec::with_capacity(12 + payload.len());
        buf.push(0x80); // version 2, no padding/extension/csrc
        buf.push(if mark { 0x80 } else { 0 } | (pt & 0x7f));
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(payload);
        Bytes::from(buf)
    }

    #[test]
    fn parses_fields_and_strips_header() {
        let raw = build_minimal(1234, 90000, 0xdeadbeef, 96, true, b"payload-bytes");
        let pkt = parse(raw).unwrap();
        assert_eq!(pkt.sequence_number, 1234);
        assert_eq!(pkt.timestamp, 90000);
        assert_eq!(pkt.ssrc, 0xdeadbeef);
        assert_eq!(pkt.payload_type, 96);
        assert!(pkt.mark);
        assert_eq!(&pkt.payload[..], b"payload-bytes");
    }

    #[test]
    fn rejects_truncated_header() {
        let raw = Bytes::from_static(&[0x80, 0x60, 0x00]);
        assert!(parse(raw).is_err());
    }
}
