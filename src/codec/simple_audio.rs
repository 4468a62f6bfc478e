//! PCMA/PCMU (G.711) depacketization. Both are sample-for-sample codecs
//! with no RTP-level framing beyond the payload itself.

use bytes::Bytes;

use super::AccessUnit;

#[derive(Debug)]
pub struct Depacketizer {
    #[allow(dead_code)]
    clock_rate: u32,
    #[allow(dead_code)]
    channels: Option<u16>,
}

impl Depacketizer {
    pub fn new(clock_rate: u32, channels: Option<u16>) -> Self {
        Self {
            clock_rate,
            channels,
        }
    }

    pub fn handle_packet(&mut self, pkt: Option<crate::rtp::Packet>) -> Vec<AccessUnit> {
        match pkt {
            Some(pkt) => vec![AccessUnit::plain(pkt.payload)],
            // A null packet is a flush signal; PCMA/PCMU has no internal
            // buffering, so emit an empty access unit per SPEC_FULL.md §4.5.
            None => vec![AccessUnit::plain(Bytes::new())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp;

    #[test]
    fn passes_payload_through() {
        let mut d = Depacketizer::new(8000, Some(1));
        let pkt = rtp::Packet {
            ssrc: 1,
            sequence_number: 1,
            timestamp: 0,
            payload_type: 8,
            mark: false,
            payload: Bytes::from_static(b"mulaw-samples"),
        };
        let out = d.handle_packet(Some(pkt));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"mulaw-samples");
    }

    #[test]
    fn flush_emits_empty_access_unit() {
        let mut d = Depacketizer::new(8000, Some(1));
        let out = d.handle_packet(None);
        assert_eq!(out.len(), 1);
        assert!(out[0].data.is_empty());
    }
}
