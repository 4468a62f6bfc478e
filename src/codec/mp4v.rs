//! MPEG-4 Visual (`mp4v-es`) depacketization. The wire format has no RTP
//! framing of its own beyond plain payload concatenation; packetization is
//! effectively pass-through (see SPEC_FULL.md §4.5).

use std::collections::HashMap;

use bytes::Bytes;

use super::{AccessUnit, NewDepacketizerError};

#[derive(Debug)]
pub struct Depacketizer {
    extradata: Bytes,
}

impl Depacketizer {
    pub fn new(fmtp: &HashMap<String, String>) -> Result<Self, NewDepacketizerError> {
        let config = fmtp
            .get("config")
            .ok_or(NewDepacketizerError::MissingFmtp("config"))?;
        let extradata =
            hex::decode(config).map_err(|e| NewDepacketizerError::BadFmtp("config", e.to_string()))?;
        Ok(Self {
            extradata: Bytes::from(extradata),
        })
    }

    pub fn extradata(&self) -> &Bytes {
        &self.extradata
    }

    pub fn handle_packet(&mut self, pkt: Option<crate::rtp::Packet>) -> Vec<AccessUnit> {
        match pkt {
            Some(pkt) if !pkt.payload.is_empty() => vec![AccessUnit::plain(pkt.payload)],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp;

    fn fmtp() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("config".to_string(), "000001b0".to_string());
        m
    }

    #[test]
    fn decodes_hex_config_as_extradata() {
        let d = Depacketizer::new(&fmtp()).unwrap();
        assert_eq!(&d.extradata()[..], &[0x00, 0x00, 0x01, 0xb0]);
    }

    #[test]
    fn passes_payload_through_unchanged() {
        let mut d = Depacketizer::new(&fmtp()).unwrap();
        let pkt = rtp::Packet {
            ssrc: 1,
            sequence_number: 1,
            timestamp: 0,
            payload_type: 97,
            mark: true,
            payload: Bytes::from_static(b"raw-frame-bytes"),
        };
        let out = d.handle_packet(Some(pkt));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"raw-frame-bytes");
    }

    #[test]
    fn missing_config_is_an_error() {
        assert!(Depacketizer::new(&HashMap::new()).is_err());
    }
}
