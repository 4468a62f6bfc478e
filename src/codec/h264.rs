//! H.264 depacketization; see [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184).

use std::collections::HashMap;

use bytes::{Buf, Bytes};
use smallvec::SmallVec;

use super::{push_annexb, push_annexb_padded, split_commas, AccessUnit, NewDepacketizerError};

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

/// A single FU-A fragment run rarely exceeds one Ethernet MTU's worth of
/// NAL payload; this keeps the common case off the heap.
type FragmentBuf = SmallVec<[u8; 1500]>;

#[derive(Debug)]
pub struct Depacketizer {
    extradata: Bytes,
    fragment: FragmentBuf,
    fragment_nal_header: Option<u8>,
}

impl Depacketizer {
    pub fn new(fmtp: &HashMap<String, String>) -> Result<Self, NewDepacketizerError> {
        let sprop = fmtp
            .get("sprop-parameter-sets")
            .ok_or(NewDepacketizerError::MissingFmtp("sprop-parameter-sets"))?;
        let mut extradata = Vec::new();
        for set in split_commas(sprop) {
            let decoded = base64::decode(set).map_err(|e| {
                NewDepacketizerError::BadFmtp("sprop-parameter-sets", e.to_string())
            })?;
            push_annexb_padded(&mut extradata, &decoded);
        }
        Ok(Self {
            extradata: Bytes::from(extradata),
            fragment: SmallVec::new(),
            fragment_nal_header: None,
        })
    }

    pub fn extradata(&self) -> &Bytes {
        &self.extradata
    }

    pub fn handle_packet(&mut self, pkt: Option<crate::rtp::Packet>) -> Vec<AccessUnit> {
        let Some(pkt) = pkt else {
            self.fragment.clear();
            self.fragment_nal_header = None;
            return Vec::new();
        };
        let mut data = pkt.payload;
        if data.is_empty() {
            return Vec::new();
        }
        let header = data[0];
        let nal_type = header & 0x1F;
        let mut out = Vec::new();

        match nal_type {
            1..=23 => {
                let mut buf = Vec::with_capacity(4 + data.len());
                push_annexb(&mut buf, &data[..]);
                out.push(AccessUnit::plain(Bytes::from(buf)));
            }
            NAL_TYPE_STAP_A => {
                data.advance(1);
                while data.len() > 2 {
                    let size = u16::from_be_bytes([data[0], data[1]]) as usize;
                    data.advance(2);
                    if size == 0 || data.len() < size {
                        log::debug!("h264: truncated STAP-A aggregation unit");
                        break;
                    }
                    let mut buf = Vec::with_capacity(4 + size);
                    push_annexb(&mut buf, &data[..size]);
                    out.push(AccessUnit::plain(Bytes::from(buf)));
                    data.advance(size);
                }
            }
            NAL_TYPE_FU_A => {
                if data.len() < 2 {
                    log::debug!("h264: truncated FU-A packet");
                    return out;
                }
                let indicator = data[0];
                let fu_header = data[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let inner_type = fu_header & 0x1F;
                let reconstructed = (indicator & 0xE0) | inner_type;
                if start {
                    self.fragment.clear();
                    self.fragment_nal_header = Some(reconstructed);
                    self.fragment.extend_from_slice(&data[2..]);
                } else if self.fragment_nal_header == Some(reconstructed) {
                    self.fragment.extend_from_slice(&data[2..]);
                } else {
                    log::debug!("h264: FU-A continuation without matching start; dropping");
                    return out;
                }
                if end || pkt.mark {
                    if let Some(nal_header) = self.fragment_nal_header.take() {
                        let mut buf = Vec::with_capacity(5 + self.fragment.len());
                        buf.extend_from_slice(&super::ANNEX_B_START_CODE);
                        buf.push(nal_header);
                        buf.extend_from_slice(&self.fragment);
                        out.push(AccessUnit::plain(Bytes::from(buf)));
                    }
                    self.fragment.clear();
                }
            }
            other => {
                log::debug!("h264: dropping unsupported NAL type {}", other);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp;

    fn fmtp_with(sprop: &str) -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("sprop-parameter-sets".to_string(), sprop.to_string());
        m
    }

    fn pkt(payload: &[u8], mark: bool) -> rtp::Packet {
        rtp::Packet {
            ssrc: 1,
            sequence_number: 1,
            timestamp: 0,
            payload_type: 96,
            mark,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn extradata_has_two_padded_annexb_sets() {
        let sprop = format!("{},{}", base64::encode("abc"), base64::encode("de"));
        let d = Depacketizer::new(&fmtp_with(&sprop)).unwrap();
        let expected_len = (4 + 3 + 64) + (4 + 2 + 64);
        assert_eq!(d.extradata().len(), expected_len);
        assert_eq!(&d.extradata()[0..4], &[0, 0, 0, 1]);
    }

    #[test]
    fn single_nal_gets_start_code() {
        let mut d = Depacketizer::new(&fmtp_with(&base64::encode("x"))).unwrap();
        let out = d.handle_packet(Some(pkt(&[0x65, 1, 2, 3], true)));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &[0, 0, 0, 1, 0x65, 1, 2, 3]);
    }

    #[test]
    fn stap_a_splits_aggregated_units() {
        let mut d = Depacketizer::new(&fmtp_with(&base64::encode("x"))).unwrap();
        let mut payload = vec![24u8];
        payload.extend_from_slice(&(2u16).to_be_bytes());
        payload.extend_from_slice(&[0xAA, 0xBB]);
        payload.extend_from_slice(&(3u16).to_be_bytes());
        payload.extend_from_slice(&[0xCC, 0xDD, 0xEE]);
        let out = d.handle_packet(Some(pkt(&payload, true)));
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].data[..], &[0, 0, 0, 1, 0xAA, 0xBB]);
        assert_eq!(&out[1].data[..], &[0, 0, 0, 1, 0xCC, 0xDD, 0xEE]);
    }

    #[test]
    fn fu_a_reassembles_across_fragments() {
        let mut d = Depacketizer::new(&fmtp_with(&base64::encode("x"))).unwrap();
        // indicator: forbidden=0,nri=2(0x40),type=28; header start: type=5 (IDR)
        let indicator = 0x40 | NAL_TYPE_FU_A;
        let start_header = 0x80 | 5u8;
        let mid_header = 5u8;
        let end_header = 0x40 | 5u8;

        let out1 = d.handle_packet(Some(pkt(&[indicator, start_header, 1, 2], false)));
        assert!(out1.is_empty());
        let out2 = d.handle_packet(Some(pkt(&[indicator, mid_header, 3, 4], false)));
        assert!(out2.is_empty());
        let out3 = d.handle_packet(Some(pkt(&[indicator, end_header, 5, 6], true)));
        assert_eq!(out3.len(), 1);
        // reconstructed header = (indicator & 0xE0) | 5 = 0x40 | 5 = 0x45
        assert_eq!(&out3[0].data[..], &[0, 0, 0, 1, 0x45, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn missing_sprop_is_an_error() {
        assert!(Depacketizer::new(&HashMap::new()).is_err());
    }
}
