//! HEVC/H.265 depacketization; see [RFC 7798](https://datatracker.ietf.org/doc/html/rfc7798).

use std::collections::HashMap;

use bytes::{Buf, Bytes};
use smallvec::SmallVec;

use super::{push_annexb, push_annexb_padded, split_commas, AccessUnit, NewDepacketizerError};

const NAL_TYPE_AGGREGATED: u8 = 48;
const NAL_TYPE_FU: u8 = 49;
const NAL_TYPE_PACI: u8 = 50;

/// A single FU fragment run rarely exceeds one Ethernet MTU's worth of NAL
/// payload; this keeps the common case off the heap.
type FragmentBuf = SmallVec<[u8; 1500]>;

#[derive(Debug)]
pub struct Depacketizer {
    extradata: Bytes,
    don_mode: bool,
    fragment: FragmentBuf,
    fragment_nal_header: Option<[u8; 2]>,
    dimensions: Option<(u32, u32)>,
}

impl Depacketizer {
    /// `framesize` is the width/height pair from this media's
    /// `a=framesize:<pt> <w>-<h>` attribute, if present, letting the output
    /// stream open before any frame has actually been decoded
    /// (SPEC_FULL.md §3).
    pub fn new(
        fmtp: &HashMap<String, String>,
        framesize: Option<(u32, u32)>,
    ) -> Result<Self, NewDepacketizerError> {
        let mut extradata = Vec::new();
        for key in ["sprop-vps", "sprop-sps", "sprop-pps", "sprop-sei"] {
            if let Some(value) = fmtp.get(key) {
                for set in split_commas(value) {
                    let decoded = base64::decode(set)
                        .map_err(|e| NewDepacketizerError::BadFmtp(key, e.to_string()))?;
                    push_annexb_padded(&mut extradata, &decoded);
                }
            }
        }
        if extradata.is_empty() {
            return Err(NewDepacketizerError::MissingFmtp("sprop-vps/sps/pps"));
        }
        let don_mode = fmtp
            .get("sprop-max-don-diff")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|v| v > 0)
            .unwrap_or(false)
            || fmtp
                .get("sprop-depack-buf-nalus")
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v > 0)
                .unwrap_or(false);
        Ok(Self {
            extradata: Bytes::from(extradata),
            don_mode,
            fragment: SmallVec::new(),
            fragment_nal_header: None,
            dimensions: framesize,
        })
    }

    pub fn extradata(&self) -> &Bytes {
        &self.extradata
    }

    /// Width/height known ahead of decoding any frame, from SDP.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn handle_packet(&mut self, pkt: Option<crate::rtp::Packet>) -> Vec<AccessUnit> {
        let Some(pkt) = pkt else {
            self.fragment.clear();
            self.fragment_nal_header = None;
            return Vec::new();
        };
        let mut data = pkt.payload;
        let mut out = Vec::new();
        if data.len() < 2 {
            log::debug!("h265: truncated payload header");
            return out;
        }
        let b0 = data[0];
        let b1 = data[1];
        let nal_type = (b0 >> 1) & 0x3F;
        let lid = ((b0 << 5) & 0x20) | ((b1 >> 3) & 0x1F);
        let tid = b1 & 7;
        if lid != 0 || tid == 0 {
            log::debug!("h265: rejecting lid={} tid={}", lid, tid);
            return out;
        }

        match nal_type {
            0..=47 => {
                let mut buf = Vec::with_capacity(4 + data.len());
                push_annexb(&mut buf, &data[..]);
                out.push(AccessUnit::plain(Bytes::from(buf)));
            }
            NAL_TYPE_AGGREGATED => {
                data.advance(2);
                if self.don_mode {
                    if data.len() < 2 {
                        return out;
                    }
                    data.advance(2); // DONL, once per aggregation packet
                }
                let mut first = true;
                while data.len() > 2 {
                    if self.don_mode && !first {
                        if data.is_empty() {
                            break;
                        }
                        data.advance(1); // DOND, between subsequent units
                    }
                    first = false;
                    if data.len() < 2 {
                        break;
                    }
                    let size = u16::from_be_bytes([data[0], data[1]]) as usize;
                    data.advance(2);
                    if size == 0 || data.len() < size {
                        log::debug!("h265: truncated aggregated NAL unit");
                        break;
                    }
                    let mut buf = Vec::with_capacity(4 + size);
                    push_annexb(&mut buf, &data[..size]);
                    out.push(AccessUnit::plain(Bytes::from(buf)));
                    data.advance(size);
                }
            }
            NAL_TYPE_FU => {
                data.advance(2);
                if data.is_empty() {
                    log::debug!("h265: truncated FU header");
                    return out;
                }
                let fu_header = data[0];
                data.advance(1);
                if self.don_mode {
                    if data.len() < 2 {
                        log::debug!("h265: truncated FU DONL");
                        return out;
                    }
                    data.advance(2);
                }
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let fu_type = fu_header & 0x3F;
                let new_b0 = (b0 & 0x81) | (fu_type << 1);
                let header = [new_b0, b1];
                if start {
                    self.fragment.clear();
                    self.fragment_nal_header = Some(header);
                    self.fragment.extend_from_slice(&data[..]);
                } else if self.fragment_nal_header == Some(header) {
                    self.fragment.extend_from_slice(&data[..]);
                } else {
                    log::debug!("h265: FU continuation without matching start; dropping");
                    return out;
                }
                if end || pkt.mark {
                    if let Some(nal_header) = self.fragment_nal_header.take() {
                        let mut buf = Vec::with_capacity(6 + self.fragment.len());
                        buf.extend_from_slice(&super::ANNEX_B_START_CODE);
                        buf.extend_from_slice(&nal_header);
                        buf.extend_from_slice(&self.fragment);
                        out.push(AccessUnit::plain(Bytes::from(buf)));
                    }
                    self.fragment.clear();
                }
            }
            NAL_TYPE_PACI => {
                log::debug!("h265: PACI not supported, dropping");
            }
            other => {
                log::debug!("h265: dropping unsupported NAL type {}", other);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp;

    fn fmtp() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("sprop-sps".to_string(), base64::encode("spsdata"));
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
    fn single_nal_passthrough() {
        let mut d = Depacketizer::new(&fmtp(), None).unwrap();
        // nal_type=32 (VPS) -> b0 = 32<<1 = 0x40, lid/tid bits zero except tid must be nonzero.
        let b0 = 32u8 << 1;
        let b1 = 1u8; // tid = 1
        let out = d.handle_packet(Some(pkt(&[b0, b1, 0xAA, 0xBB], true)));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &[0, 0, 0, 1, b0, b1, 0xAA, 0xBB]);
    }

    #[test]
    fn rejects_tid_zero() {
        let mut d = Depacketizer::new(&fmtp(), None).unwrap();
        let out = d.handle_packet(Some(pkt(&[0x02, 0x00, 1, 2], true)));
        assert!(out.is_empty());
    }

    #[test]
    fn fu_reassembles_two_byte_header() {
        let mut d = Depacketizer::new(&fmtp(), None).unwrap();
        let b0_payload_hdr = NAL_TYPE_FU << 1;
        let b1_payload_hdr = 1u8;
        let start_fu = 0x80 | 19u8; // type 19 = IDR_W_RADL
        let end_fu = 0x40 | 19u8;

        let out1 = d.handle_packet(Some(pkt(
            &[b0_payload_hdr, b1_payload_hdr, start_fu, 1, 2],
            false,
        )));
        assert!(out1.is_empty());
        let out2 = d.handle_packet(Some(pkt(
            &[b0_payload_hdr, b1_payload_hdr, end_fu, 3, 4],
            true,
        )));
        assert_eq!(out2.len(), 1);
        let expected_b0 = (b0_payload_hdr & 0x81) | (19 << 1);
        assert_eq!(
            &out2[0].data[..],
            &[0, 0, 0, 1, expected_b0, b1_payload_hdr, 1, 2, 3, 4]
        );
    }

    #[test]
    fn carries_framesize_dimensions() {
        let d = Depacketizer::new(&fmtp(), Some((1920, 1080))).unwrap();
        assert_eq!(d.dimensions(), Some((1920, 1080)));
    }

    #[test]
    fn no_framesize_means_unknown_dimensions() {
        let d = Depacketizer::new(&fmtp(), None).unwrap();
        assert_eq!(d.dimensions(), None);
    }
}
