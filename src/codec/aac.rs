//! AAC depacketization for `mpeg4-generic` payloads; see
//! [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640).

use std::collections::HashMap;

use bitreader::BitReader;
use bytes::{Buf, Bytes};
use smallvec::SmallVec;

use super::{AccessUnit, NewDepacketizerError, SampleTiming};

const MAX_AU_HEADERS_BYTES: usize = 8192;
const MAX_AAC_HBR_FRAME_SIZE: usize = 8191;

struct AuHeader {
    size: usize,
}

#[derive(Debug)]
pub struct Depacketizer {
    extradata: Bytes,
    sizelength: u8,
    indexlength: u8,

    first_seq: Option<u16>,
    rtptime: Option<u32>,
    au_duration: Option<i64>,

    /// A fragmented AU rarely exceeds one Ethernet MTU's worth of payload;
    /// this keeps the common case off the heap.
    frag_buf: SmallVec<[u8; 1500]>,
    frag_expected_size: usize,
    frag_timestamp: Option<u32>,
}

impl Depacketizer {
    pub fn new(
        _clock_rate: u32,
        _channels: Option<u16>,
        fmtp: &HashMap<String, String>,
    ) -> Result<Self, NewDepacketizerError> {
        let sizelength = parse_ranged_int(fmtp, "sizelength", 0, 32)?
            .ok_or(NewDepacketizerError::MissingFmtp("sizelength"))?;
        let indexlength = parse_ranged_int(fmtp, "indexlength", 0, 32)?
            .ok_or(NewDepacketizerError::MissingFmtp("indexlength"))?;
        // Validated for conformance even though this depacketizer does not
        // use their values directly (interleaving via indexdeltalength is
        // not supported; see `_parse_au_headers`).
        let _indexdeltalength = parse_ranged_int(fmtp, "indexdeltalength", 0, 32)?;
        let _profile_level_id = parse_ranged_int(fmtp, "profile-level-id", i32::MIN, i32::MAX)?;
        let _streamtype = parse_ranged_int(fmtp, "streamtype", 0, 0x3F)?;

        let extradata = match fmtp.get("config") {
            Some(config) => Bytes::from(
                hex::decode(config)
                    .map_err(|e| NewDepacketizerError::BadFmtp("config", e.to_string()))?,
            ),
            None => {
                log::warn!("aac: no config in fmtp, proceeding without extradata");
                Bytes::new()
            }
        };

        Ok(Self {
            extradata,
            sizelength: sizelength as u8,
            indexlength: indexlength as u8,
            first_seq: None,
            rtptime: None,
            au_duration: None,
            frag_buf: SmallVec::new(),
            frag_expected_size: 0,
            frag_timestamp: None,
        })
    }

    pub fn extradata(&self) -> &Bytes {
        &self.extradata
    }

    pub fn handle_packet(&mut self, pkt: Option<crate::rtp::Packet>) -> Vec<AccessUnit> {
        let Some(pkt) = pkt else {
            self.frag_buf.clear();
            self.frag_expected_size = 0;
            self.frag_timestamp = None;
            return Vec::new();
        };
        let mut out = Vec::new();

        let (headers, section_size) = match self.parse_au_headers(&pkt.payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("aac: error parsing AU headers: {}", e);
                return out;
            }
        };
        if headers.is_empty() {
            return out;
        }

        let current_seq = pkt.sequence_number;
        let current_ts = pkt.timestamp;
        let mut current_au_timestamp: i64 = current_ts as i64;

        let need_reseed = self.rtptime.is_none()
            || self.first_seq.is_none()
            || (self.au_duration.is_none() && current_seq != self.first_seq.unwrap());
        if need_reseed {
            log::debug!("aac: losing a packet to determine AU duration");
            self.first_seq = Some(current_seq.wrapping_add(1));
            self.rtptime = Some(current_ts);
            return out;
        } else if self.au_duration.is_none() {
            let diff = current_au_timestamp - self.rtptime.unwrap() as i64;
            self.au_duration = Some(diff / headers.len() as i64);
        }

        current_au_timestamp -= self.rtptime.unwrap() as i64;

        let mut buf = pkt.payload;
        buf.advance(section_size);

        if headers.len() == 1 && buf.len() < headers[0].size {
            return self.handle_fragment(&headers[0], &buf, current_ts, current_au_timestamp, pkt.mark);
        }

        let au_duration = self.au_duration.unwrap_or(0);
        let mut pts = current_au_timestamp;
        for (i, header) in headers.iter().enumerate() {
            if buf.len() < header.size {
                log::warn!("aac: AU larger than remaining packet data");
                return out;
            }
            let data = buf.split_to(header.size);
            out.push(AccessUnit {
                data,
                timing: Some(SampleTiming {
                    pts,
                    au_index: i as u32,
                }),
            });
            pts += au_duration;
        }
        out
    }

    fn handle_fragment(
        &mut self,
        header: &AuHeader,
        buf: &Bytes,
        raw_timestamp: u32,
        current_au_timestamp: i64,
        mark: bool,
    ) -> Vec<AccessUnit> {
        let mut out = Vec::new();
        if self.frag_buf.is_empty() {
            if header.size > MAX_AAC_HBR_FRAME_SIZE {
                log::warn!("aac: invalid fragmented AU size {}", header.size);
                return out;
            }
            self.frag_expected_size = header.size;
            self.frag_timestamp = Some(raw_timestamp);
        }

        if self.frag_timestamp != Some(raw_timestamp)
            || header.size != self.frag_expected_size
            || self.frag_buf.len() + buf.len() > MAX_AAC_HBR_FRAME_SIZE
        {
            log::warn!("aac: invalid fragment, discarding buffered AU");
            self.frag_expected_size = 0;
            self.frag_buf.clear();
            return out;
        }

        self.frag_buf.extend_from_slice(buf);

        if !mark {
            return out; // more fragments expected
        }

        if self.frag_buf.len() != self.frag_expected_size {
            log::warn!("aac: missed fragments, discarding AU");
            self.frag_buf.clear();
            return out;
        }

        out.push(AccessUnit {
            data: Bytes::from(std::mem::take(&mut self.frag_buf).into_vec()),
            timing: Some(SampleTiming {
                pts: current_au_timestamp,
                au_index: 0,
            }),
        });
        out
    }

    /// Parses the AU-headers section (RFC 3640 §3.3.6), assuming only
    /// `sizelength`+`indexlength` bits per header (no CTS/DTS/RAP fields)
    /// and no auxiliary section, matching this crate's required fmtp
    /// parameters.
    fn parse_au_headers(&self, payload: &[u8]) -> Result<(Vec<AuHeader>, usize), &'static str> {
        if payload.len() < 2 {
            return Err("payload shorter than AU-headers-length field");
        }
        let au_headers_length_in_bits = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let au_headers_length_bytes = (au_headers_length_in_bits + 7) / 8;
        if au_headers_length_bytes > MAX_AU_HEADERS_BYTES {
            return Err("AU headers length too large");
        }
        let section_size = 2 + au_headers_length_bytes;
        if payload.len() < section_size {
            return Err("payload shorter than AU-headers section");
        }

        let header_bits = self.sizelength as usize + self.indexlength as usize;
        if header_bits == 0 || au_headers_length_in_bits % header_bits != 0 {
            return Err("invalid AU header size");
        }
        let count = au_headers_length_in_bits / header_bits;

        let mut reader = BitReader::new(&payload[2..2 + au_headers_length_bytes]);
        let mut headers = Vec::with_capacity(count);
        for i in 0..count {
            let size = reader
                .read_u32(self.sizelength)
                .map_err(|_| "truncated AU header")? as usize;
            let index = reader
                .read_u32(self.indexlength)
                .map_err(|_| "truncated AU header")?;
            if i > 0 && index != 0 {
                return Err("interleaving not supported");
            }
            headers.push(AuHeader { size });
        }
        Ok((headers, section_size))
    }
}

fn parse_ranged_int(
    fmtp: &HashMap<String, String>,
    key: &'static str,
    min: i64,
    max: i64,
) -> Result<Option<i64>, NewDepacketizerError> {
    match fmtp.get(key) {
        Some(v) => {
            let parsed: i64 = v
                .parse()
                .map_err(|_| NewDepacketizerError::BadFmtp(key, v.clone()))?;
            if parsed < min || parsed > max {
                return Err(NewDepacketizerError::BadFmtp(key, v.clone()));
            }
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp;

    fn fmtp() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("sizelength".to_string(), "13".to_string());
        m.insert("indexlength".to_string(), "3".to_string());
        m.insert("config".to_string(), "1190".to_string());
        m
    }

    fn pkt(seq: u16, ts: u32, payload: Vec<u8>, mark: bool) -> rtp::Packet {
        rtp::Packet {
            ssrc: 1,
            sequence_number: seq,
            timestamp: ts,
            payload_type: 97,
            mark,
            payload: Bytes::from(payload),
        }
    }

    fn single_au_packet(seq: u16, ts: u32, au: &[u8]) -> rtp::Packet {
        // AU-headers-length = 16 bits (sizelength=13 + indexlength=3), one header.
        let mut payload = vec![0u8, 16];
        // size = au.len() (13 bits), index = 0 (3 bits) -> 16 bits total = 2 bytes.
        let size = au.len() as u16;
        let packed: u16 = (size << 3) | 0;
        payload.extend_from_slice(&packed.to_be_bytes());
        payload.extend_from_slice(au);
        pkt(seq, ts, payload, true)
    }

    #[test]
    fn missing_sizelength_or_indexlength_is_an_error() {
        let mut f = fmtp();
        f.remove("sizelength");
        assert!(Depacketizer::new(8000, None, &f).is_err());
    }

    #[test]
    fn first_two_packets_establish_au_duration_then_emit() {
        let mut d = Depacketizer::new(8000, None, &fmtp()).unwrap();
        let out1 = d.handle_packet(Some(single_au_packet(100, 1000, b"first-au")));
        assert!(out1.is_empty());
        assert_eq!(d.au_duration, None);

        let out2 = d.handle_packet(Some(single_au_packet(101, 2024, b"second-au")));
        assert_eq!(out2.len(), 1);
        assert_eq!(d.au_duration, Some(1024));
        assert_eq!(out2[0].timing.unwrap().pts, 1024);
        assert_eq!(&out2[0].data[..], b"second-au");
    }

    #[test]
    fn multi_au_packet_assigns_increasing_pts() {
        let mut d = Depacketizer::new(8000, None, &fmtp()).unwrap();
        d.handle_packet(Some(single_au_packet(100, 1000, b"seed")));
        d.handle_packet(Some(single_au_packet(101, 2024, b"second")));
        assert_eq!(d.au_duration, Some(1024));

        // Build a packet with two AU headers (13+3 bits each = 32 bits = 4 bytes).
        let au1 = b"aaa";
        let au2 = b"bb";
        let mut payload = vec![0u8, 32];
        let h1: u16 = ((au1.len() as u16) << 3) | 0;
        let h2: u16 = ((au2.len() as u16) << 3) | 0;
        payload.extend_from_slice(&h1.to_be_bytes());
        payload.extend_from_slice(&h2.to_be_bytes());
        payload.extend_from_slice(au1);
        payload.extend_from_slice(au2);

        let out = d.handle_packet(Some(pkt(102, 3048, payload, true)));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timing.unwrap().au_index, 0);
        assert_eq!(out[1].timing.unwrap().au_index, 1);
        assert_eq!(out[1].timing.unwrap().pts - out[0].timing.unwrap().pts, 1024);
    }

    #[test]
    fn fragmented_au_reassembles_across_packets() {
        let mut d = Depacketizer::new(8000, None, &fmtp()).unwrap();
        d.handle_packet(Some(single_au_packet(100, 1000, b"seed")));
        d.handle_packet(Some(single_au_packet(101, 2024, b"x")));

        let full_au = b"0123456789abcdef";
        let mut header = vec![0u8, 16];
        let packed: u16 = ((full_au.len() as u16) << 3) | 0;
        header.extend_from_slice(&packed.to_be_bytes());

        let mut frag1 = header.clone();
        frag1.extend_from_slice(&full_au[..8]);
        let out1 = d.handle_packet(Some(pkt(102, 3048, frag1, false)));
        assert!(out1.is_empty());

        let mut frag2 = header;
        frag2.extend_from_slice(&full_au[8..]);
        let out2 = d.handle_packet(Some(pkt(102, 3048, frag2, true)));
        assert_eq!(out2.len(), 1);
        assert_eq!(&out2[0].data[..], &full_au[..]);
    }
}
