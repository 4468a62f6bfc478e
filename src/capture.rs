//! Packet trace reading: pcap/pcapng record iteration plus Ethernet/IPv4/
//! IPv6/TCP/UDP framing.
//!
//! The whole file is read into memory up front so the orchestrator can make
//! two independent passes over it (see SPEC_FULL.md §4.6) without needing a
//! seekable/rewindable reader abstraction from the underlying pcap crate.

use std::io::Cursor;
use std::net::IpAddr;
use std::path::Path;

use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to open capture file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unrecognized capture file format (neither pcap nor pcapng magic)")]
    UnknownFormat,
    #[error("malformed capture: {0}")]
    Malformed(#[from] pcap_file::PcapError),
    #[error("malformed pcapng capture: {0}")]
    MalformedNg(#[from] pcap_file::PcapNgError),
}

enum Format {
    Pcap,
    PcapNg,
}

/// An opened capture file, holding the whole file in memory so it can be
/// iterated more than once.
pub struct Capture {
    bytes: Vec<u8>,
    format: Format,
}

impl Capture {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let bytes = std::fs::read(path)?;
        let format = detect_format(&bytes)?;
        Ok(Self { bytes, format })
    }

    /// Iterate every link-layer frame in the capture, in file order. Can be
    /// called more than once to make independent passes.
    pub fn frames(&self) -> Result<Box<dyn Iterator<Item = Bytes> + '_>, CaptureError> {
        match self.format {
            Format::Pcap => {
                let reader = pcap_file::pcap::PcapReader::new(Cursor::new(&self.bytes[..]))?;
                Ok(Box::new(reader.filter_map(|pkt| match pkt {
                    Ok(pkt) => Some(Bytes::copy_from_slice(&pkt.data)),
                    Err(e) => {
                        log::warn!("capture: skipping malformed pcap record: {}", e);
                        None
                    }
                })))
            }
            Format::PcapNg => {
                let reader = pcap_file::pcapng::PcapNgReader::new(Cursor::new(&self.bytes[..]))?;
                Ok(Box::new(reader.filter_map(|block| match block {
                    Ok(block) => block.into_owned().try_into_enhanced_packet_data(),
                    Err(e) => {
                        log::warn!("capture: skipping malformed pcapng block: {}", e);
                        None
                    }
                })))
            }
        }
    }
}

fn detect_format(bytes: &[u8]) -> Result<Format, CaptureError> {
    if bytes.len() < 4 {
        return Err(CaptureError::UnknownFormat);
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    match magic {
        [0xd4, 0xc3, 0xb2, 0xa1] | [0xa1, 0xb2, 0xc3, 0xd4] => Ok(Format::Pcap),
        [0x4d, 0x3c, 0xb2, 0xa1] | [0xa1, 0xb2, 0x3c, 0x4d] => Ok(Format::Pcap), // nanosecond variants
        [0x0a, 0x0d, 0x0d, 0x0a] => Ok(Format::PcapNg),
        _ => Err(CaptureError::UnknownFormat),
    }
}

trait IntoEnhancedPacketData {
    fn try_into_enhanced_packet_data(self) -> Option<Bytes>;
}

impl IntoEnhancedPacketData for pcap_file::pcapng::Block<'static> {
    fn try_into_enhanced_packet_data(self) -> Option<Bytes> {
        use pcap_file::pcapng::Block;
        match self {
            Block::EnhancedPacket(b) => Some(Bytes::copy_from_slice(&b.data)),
            Block::SimplePacket(b) => Some(Bytes::copy_from_slice(&b.data)),
            _ => None,
        }
    }
}

/// A transport-layer view of one Ethernet/IP frame, with headers already
/// stripped. Non-IP, non-TCP/UDP frames parse to `Other`.
#[derive(Debug)]
pub enum ParsedFrame {
    Tcp {
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        seq: u32,
        fin: bool,
        /// `Some(urgent_pointer)` only when the URG flag is set.
        urgent_pointer: Option<u16>,
        payload: Bytes,
    },
    Udp {
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        payload: Bytes,
    },
    Other,
}

/// Parse one Ethernet frame down to its transport-layer payload.
pub fn parse_frame(data: &Bytes) -> ParsedFrame {
    let parsed = match etherparse::SlicedPacket::from_ethernet(data) {
        Ok(p) => p,
        Err(e) => {
            log::debug!("capture: failed to parse Ethernet frame: {:?}", e);
            return ParsedFrame::Other;
        }
    };

    let Some(ip) = parsed.ip else {
        return ParsedFrame::Other;
    };
    let (src_ip, dst_ip): (IpAddr, IpAddr) = match &ip {
        etherparse::InternetSlice::Ipv4(header, _) => {
            (header.source_addr().into(), header.destination_addr().into())
        }
        etherparse::InternetSlice::Ipv6(header, _) => {
            (header.source_addr().into(), header.destination_addr().into())
        }
    };

    let Some(transport) = parsed.transport else {
        return ParsedFrame::Other;
    };
    let payload = Bytes::copy_from_slice(parsed.payload);
    match transport {
        etherparse::TransportSlice::Tcp(tcp) => ParsedFrame::Tcp {
            src: (src_ip, tcp.source_port()),
            dst: (dst_ip, tcp.destination_port()),
            seq: tcp.sequence_number(),
            fin: tcp.fin(),
            urgent_pointer: tcp.urg().then(|| tcp.urgent_pointer()),
            payload,
        },
        etherparse::TransportSlice::Udp(udp) => ParsedFrame::Udp {
            src: (src_ip, udp.source_port()),
            dst: (dst_ip, udp.destination_port()),
            payload,
        },
        _ => ParsedFrame::Other,
    }
}
