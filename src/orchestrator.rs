//! Stream orchestrator: ties the RTSP session tracker, interleaved framing,
//! and UDP RTP delivery together across a whole capture, and drives the
//! decode/encode/mux pipeline for each recovered RTP identity.
//!
//! See spec.md §4.6 and SPEC_FULL.md §4.6 for the two-pass design this is a
//! direct transcription of.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use ffmpeg_next::codec::Id as AvCodecId;

use crate::capture::{Capture, ParsedFrame};
use crate::error::{Error, Result};
use crate::flow::{FlowKey, Proto};
use crate::pipeline::{self, DecoderSlot, SlotConfig};
use crate::rtp;
use crate::rtsp::session::RTSP_PORTS;
use crate::rtsp::transport::Protocol;
use crate::rtsp::{RtspSession, RtspSessionState};

/// The RTP identity: the triple that disambiguates logical RTP streams
/// sharing transport (spec.md §3).
type Identity = (FlowKey, u32, u8);

/// Fatal-validation-time and per-run configuration, built from CLI options
/// (out of scope for behavior, but this struct is the contract the binary
/// drives the orchestrator through; see SPEC_FULL.md §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub output_dir: PathBuf,
    pub prefix: String,
    pub format: String,
    pub default_video_codec: String,
    pub default_audio_codec: String,
    pub force_vcodec: bool,
    pub force_acodec: bool,
    /// Enables codec-internal threading in the decode/encode backend.
    /// Opaque to this crate's observable output (spec.md §5).
    pub fast: bool,
}

impl Config {
    /// Validates and prepares the output directory, and resolves the
    /// default codec/format names to backend codec ids. Every error this
    /// returns is one of spec.md §7's "Fatal configuration errors", meant
    /// to be surfaced before any capture processing begins.
    fn validate(&self) -> Result<(AvCodecId, AvCodecId)> {
        if self.output_dir.exists() {
            if !self.output_dir.is_dir() {
                return Err(Error::OutputDirNotADirectory(self.output_dir.clone()));
            }
        } else {
            std::fs::create_dir_all(&self.output_dir)
                .map_err(|e| Error::CreateOutputDir(self.output_dir.clone(), e))?;
        }
        if !pipeline::SUPPORTED_FORMATS.contains(&self.format.as_str()) {
            return Err(Error::UnsupportedOutputFormat(self.format.clone()));
        }
        let default_video = pipeline::parse_codec_name(&self.default_video_codec)
            .ok_or_else(|| Error::UnsupportedDefaultCodec(self.default_video_codec.clone()))?;
        let default_audio = pipeline::parse_codec_name(&self.default_audio_codec)
            .ok_or_else(|| Error::UnsupportedDefaultCodec(self.default_audio_codec.clone()))?;
        Ok((default_video, default_audio))
    }
}

/// Drives the whole capture-to-media pipeline: discovers RTSP sessions,
/// associates RTP flows with their SDP media, and owns every decoder slot
/// created along the way.
pub struct Orchestrator {
    config: Config,
    default_video_codec: AvCodecId,
    default_audio_codec: AvCodecId,

    /// One session per TCP flow whose server port is a known RTSP port.
    sessions: HashMap<FlowKey, RtspSession>,
    /// Flows already resolved (so a session's transport headers aren't
    /// re-registered every time `DONE` is observed again).
    resolved: HashSet<FlowKey>,
    /// UDP 5-tuple flow key -> the RTSP session's (TCP) flow key, populated
    /// once a session's UDP transport headers are resolved.
    udp_route: HashMap<FlowKey, FlowKey>,

    next_decoder_id: u64,
    identity_to_decoder: HashMap<Identity, u64>,
    invalid_identities: HashSet<Identity>,
    decoders: HashMap<u64, DecoderSlot>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self> {
        let (default_video_codec, default_audio_codec) = config.validate()?;
        Ok(Self {
            config,
            default_video_codec,
            default_audio_codec,
            sessions: HashMap::new(),
            resolved: HashSet::new(),
            udp_route: HashMap::new(),
            next_decoder_id: 0,
            identity_to_decoder: HashMap::new(),
            invalid_identities: HashSet::new(),
            decoders: HashMap::new(),
        })
    }

    /// Processes the whole capture (two passes; see spec.md §9) and closes
    /// every decoder slot it created.
    pub fn run(&mut self, capture: &Capture) -> Result<()> {
        self.first_pass(capture)?;
        self.finish_pending_sessions();
        self.second_pass(capture)?;
        self.close();
        Ok(())
    }

    fn first_pass(&mut self, capture: &Capture) -> Result<()> {
        for data in capture.frames()? {
            let ParsedFrame::Tcp {
                src,
                dst,
                seq,
                fin,
                urgent_pointer,
                payload,
            } = crate::capture::parse_frame(&data)
            else {
                continue;
            };
            self.process_tcp_segment(src, dst, seq, fin, urgent_pointer, payload);
        }
        Ok(())
    }

    /// Feeds one server-to-client TCP segment through the RTSP session for
    /// its flow (created lazily), dispatching any RTP recovered from
    /// TCP-interleaved framing. Frames from a source port outside
    /// [`RTSP_PORTS`] are ignored. Exposed so fixtures can drive the
    /// orchestrator directly without a literal pcap file (SPEC_FULL.md §8).
    pub fn process_tcp_segment(
        &mut self,
        src: (std::net::IpAddr, u16),
        dst: (std::net::IpAddr, u16),
        seq: u32,
        fin: bool,
        urgent_pointer: Option<u16>,
        payload: bytes::Bytes,
    ) {
        if !RTSP_PORTS.contains(&src.1) {
            return;
        }
        let flow_key = FlowKey::new(src, dst, Proto::Tcp);

        // Scoped so the session borrow ends before `self` needs to be
        // borrowed again to dispatch the recovered RTP packets.
        let mut interleaved = Vec::new();
        {
            let session = self.sessions.entry(flow_key).or_insert_with(RtspSession::new);
            let got = if let Some(urp) = urgent_pointer {
                if urp == 0 && payload.is_empty() {
                    Vec::new()
                } else {
                    let cut = (urp as usize).min(payload.len());
                    session.process_segment(src.0, dst.0, seq, payload.slice(..cut))
                }
            } else {
                session.process_segment(src.0, dst.0, seq, payload)
            };
            interleaved.extend(got);
            if fin {
                interleaved.extend(session.finish());
            }
        }
        for rtp_bytes in interleaved {
            self.on_rtp_bytes(flow_key, rtp_bytes.payload);
        }
        self.maybe_resolve(flow_key);
    }

    /// Once a session reaches `DONE`, record its TCP-interleaved channels
    /// (already tracked internally by the session) and register its UDP
    /// transport headers' 5-tuples so the second pass can route to it.
    fn maybe_resolve(&mut self, flow_key: FlowKey) {
        let Some(session) = self.sessions.get(&flow_key) else {
            return;
        };
        if session.state() != RtspSessionState::Done || self.resolved.contains(&flow_key) {
            return;
        }
        self.resolved.insert(flow_key);
        let Some((server, client)) = session.endpoints() else {
            return;
        };
        for header in &session.transport_headers {
            if header.protocol != Protocol::RtpAvpUdp {
                continue;
            }
            let (Some((server_port, _)), Some((client_port, _))) =
                (header.port_pair("server_port"), header.port_pair("client_port"))
            else {
                log::debug!("orchestrator: UDP transport header missing ports, skipping");
                continue;
            };
            let udp_key = FlowKey::new(
                (server, server_port),
                (client, client_port),
                Proto::Udp,
            );
            log::info!(
                "orchestrator: routing UDP {}:{} <-> {}:{} to session {:?}",
                server,
                server_port,
                client,
                client_port,
                flow_key
            );
            self.udp_route.insert(udp_key, flow_key);
        }
    }

    /// Flushes every RTSP session that hasn't reached `Done` yet (end of
    /// capture, no FIN seen). Exposed alongside [`Self::process_tcp_segment`]
    /// for fixture-driven tests.
    pub fn finish_pending_sessions(&mut self) {
        let keys: Vec<FlowKey> = self.sessions.keys().copied().collect();
        for flow_key in keys {
            let more = {
                let session = self.sessions.get_mut(&flow_key).unwrap();
                if session.state() == RtspSessionState::Done {
                    continue;
                }
                session.finish()
            };
            for rtp_bytes in more {
                self.on_rtp_bytes(flow_key, rtp_bytes.payload);
            }
            self.maybe_resolve(flow_key);
        }
    }

    fn second_pass(&mut self, capture: &Capture) -> Result<()> {
        for data in capture.frames()? {
            let ParsedFrame::Udp { src, dst, payload } = crate::capture::parse_frame(&data) else {
                continue;
            };
            self.process_udp_datagram(src, dst, payload);
        }
        Ok(())
    }

    /// Routes one UDP datagram to the RTSP session whose resolved transport
    /// headers claimed its 5-tuple, if any. Exposed alongside
    /// [`Self::process_tcp_segment`] for fixture-driven tests.
    pub fn process_udp_datagram(
        &mut self,
        src: (std::net::IpAddr, u16),
        dst: (std::net::IpAddr, u16),
        payload: bytes::Bytes,
    ) {
        let udp_key = FlowKey::new(src, dst, Proto::Udp);
        let Some(&session_key) = self.udp_route.get(&udp_key) else {
            return;
        };
        self.on_rtp_bytes(session_key, payload);
    }

    /// Parses raw RTP bytes (from either an interleaved frame's payload or
    /// a UDP datagram) and, if it parses, dispatches to `on_rtp`.
    fn on_rtp_bytes(&mut self, flow_key: FlowKey, bytes: bytes::Bytes) {
        match rtp::parse(bytes) {
            Ok(pkt) => self.on_rtp(flow_key, pkt),
            Err(e) => log::debug!("orchestrator: dropping malformed RTP packet: {}", e),
        }
    }

    /// spec.md §4.6, `OnRTP(flow_key, rtp)`.
    fn on_rtp(&mut self, flow_key: FlowKey, pkt: rtp::Packet) {
        let identity: Identity = (flow_key, pkt.ssrc, pkt.payload_type);
        if self.invalid_identities.contains(&identity) {
            return;
        }
        if let Some(&id) = self.identity_to_decoder.get(&identity) {
            if let Some(slot) = self.decoders.get_mut(&id) {
                slot.process_packet(pkt);
            }
            return;
        }

        let Some(session) = self.sessions.get(&flow_key) else {
            log::debug!("orchestrator: RTP for unknown flow {:?}, dropping", flow_key);
            self.invalid_identities.insert(identity);
            return;
        };
        let Some(sdp) = session.sdp.as_ref() else {
            log::warn!("orchestrator: RTP before SDP was known, dropping identity");
            self.invalid_identities.insert(identity);
            return;
        };
        let Some(media) = sdp.media.iter().find(|m| m.payload_type == Some(pkt.payload_type))
        else {
            log::warn!(
                "orchestrator: no SDP media for payload type {}, marking identity invalid",
                pkt.payload_type
            );
            self.invalid_identities.insert(identity);
            return;
        };

        let id = self.next_decoder_id;
        self.next_decoder_id += 1;
        let output_path = self.output_path(id);
        let slot_config = SlotConfig {
            output_path: output_path.clone(),
            format: self.config.format.clone(),
            default_video_codec: self.default_video_codec,
            default_audio_codec: self.default_audio_codec,
            force_video_codec: self.config.force_vcodec,
            force_audio_codec: self.config.force_acodec,
            fast: self.config.fast,
        };
        match DecoderSlot::new(media, slot_config) {
            Ok(mut slot) => {
                log::info!(
                    "orchestrator: created decoder {} for identity {:?} -> {}",
                    id,
                    identity,
                    output_path.display()
                );
                slot.process_packet(pkt);
                self.decoders.insert(id, slot);
                self.identity_to_decoder.insert(identity, id);
            }
            Err(e) => {
                log::error!("orchestrator: failed to create decoder slot: {}", e);
                self.invalid_identities.insert(identity);
            }
        }
    }

    /// Number of decoder slots created so far. Exposed for tests asserting
    /// how many streams were recovered from a fixture.
    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }

    /// Number of RTP identities the orchestrator gave up on (unknown flow,
    /// SDP not yet known, unmatched payload type, or decoder-slot init
    /// failure). Exposed for tests asserting a fixture's unsupported-codec
    /// path was taken.
    pub fn invalid_identity_count(&self) -> usize {
        self.invalid_identities.len()
    }

    fn output_path(&self, id: u64) -> PathBuf {
        self.config
            .output_dir
            .join(format!("{}{}.{}", self.config.prefix, id, self.config.format))
    }

    /// Flushes and closes every decoder slot. Errors during one slot's
    /// close are logged and do not stop the others from closing (spec.md
    /// §5, §7). Exposed alongside [`Self::process_tcp_segment`] for
    /// fixture-driven tests that don't go through [`Self::run`].
    pub fn close(&mut self) {
        let ids: Vec<u64> = self.decoders.keys().copied().collect();
        for id in ids {
            if let Some(slot) = self.decoders.get_mut(&id) {
                if let Err(e) = slot.close() {
                    log::error!("orchestrator: error closing decoder slot {}: {}", id, e);
                }
            }
        }
        if self.decoders.is_empty() {
            log::warn!("orchestrator: no RTSP streams found");
        } else {
            log::info!(
                "orchestrator: run finished, {} decoder slot(s) created, {} identity(ies) marked invalid",
                self.decoders.len(),
                self.invalid_identities.len()
            );
        }
    }
}

/// Computes the output directory a CLI invocation should default to when
/// none was given explicitly: the input file's basename, stripped of its
/// extension (spec.md §6).
pub fn default_output_dir(input: &Path) -> PathBuf {
    PathBuf::from(input.file_stem().unwrap_or(input.as_os_str()))
}
