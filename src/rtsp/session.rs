//! Per-TCP-flow RTSP session state machine.
//!
//! Consumes reassembled server-to-client bytes, interprets DESCRIBE and
//! SETUP responses, and transitions into interleaved RTP framing once the
//! transport is known to be TCP-interleaved. See SPEC_FULL.md §4.3.

use bytes::Bytes;
use std::net::IpAddr;

use crate::reassembler::{Reassembler, SeqAdvance, Skipped};
use crate::rtsp::interleaved;
use crate::rtsp::response::{self, ParseError};
use crate::rtsp::transport::{self, Protocol, TransportHeader};
use crate::sdp::{self, SessionDescription};

/// Well-known RTSP server ports, as observed by the source-port of
/// server-to-client TCP segments (taken from Wireshark's default RTSP
/// port list).
pub const RTSP_PORTS: [u16; 3] = [554, 8554, 7236];

const TCP_SEQ_BITS: u32 = 32;
const MAX_OUT_OF_ORDER: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ProcessingRtsp,
    RtspReady,
    ProcessingRtp,
    Done,
}

/// An RTP packet recovered from an interleaved TCP frame, ready for the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct InterleavedRtp {
    pub channel: u8,
    pub payload: Bytes,
}

pub struct RtspSession {
    state: State,
    reassembler: Reassembler<Bytes>,
    accumulator: Vec<u8>,
    server_addr: Option<IpAddr>,
    client_addr: Option<IpAddr>,
    pub sdp: Option<SessionDescription>,
    pub transport_headers: Vec<TransportHeader>,
    data_channels: Vec<u8>,
    control_channels: Vec<u8>,
}

impl RtspSession {
    pub fn new() -> Self {
        Self {
            state: State::ProcessingRtsp,
            reassembler: Reassembler::new(TCP_SEQ_BITS, MAX_OUT_OF_ORDER, SeqAdvance::Data),
            accumulator: Vec::new(),
            server_addr: None,
            client_addr: None,
            sdp: None,
            transport_headers: Vec::new(),
            data_channels: Vec::new(),
            control_channels: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// `(server, client)` addresses, fixed by the first accepted segment.
    /// `None` until at least one server-to-client segment has been seen.
    pub fn endpoints(&self) -> Option<(IpAddr, IpAddr)> {
        Some((self.server_addr?, self.client_addr?))
    }

    /// Feed one server-to-client TCP segment (already truncated to urgent
    /// data, if applicable). `seq` is the segment's TCP sequence number.
    /// Returns any RTP packets recovered this call (only non-empty once the
    /// session is `ProcessingRtp`).
    pub fn process_segment(
        &mut self,
        server_addr: IpAddr,
        client_addr: IpAddr,
        seq: u32,
        data: Bytes,
    ) -> Vec<InterleavedRtp> {
        if self.state == State::Done {
            return Vec::new();
        }
        if self.server_addr.is_none() {
            self.server_addr = Some(server_addr);
            self.client_addr = Some(client_addr);
        }
        let drained = self.reassembler.process(Some(data), seq as u64);
        self.consume_drained(drained)
    }

    /// Signal end of flow (FIN or end of capture).
    pub fn finish(&mut self) -> Vec<InterleavedRtp> {
        if self.state == State::Done {
            return Vec::new();
        }
        let drained = self.reassembler.process(None, 0);
        let mut out = self.consume_drained(drained);
        if self.state != State::Done {
            self.state = State::Done;
        }
        out
    }

    fn consume_drained(&mut self, drained: Vec<(Option<Bytes>, Skipped)>) -> Vec<InterleavedRtp> {
        let mut out = Vec::new();
        for (chunk, skipped) in drained {
            let Some(chunk) = chunk else { continue };
            match self.state {
                State::ProcessingRtsp | State::RtspReady => {
                    if skipped.0 {
                        if self.fully_discovered() {
                            log::debug!("rtsp session: fully discovered despite late loss");
                            self.state = State::Done;
                            self.maybe_enter_rtp();
                            continue;
                        }
                        log::warn!("rtsp session: lost a segment, resynchronizing");
                        self.accumulator.clear();
                    }
                    self.accumulator.extend_from_slice(&chunk);
                    self.drain_responses();
                }
                State::ProcessingRtp => {
                    if skipped.0 {
                        log::debug!("rtsp session: interleaved framing lost sync, rescanning for '$'");
                        self.accumulator.clear();
                    }
                    self.accumulator.extend_from_slice(&chunk);
                    out.extend(self.drain_interleaved());
                }
                State::Done => {}
            }
        }
        out
    }

    fn fully_discovered(&self) -> bool {
        match &self.sdp {
            Some(sdp) => self.transport_headers.len() == sdp.media.len(),
            None => false,
        }
    }

    fn drain_responses(&mut self) {
        loop {
            match response::parse(&self.accumulator) {
                Ok((resp, consumed)) => {
                    self.accumulator.drain(..consumed);
                    self.classify(resp);
                    if self.state == State::Done {
                        return;
                    }
                }
                Err(ParseError::NeedMore) => return,
                Err(e) => {
                    log::warn!("rtsp session: failed to parse response ({}), resynchronizing", e);
                    self.accumulator.clear();
                    return;
                }
            }
        }
    }

    fn classify(&mut self, resp: response::Response) {
        let is_200 = resp.status == 200;
        if is_200
            && resp
                .header("content-type")
                .map(|v| v.eq_ignore_ascii_case("application/sdp"))
                .unwrap_or(false)
            && !resp.body.is_empty()
        {
            match std::str::from_utf8(&resp.body).ok().and_then(|s| sdp::parse(s).ok()) {
                Some(sdp) => {
                    log::info!("rtsp session: SDP received, {} media section(s)", sdp.media.len());
                    self.sdp = Some(sdp);
                    self.state = State::RtspReady;
                    if self.fully_discovered() {
                        self.state = State::Done;
                        self.maybe_enter_rtp();
                    }
                }
                None => log::warn!("rtsp session: failed to parse SDP body"),
            }
            return;
        }
        if is_200 {
            if let Some(value) = resp.header("transport") {
                for parsed in transport::parse_all(value) {
                    log::info!(
                        "rtsp session: transport header {} of {:?} received",
                        self.transport_headers.len() + 1,
                        self.sdp.as_ref().map(|s| s.media.len())
                    );
                    if let Some((data, control)) = parsed.interleaved_channels() {
                        self.data_channels.push(data);
                        self.control_channels.push(control);
                    }
                    self.transport_headers.push(parsed);
                }
                if self.fully_discovered() {
                    self.state = State::Done;
                    self.maybe_enter_rtp();
                }
                return;
            }
            // A PLAY response carrying RTP-Info means the server has already
            // started sending media; whatever transports we've discovered so
            // far are final even if we never saw one SETUP response per SDP
            // media section (e.g. a track the client never SETUP'd).
            if resp.header("rtp-info").is_some() && self.state != State::Done {
                log::debug!("rtsp session: RTP-Info on PLAY response, ending discovery");
                self.state = State::Done;
                self.maybe_enter_rtp();
            }
        }
    }

    fn maybe_enter_rtp(&mut self) {
        let interleaved = self
            .transport_headers
            .iter()
            .any(|t| t.protocol == Protocol::RtpAvpTcp);
        if interleaved {
            log::debug!("rtsp session: switching to interleaved RTP framing");
            self.state = State::ProcessingRtp;
            self.accumulator.clear();
        }
    }

    fn drain_interleaved(&mut self) -> Vec<InterleavedRtp> {
        let mut out = Vec::new();
        loop {
            if self.accumulator.is_empty() {
                return out;
            }
            if self.accumulator[0] != b'$' {
                match self.accumulator.iter().position(|&b| b == b'$') {
                    Some(pos) => {
                        self.accumulator.drain(..pos);
                    }
                    None => {
                        self.accumulator.clear();
                        return out;
                    }
                }
                continue;
            }
            let buf = Bytes::copy_from_slice(&self.accumulator);
            match interleaved::parse(&buf) {
                Ok((frame, consumed)) => {
                    let valid_len = (12..=8192).contains(&frame.payload.len());
                    let known_channel = self.data_channels.contains(&frame.channel)
                        || self.control_channels.contains(&frame.channel);
                    if !valid_len || !known_channel {
                        log::debug!(
                            "interleaved framing: rejecting frame on channel {} (len {}), \
                             rescanning for next '$'",
                            frame.channel,
                            frame.payload.len()
                        );
                        // Don't trust the claimed length: it may be why
                        // validation failed. Drop only the '$' we scanned to
                        // and rescan from the next byte (spec.md §4.4).
                        self.accumulator.drain(..1);
                        continue;
                    }
                    self.accumulator.drain(..consumed);
                    if self.data_channels.contains(&frame.channel) {
                        out.push(InterleavedRtp {
                            channel: frame.channel,
                            payload: frame.payload,
                        });
                    }
                }
                Err(interleaved::FrameError::NeedMore) => return out,
                Err(interleaved::FrameError::NotInterleaved) => unreachable!(),
            }
        }
    }
}

impl Default for RtspSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> (IpAddr, IpAddr) {
        ("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap())
    }

    const DESCRIBE_RESPONSE: &[u8] = b"RTSP/1.0 200 OK\r\n\
CSeq: 2\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 129\r\n\
\r\n\
v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=No Name\r\nt=0 0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:track1\r\n";

    #[test]
    fn sdp_response_sets_ready_state() {
        let (server, client) = addr();
        let mut session = RtspSession::new();
        session.process_segment(server, client, 1000, Bytes::from_static(DESCRIBE_RESPONSE));
        assert!(session.sdp.is_some());
        assert_eq!(session.state(), State::RtspReady);
    }

    #[test]
    fn udp_session_is_done_once_transport_count_matches_sdp() {
        let (server, client) = addr();
        let mut session = RtspSession::new();
        session.process_segment(server, client, 1000, Bytes::from_static(DESCRIBE_RESPONSE));
        let setup = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nTransport: RTP/AVP;client_port=5000-5001;server_port=6000-6001\r\n\r\n";
        session.process_segment(
            server,
            client,
            1000 + DESCRIBE_RESPONSE.len() as u32,
            Bytes::from_static(setup),
        );
        assert_eq!(session.state(), State::Done);
        assert_eq!(session.transport_headers.len(), 1);
    }

    #[test]
    fn interleaved_transport_switches_to_rtp_framing() {
        let (server, client) = addr();
        let mut session = RtspSession::new();
        session.process_segment(server, client, 1000, Bytes::from_static(DESCRIBE_RESPONSE));
        let setup = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nTransport: RTP/AVP/TCP;interleaved=0-1\r\n\r\n";
        session.process_segment(
            server,
            client,
            1000 + DESCRIBE_RESPONSE.len() as u32,
            Bytes::from_static(setup),
        );
        assert_eq!(session.state(), State::ProcessingRtp);

        let mut frame = vec![b'$', 0, 0, 12];
        frame.extend(std::iter::repeat(0u8).take(12));
        let seq = 1000 + DESCRIBE_RESPONSE.len() as u32 + setup.len() as u32;
        let got = session.process_segment(server, client, seq, Bytes::from(frame));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].channel, 0);
    }

    #[test]
    fn finish_drains_and_marks_done() {
        let (server, client) = addr();
        let mut session = RtspSession::new();
        session.process_segment(server, client, 1000, Bytes::from_static(b"RTSP/1.0 200 OK\r\n"));
        session.finish();
        assert_eq!(session.state(), State::Done);
    }
}
