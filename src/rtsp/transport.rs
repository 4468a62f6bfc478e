//! `Transport` response header parsing (RFC 2326 §12.39), as returned by a
//! SETUP response.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    RtpAvpUdp,
    RtpAvpTcp,
    Other,
}

impl Protocol {
    fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => Self::RtpAvpUdp,
            "RTP/AVP/TCP" => Self::RtpAvpTcp,
            _ => Self::Other,
        }
    }
}

/// One `Transport:` header value. A SETUP response may list several
/// comma-separated transport specs; the caller picks the one it asked for
/// (or the first, if the server didn't echo a choice back unambiguously).
#[derive(Debug, Clone)]
pub struct TransportHeader {
    pub protocol: Protocol,
    options: HashMap<String, Option<String>>,
}

impl TransportHeader {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(&key.to_ascii_lowercase())
            .and_then(|v| v.as_deref())
    }

    pub fn has_option(&self, key: &str) -> bool {
        self.options.contains_key(&key.to_ascii_lowercase())
    }

    /// `client_port=<rtp>-<rtcp>` or `server_port=<rtp>-<rtcp>`, the RTP half.
    pub fn port_pair(&self, key: &str) -> Option<(u16, u16)> {
        let v = self.option(key)?;
        let (a, b) = v.split_once('-')?;
        Some((a.parse().ok()?, b.parse().ok()?))
    }

    /// `interleaved=<rtp channel>-<rtcp channel>`.
    pub fn interleaved_channels(&self) -> Option<(u8, u8)> {
        self.port_pair_u8("interleaved")
    }

    fn port_pair_u8(&self, key: &str) -> Option<(u8, u8)> {
        let v = self.option(key)?;
        let (a, b) = v.split_once('-')?;
        Some((a.parse().ok()?, b.parse().ok()?))
    }

    pub fn ssrc(&self) -> Option<u32> {
        u32::from_str_radix(self.option("ssrc")?, 16).ok()
    }
}

/// Parse every comma-separated transport spec in a `Transport:` header
/// value, in order.
pub fn parse_all(header: &str) -> Vec<TransportHeader> {
    header.split(',').map(|s| parse_one(s.trim())).collect()
}

fn parse_one(spec: &str) -> TransportHeader {
    let mut parts = spec.split(';');
    let protocol = Protocol::parse(parts.next().unwrap_or(""));
    let mut options = HashMap::new();
    for opt in parts {
        match opt.split_once('=') {
            Some((k, v)) => {
                options.insert(k.trim().to_ascii_lowercase(), Some(v.trim().to_string()));
            }
            None if !opt.trim().is_empty() => {
                options.insert(opt.trim().to_ascii_lowercase(), None);
            }
            None => {}
        }
    }
    TransportHeader { protocol, options }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_interleaved() {
        let v = parse_all("RTP/AVP/TCP;unicast;interleaved=0-1");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].protocol, Protocol::RtpAvpTcp);
        assert_eq!(v[0].interleaved_channels(), Some((0, 1)));
        assert!(v[0].has_option("unicast"));
    }

    #[test]
    fn parses_udp_with_ports_and_ssrc() {
        let v = parse_all(
            "RTP/AVP;unicast;client_port=50000-50001;server_port=6970-6971;ssrc=1A2B3C4D",
        );
        let t = &v[0];
        assert_eq!(t.protocol, Protocol::RtpAvpUdp);
        assert_eq!(t.port_pair("client_port"), Some((50000, 50001)));
        assert_eq!(t.port_pair("server_port"), Some((6970, 6971)));
        assert_eq!(t.ssrc(), Some(0x1A2B3C4D));
    }

    #[test]
    fn parses_multiple_comma_separated_specs() {
        let v = parse_all("RTP/AVP/TCP;interleaved=0-1,RTP/AVP/TCP;interleaved=2-3");
        assert_eq!(v.len(), 2);
        assert_eq!(v[1].interleaved_channels(), Some((2, 3)));
    }
}
