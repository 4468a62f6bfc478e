//! Flow identity: the unordered endpoint pair used to correlate packets
//! belonging to the same TCP or UDP conversation.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

/// An unordered `(addr:port, addr:port)` pair plus transport protocol.
///
/// Two packets traveling in opposite directions of the same conversation
/// hash and compare equal, since the two endpoints are canonicalized by
/// sorting on construction (see spec.md §3, "Flow key").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    a: (IpAddr, u16),
    b: (IpAddr, u16),
    proto: Proto,
}

impl FlowKey {
    pub fn new(src: (IpAddr, u16), dst: (IpAddr, u16), proto: Proto) -> Self {
        let (a, b) = if (src.0, src.1) <= (dst.0, dst.1) {
            (src, dst)
        } else {
            (dst, src)
        };
        Self { a, b, proto }
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(ip: &str, port: u16) -> (IpAddr, u16) {
        (ip.parse().unwrap(), port)
    }

    #[test]
    fn same_flow_both_directions() {
        let a = ep("10.0.0.1", 554);
        let b = ep("10.0.0.2", 49210);
        let forward = FlowKey::new(a, b, Proto::Tcp);
        let reverse = FlowKey::new(b, a, Proto::Tcp);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn different_protocol_different_flow() {
        let a = ep("10.0.0.1", 554);
        let b = ep("10.0.0.2", 49210);
        assert_ne!(FlowKey::new(a, b, Proto::Tcp), FlowKey::new(a, b, Proto::Udp));
    }
}
