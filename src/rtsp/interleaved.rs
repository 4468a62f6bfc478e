//! RTSP interleaved binary data framing (RFC 2326 §10.12): `$` + 1-byte
//! channel id + 2-byte big-endian length + payload, multiplexed onto the
//! same TCP connection as the RTSP control messages.

use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Frame {
    pub channel: u8,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("incomplete frame")]
    NeedMore,
    #[error("not an interleaved frame ('$' expected)")]
    NotInterleaved,
}

/// Attempt to parse one interleaved frame from the front of `buf`.
///
/// Returns the frame and the number of bytes consumed. The caller is
/// expected to have already determined (by peeking the first byte) that
/// this is binary data rather than the start of an RTSP response; this
/// function itself only checks for the `$` marker as a consistency check.
pub fn parse(buf: &Bytes) -> Result<(Frame, usize), FrameError> {
    if buf.is_empty() {
        return Err(FrameError::NeedMore);
    }
    if buf[0] != b'$' {
        return Err(FrameError::NotInterleaved);
    }
    if buf.len() < 4 {
        return Err(FrameError::NeedMore);
    }
    let channel = buf[1];
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let total = 4 + len;
    if buf.len() < total {
        return Err(FrameError::NeedMore);
    }
    Ok((
        Frame {
            channel,
            payload: buf.slice(4..total),
        },
        total,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_frame_and_reports_consumed() {
        let mut raw = vec![b'$', 0, 0, 4];
        raw.extend_from_slice(b"abcd");
        raw.extend_from_slice(b"trailing");
        let buf = Bytes::from(raw);
        let (frame, consumed) = parse(&buf).unwrap();
        assert_eq!(frame.channel, 0);
        assert_eq!(&frame.payload[..], b"abcd");
        assert_eq!(consumed, 8);
    }

    #[test]
    fn needs_more_for_partial_header() {
        let buf = Bytes::from_static(&[b'$', 1, 0]);
        assert_eq!(parse(&buf), Err(FrameError::NeedMore));
    }

    #[test]
    fn needs_more_for_partial_payload() {
        let buf = Bytes::from_static(&[b'$', 1, 0, 10, b'a', b'b']);
        assert_eq!(parse(&buf), Err(FrameError::NeedMore));
    }

    #[test]
    fn rejects_non_dollar_prefix() {
        let buf = Bytes::from_static(b"RTSP/1.0 200 OK\r\n");
        assert_eq!(parse(&buf), Err(FrameError::NotInterleaved));
    }
}
