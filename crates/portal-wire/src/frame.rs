use std::io::{self, IoSlice, Read, Write};

use portal_utils::safe_panic;

/// Length prefix size, little-endian.
const LEN_HEADER_SIZE: usize = core::mem::size_of::<u32>();

/// Default ceiling on a single frame's payload size (4 GiB - 1, the largest
/// value a `u32` length prefix can express).
pub const DEFAULT_MAX_MSG_SIZE: usize = u32::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("peer reset the connection")]
    Reset,
    #[error("frame length {len} outside 1..={max}")]
    BadLength { len: usize, max: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outbound frame: one or more byte segments plus the length prefix that
/// covers their total size. Built once per send and drained by repeated
/// [`SendBuffer::send`] calls as the socket allows.
///
/// Mirrors the teacher's `TcpStream` staging buffer, minus the per-frame
/// timestamp header this protocol doesn't use.
pub struct SendBuffer {
    header: [u8; LEN_HEADER_SIZE],
    segments: Vec<Vec<u8>>,
    header_sent: usize,
    segment_idx: usize,
    segment_sent: usize,
}

impl SendBuffer {
    pub fn new(segments: Vec<Vec<u8>>, max_msg_size: usize) -> Result<Self, FrameError> {
        let total: usize = segments.iter().map(Vec::len).sum();
        if total == 0 || total > max_msg_size {
            return Err(FrameError::BadLength { len: total, max: max_msg_size });
        }
        Ok(Self {
            header: (total as u32).to_le_bytes(),
            segments,
            header_sent: 0,
            segment_idx: 0,
            segment_sent: 0,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.segment_idx >= self.segments.len()
    }

    /// Writes as much of the frame as the socket will accept without
    /// blocking. Returns bytes written, or `FrameError::Reset`/`Io` on
    /// failure. Safe to call repeatedly until [`SendBuffer::is_complete`].
    pub fn send(&mut self, sock: &mut impl Write) -> Result<usize, FrameError> {
        let mut slices = Vec::with_capacity(1 + self.segments.len() - self.segment_idx);
        if self.header_sent < LEN_HEADER_SIZE {
            slices.push(IoSlice::new(&self.header[self.header_sent..]));
        }
        for (i, segment) in self.segments[self.segment_idx..].iter().enumerate() {
            let start = if i == 0 { self.segment_sent } else { 0 };
            slices.push(IoSlice::new(&segment[start..]));
        }

        let n = match sock.write_vectored(&slices) {
            Ok(0) => return Err(FrameError::Reset),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(FrameError::Io(e)),
        };

        self.advance(n);
        Ok(n)
    }

    fn advance(&mut self, mut n: usize) {
        if self.header_sent < LEN_HEADER_SIZE {
            let take = n.min(LEN_HEADER_SIZE - self.header_sent);
            self.header_sent += take;
            n -= take;
        }
        while n > 0 && self.segment_idx < self.segments.len() {
            let remaining = self.segments[self.segment_idx].len() - self.segment_sent;
            let take = n.min(remaining);
            self.segment_sent += take;
            n -= take;
            if self.segment_sent == self.segments[self.segment_idx].len() {
                self.segment_idx += 1;
                self.segment_sent = 0;
            }
        }
    }
}

enum RxPhase {
    Header { buf: [u8; LEN_HEADER_SIZE], have: usize },
    Payload { buf: Vec<u8>, have: usize },
}

/// Incremental, non-blocking frame receiver. Fills the 4-byte length header
/// first, then a payload buffer of exactly that length.
pub struct RecvBuffer {
    phase: RxPhase,
    max_msg_size: usize,
}

impl RecvBuffer {
    pub fn new(max_msg_size: usize) -> Self {
        Self { phase: RxPhase::Header { buf: [0; LEN_HEADER_SIZE], have: 0 }, max_msg_size }
    }

    /// Reads as much as the socket offers without blocking. Returns
    /// `Some(payload)` once a full frame has been assembled (the buffer
    /// resets to await the next frame's header), `None` if more data is
    /// still needed.
    pub fn recv(&mut self, sock: &mut impl Read) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            match &mut self.phase {
                RxPhase::Header { buf, have } => {
                    while *have < LEN_HEADER_SIZE {
                        match sock.read(&mut buf[*have..]) {
                            Ok(0) => return Err(FrameError::Reset),
                            Ok(n) => *have += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                            Err(e) => return Err(FrameError::Io(e)),
                        }
                    }
                    let len = u32::from_le_bytes(*buf) as usize;
                    if len == 0 || len > self.max_msg_size {
                        return Err(FrameError::BadLength { len, max: self.max_msg_size });
                    }
                    self.phase = RxPhase::Payload { buf: vec![0; len], have: 0 };
                }
                RxPhase::Payload { buf, have } => {
                    while *have < buf.len() {
                        match sock.read(&mut buf[*have..]) {
                            Ok(0) => return Err(FrameError::Reset),
                            Ok(n) => *have += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                            Err(e) => return Err(FrameError::Io(e)),
                        }
                    }
                    let RxPhase::Payload { buf, .. } =
                        std::mem::replace(&mut self.phase, RxPhase::Header { buf: [0; LEN_HEADER_SIZE], have: 0 })
                    else {
                        safe_panic!("payload phase vanished during frame completion");
                        return Err(FrameError::Reset);
                    };
                    return Ok(Some(buf));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn send_then_recv_round_trips() {
        let mut send = SendBuffer::new(vec![b"hello ".to_vec(), b"world".to_vec()], DEFAULT_MAX_MSG_SIZE).unwrap();
        let mut out = Vec::new();
        while !send.is_complete() {
            send.send(&mut out).unwrap();
        }

        let mut recv = RecvBuffer::new(DEFAULT_MAX_MSG_SIZE);
        let mut cursor = Cursor::new(out);
        let payload = loop {
            if let Some(p) = recv.recv(&mut cursor).unwrap() {
                break p;
            }
        };
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn rejects_empty_frame() {
        assert!(matches!(
            SendBuffer::new(vec![], DEFAULT_MAX_MSG_SIZE),
            Err(FrameError::BadLength { len: 0, .. })
        ));
    }

    #[test]
    fn rejects_oversize_length_on_recv() {
        let mut recv = RecvBuffer::new(4);
        let mut bytes = Cursor::new(100u32.to_le_bytes().to_vec());
        assert!(matches!(recv.recv(&mut bytes), Err(FrameError::BadLength { .. })));
    }
}
