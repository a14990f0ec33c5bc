use std::io::{self, ErrorKind, Read};

use thiserror::Error;

/// Frame length prefix: 4-byte big-endian `payload_length`.
const LEN_HEADER_SIZE: usize = 4;

/// Oversized frames terminate the connection (§4.1).
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("frame length exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge,
    #[error("transport error: {0}")]
    TransportError(#[from] io::Error),
}

/// Copy-able progress marker for the in-flight frame. The actual payload
/// bytes live in `FrameReader::body_buf`, not in this enum, so it stays
/// cheap to move around in the loop below (mirrors keeping the rx byte
/// buffer external to the small per-phase state enum).
#[derive(Clone, Copy)]
enum RxState {
    Header { buf: [u8; LEN_HEADER_SIZE], have: usize },
    Body { len: usize, have: usize },
}

impl Default for RxState {
    fn default() -> Self {
        RxState::Header { buf: [0; LEN_HEADER_SIZE], have: 0 }
    }
}

pub enum ReadOutcome {
    Frame(Vec<u8>),
    WouldBlock,
}

/// Per-connection inbound frame reassembly. A read delivered by an
/// edge-triggered readiness mechanism may contain fewer bytes than either
/// the length prefix or the body; `read_frame` suspends mid-phase and
/// resumes on the next call rather than requiring a complete frame in one
/// read. Callers loop `read_frame` until it returns `WouldBlock` or an
/// error, since one readable event can carry several whole frames.
#[derive(Default)]
pub struct FrameReader {
    state: RxState,
    body_buf: Vec<u8>,
}

impl FrameReader {
    pub fn read_frame<R: Read>(&mut self, r: &mut R) -> Result<ReadOutcome, FrameError> {
        loop {
            match self.state {
                RxState::Header { mut buf, mut have } => {
                    while have < LEN_HEADER_SIZE {
                        match r.read(&mut buf[have..]) {
                            Ok(0) => return Err(FrameError::PeerClosed),
                            Ok(n) => have += n,
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                                self.state = RxState::Header { buf, have };
                                return Ok(ReadOutcome::WouldBlock);
                            }
                            Err(e) => return Err(FrameError::from(e)),
                        }
                    }
                    let len = u32::from_be_bytes(buf);
                    if len > MAX_FRAME_LEN {
                        return Err(FrameError::FrameTooLarge);
                    }
                    self.body_buf.clear();
                    self.body_buf.resize(len as usize, 0);
                    self.state = RxState::Body { len: len as usize, have: 0 };
                }
                RxState::Body { len, mut have } => loop {
                    if have == len {
                        self.state = RxState::default();
                        return Ok(ReadOutcome::Frame(std::mem::take(&mut self.body_buf)));
                    }
                    match r.read(&mut self.body_buf[have..len]) {
                        Ok(0) => return Err(FrameError::PeerClosed),
                        Ok(n) => have += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            self.state = RxState::Body { len, have };
                            return Ok(ReadOutcome::WouldBlock);
                        }
                        Err(e) => return Err(FrameError::from(e)),
                    }
                },
            }
        }
    }
}

/// Encodes `payload` as one complete frame: 4-byte big-endian length prefix
/// followed by the payload bytes.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_HEADER_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use std::io::Result as IoResult;

    use super::*;

    /// Feeds fixed-size byte chunks to a `Read` impl, returning `WouldBlock`
    /// between chunks — the same shape of partial delivery an edge-triggered
    /// socket read produces.
    struct ChunkedReader {
        chunks: Vec<Vec<u8>>,
        blocked_since_last_chunk: bool,
    }

    impl ChunkedReader {
        fn new(bytes: &[u8], split_at: &[usize]) -> Self {
            let mut chunks = Vec::new();
            let mut prev = 0;
            for &at in split_at {
                chunks.push(bytes[prev..at].to_vec());
                prev = at;
            }
            chunks.push(bytes[prev..].to_vec());
            chunks.retain(|c| !c.is_empty());
            Self { chunks, blocked_since_last_chunk: false }
        }
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
            if self.chunks.is_empty() {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            if !self.blocked_since_last_chunk {
                self.blocked_since_last_chunk = true;
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            self.blocked_since_last_chunk = false;
            let chunk = self.chunks.remove(0);
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.insert(0, chunk[n..].to_vec());
            }
            Ok(n)
        }
    }

    #[test]
    fn round_trips_single_frame() {
        let wire = encode_frame(b"MOVE {}");
        let mut reader = ChunkedReader::new(&wire, &[]);
        let mut fr = FrameReader::default();
        loop {
            match fr.read_frame(&mut reader) {
                Ok(ReadOutcome::Frame(f)) => {
                    assert_eq!(f, b"MOVE {}");
                    break;
                }
                Ok(ReadOutcome::WouldBlock) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn survives_arbitrary_split_boundaries() {
        let a = encode_frame(b"LOGIN {\"username\":\"a\"}");
        let b = encode_frame(b"MOVE {}");
        let mut wire = a.clone();
        wire.extend_from_slice(&b);

        for split in 1..wire.len() {
            let mut reader = ChunkedReader::new(&wire, &[split]);
            let mut fr = FrameReader::default();
            let mut frames = Vec::new();
            loop {
                match fr.read_frame(&mut reader) {
                    Ok(ReadOutcome::Frame(f)) => frames.push(f),
                    Ok(ReadOutcome::WouldBlock) => {
                        if frames.len() == 2 {
                            break;
                        }
                    }
                    Err(e) => panic!("split at {split} failed: {e}"),
                }
            }
            assert_eq!(frames[0], b"LOGIN {\"username\":\"a\"}");
            assert_eq!(frames[1], b"MOVE {}");
        }
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut wire = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        wire.extend_from_slice(b"x");
        let mut reader = ChunkedReader::new(&wire, &[]);
        let mut fr = FrameReader::default();
        loop {
            match fr.read_frame(&mut reader) {
                Ok(ReadOutcome::WouldBlock) => continue,
                Ok(ReadOutcome::Frame(_)) => panic!("should not have produced a frame"),
                Err(FrameError::FrameTooLarge) => break,
                Err(e) => panic!("wrong error: {e}"),
            }
        }
    }

    #[test]
    fn peer_close_mid_header_is_reported() {
        let wire = vec![0u8, 0]; // 2 of 4 header bytes, then EOF
        struct EofAfter(Vec<u8>);
        impl Read for EofAfter {
            fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
                if self.0.is_empty() {
                    return Ok(0);
                }
                let n = self.0.len().min(buf.len());
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0.drain(..n);
                Ok(n)
            }
        }
        let mut reader = EofAfter(wire);
        let mut fr = FrameReader::default();
        match fr.read_frame(&mut reader) {
            Err(FrameError::PeerClosed) => {}
            other => panic!("expected PeerClosed, got {}", other.is_ok()),
        }
    }
}
