//! Length-prefixed TCP framing. Every outbound send opens a fresh
//! connection, writes its frames, and closes; receivers read exact
//! byte counts and drop the connection on any violation.
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use log::warn;
use thiserror::Error;

use crate::crypto::SessionCrypto;
use crate::protocol::{ControlPacket, MAX_PACKET_SIZE};
use crate::throttle::Throttler;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(30);
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds packet ceiling")]
    Oversized(u32),
    #[error("connection closed mid-frame")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub enum FrameRead {
    Frame(Vec<u8>),
    /// Peer half-closed cleanly at a frame boundary.
    Eof,
}

/// Read one `u32 BE length | payload` frame. Oversized declarations fail
/// before any payload byte is read, so the caller can drop the connection
/// without buffering attacker-chosen amounts.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<FrameRead, FrameError> {
    let mut header = [0u8; 4];
    if !read_exact_or_eof(reader, &mut header)? {
        return Ok(FrameRead::Eof);
    }
    let len = u32::from_be_bytes(header);
    if len as usize > MAX_PACKET_SIZE {
        return Err(FrameError::Oversized(len));
    }
    let mut payload = vec![0u8; len as usize];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Err(FrameError::Truncated);
    }
    Ok(FrameRead::Frame(payload))
}

/// Fill `buf` completely. Ok(false) means EOF before the first byte;
/// EOF partway through is a framing violation.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(FrameError::Truncated);
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large for u32 header"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)
}

/// One-shot framed send. Returns false (logged) on any failure; callers
/// treat an unreachable peer as a delivery miss, not an error.
pub fn send_data(ip: IpAddr, port: u16, payload: &[u8]) -> bool {
    let addr = SocketAddr::new(ip, port);
    let attempt = (|| -> Result<()> {
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_write_timeout(Some(CONNECT_TIMEOUT))?;
        write_frame(&mut stream, payload)?;
        Ok(())
    })();
    match attempt {
        Ok(()) => true,
        Err(e) => {
            warn!("[Client] send failed ({addr}): {e}");
            false
        }
    }
}

/// Bind the receive listener to the first free port in the range.
pub fn bind_in_range(host: &str, start_port: u16, max_port: u16) -> Result<(TcpListener, u16)> {
    for port in start_port..=max_port {
        if let Ok(listener) = TcpListener::bind((host, port)) {
            return Ok((listener, port));
        }
    }
    bail!("no free TCP port in {start_port}..={max_port}")
}

/// Stream a file to an accepting peer: one encrypted FILE_STREAM_START
/// header frame, then per-chunk encrypted frames. The clean close at the
/// end is what signals end-of-stream to the receiver.
pub fn send_file_stream(
    ip: IpAddr,
    port: u16,
    path: &Path,
    req_id: &str,
    crypto: &SessionCrypto,
    throttler: &mut Throttler,
    expected_size: u64,
    expected_sha256: &str,
) -> bool {
    let attempt = stream_file(
        ip,
        port,
        path,
        req_id,
        crypto,
        throttler,
        expected_size,
        expected_sha256,
    );
    match attempt {
        Ok(()) => true,
        Err(e) => {
            warn!("[Transfer] stream send error ({req_id}): {e}");
            false
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_file(
    ip: IpAddr,
    port: u16,
    path: &Path,
    req_id: &str,
    crypto: &SessionCrypto,
    throttler: &mut Throttler,
    expected_size: u64,
    expected_sha256: &str,
) -> Result<()> {
    let addr = SocketAddr::new(ip, port);
    let mut stream = TcpStream::connect_timeout(&addr, STREAM_TIMEOUT)?;
    stream.set_write_timeout(Some(STREAM_TIMEOUT))?;

    let header = ControlPacket::FileStreamStart {
        req_id: req_id.to_string(),
        expected_size,
        expected_sha256: expected_sha256.to_string(),
    };
    let enc_header = crypto.encrypt(&serde_json::to_vec(&header)?)?;
    write_frame(&mut stream, &enc_header)?;

    let mut file = File::open(path)?;
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = crypto.encrypt(&buf[..n])?;
        // Throttle on ciphertext size: that is what actually hits the wire.
        throttler.wait_for_tokens(chunk.len());
        write_frame(&mut stream, &chunk)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"payload").unwrap();
        let mut cursor = Cursor::new(wire);
        match read_frame(&mut cursor).unwrap() {
            FrameRead::Frame(p) => assert_eq!(p, b"payload"),
            FrameRead::Eof => panic!("expected frame"),
        }
        assert!(matches!(read_frame(&mut cursor).unwrap(), FrameRead::Eof));
    }

    #[test]
    fn oversized_header_rejected_before_payload_read() {
        let len = (MAX_PACKET_SIZE as u32) + 1;
        let mut cursor = Cursor::new(len.to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FrameError::Oversized(_))
        ));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(wire);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut cursor = Cursor::new(vec![0u8, 0]);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn empty_frame_roundtrips() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"").unwrap();
        let mut cursor = Cursor::new(wire);
        match read_frame(&mut cursor).unwrap() {
            FrameRead::Frame(p) => assert!(p.is_empty()),
            FrameRead::Eof => panic!("expected frame"),
        }
    }
}
