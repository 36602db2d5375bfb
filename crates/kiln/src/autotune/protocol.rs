//! Wire protocol between the pool and its workers.
//!
//! Each message is a fixed 16-byte little-endian header,
//! `(job_id: i64, payload_len: u64)`, followed by `payload_len` payload
//! bytes. A negative job id
//! is the shutdown sentinel. Job failures travel as a formatted-text summary
//! (trace objects do not cross the process boundary); the parent wraps that
//! text in a typed error.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Job id meaning "shut down" in either direction.
pub const SHUTDOWN_JOB_ID: i64 = -1;

const HEADER_LEN: usize = 16;

/// Result of one job as serialized by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobOutcome {
    Ok(Vec<u8>),
    /// Formatted error or panic text captured inside the worker.
    Err(String),
}

/// Writes one framed message and flushes.
pub fn write_frame<W: Write>(writer: &mut W, job_id: i64, payload: &[u8]) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[..8].copy_from_slice(&job_id.to_le_bytes());
    header[8..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    writer.write_all(&header)?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    writer.flush()
}

/// Reads one framed message. `Ok(None)` means the peer closed the stream
/// cleanly at a frame boundary; a partial header or body is an error.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<(i64, Vec<u8>)>> {
    let mut header = [0u8; HEADER_LEN];
    if !read_exact_or_eof(reader, &mut header)? {
        return Ok(None);
    }
    let job_id = i64::from_le_bytes(header[..8].try_into().expect("header is 16 bytes"));
    let length = u64::from_le_bytes(header[8..].try_into().expect("header is 16 bytes"));
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some((job_id, payload)))
}

/// Fills `buf` completely, or returns `false` when the stream ended before
/// the first byte.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed mid-frame",
                ))
            }
            Ok(count) => filled += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}
