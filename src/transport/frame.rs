//! # Wire Frame Envelope
//!
//! Every message exchanged with a daemon travels in a length-prefixed
//! envelope:
//!
//! ```text
//! [magic:4][frame_kind:1][reserved:3][payload_len:8][payload:N]
//! [ext_count:4]{[tag_len:2][tag:L][blob_len:8][blob:B]}*
//! ```
//!
//! All integers are big-endian. The extension entries carry codec
//! side-channel data (see `crate::codec`); the payload itself is opaque to
//! the core. Decoding validates the magic, the frame kind, and every length
//! field against hard caps before allocating.

use super::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic bytes identifying a taskgrid frame, version 1.
pub const MAGIC: [u8; 4] = *b"TGF1";

/// Upper bound on a single payload. Oversized frames are rejected before
/// allocation so a corrupt length prefix cannot OOM the process.
pub const MAX_PAYLOAD_BYTES: u64 = 256 * 1024 * 1024;

/// Upper bound on a single extension blob.
pub const MAX_EXT_BLOB_BYTES: u64 = 64 * 1024 * 1024;

/// Upper bound on the number of extension entries per frame.
pub const MAX_EXT_ENTRIES: u32 = 4096;

/// Frame kinds on the daemon wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A task to evaluate.
    Task = 0,
    /// Sticky-setup payload; the daemon applies it and acks.
    Setup = 1,
    /// Cancel the in-flight task whose id is carried in the payload.
    Cancel = 2,
    /// Successful evaluation result.
    ResultOk = 3,
    /// Evaluation error; payload carries message + stack frames.
    ResultErr = 4,
    /// Evaluation was interrupted before completion.
    ResultInterrupt = 5,
    /// Orderly teardown; the daemon exits cleanly.
    Shutdown = 6,
}

impl FrameKind {
    fn from_wire(byte: u8) -> Result<Self, TransportError> {
        Ok(match byte {
            0 => FrameKind::Task,
            1 => FrameKind::Setup,
            2 => FrameKind::Cancel,
            3 => FrameKind::ResultOk,
            4 => FrameKind::ResultErr,
            5 => FrameKind::ResultInterrupt,
            6 => FrameKind::Shutdown,
            other => return Err(TransportError::UnknownFrameKind(other)),
        })
    }
}

/// A decoded wire frame: kind, opaque payload, and ordered extension
/// entries of `(class_tag, blob)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
    pub extensions: Vec<(String, Vec<u8>)>,
}

impl Frame {
    /// Build a frame with no extension entries.
    pub fn bare(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            extensions: Vec::new(),
        }
    }

    /// Encode the frame into a contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        let ext_bytes: usize = self
            .extensions
            .iter()
            .map(|(tag, blob)| 2 + tag.len() + 8 + blob.len())
            .sum();
        let mut buf = Vec::with_capacity(4 + 1 + 3 + 8 + self.payload.len() + 4 + ext_bytes);

        buf.extend_from_slice(&MAGIC);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&[0u8; 3]); // reserved
        buf.extend_from_slice(&(self.payload.len() as u64).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&(self.extensions.len() as u32).to_be_bytes());
        for (tag, blob) in &self.extensions {
            buf.extend_from_slice(&(tag.len() as u16).to_be_bytes());
            buf.extend_from_slice(tag.as_bytes());
            buf.extend_from_slice(&(blob.len() as u64).to_be_bytes());
            buf.extend_from_slice(blob);
        }
        buf
    }
}

/// Write a frame to an async stream and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode();
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from an async stream.
///
/// Returns `TransportError::PeerClosed` on clean EOF at a frame boundary;
/// a mid-frame EOF surfaces as an I/O error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4 + 1 + 3 + 8];
    if let Err(e) = reader.read_exact(&mut header[..1]).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(TransportError::PeerClosed);
        }
        return Err(e.into());
    }
    reader.read_exact(&mut header[1..]).await?;

    if header[..4] != MAGIC {
        return Err(TransportError::BadMagic);
    }
    let kind = FrameKind::from_wire(header[4])?;
    // header[5..8] reserved, ignored on read
    let payload_len = u64::from_be_bytes(header[8..16].try_into().expect("fixed slice"));
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(TransportError::FrameTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload).await?;

    let mut count_bytes = [0u8; 4];
    reader.read_exact(&mut count_bytes).await?;
    let ext_count = u32::from_be_bytes(count_bytes);
    if ext_count > MAX_EXT_ENTRIES {
        return Err(TransportError::FrameTooLarge(ext_count as u64));
    }

    let mut extensions = Vec::with_capacity(ext_count as usize);
    for _ in 0..ext_count {
        let mut tag_len_bytes = [0u8; 2];
        reader.read_exact(&mut tag_len_bytes).await?;
        let tag_len = u16::from_be_bytes(tag_len_bytes) as usize;
        let mut tag_bytes = vec![0u8; tag_len];
        reader.read_exact(&mut tag_bytes).await?;
        let tag = String::from_utf8(tag_bytes)
            .map_err(|_| TransportError::MalformedFrame("extension tag is not UTF-8"))?;

        let mut blob_len_bytes = [0u8; 8];
        reader.read_exact(&mut blob_len_bytes).await?;
        let blob_len = u64::from_be_bytes(blob_len_bytes);
        if blob_len > MAX_EXT_BLOB_BYTES {
            return Err(TransportError::FrameTooLarge(blob_len));
        }
        let mut blob = vec![0u8; blob_len as usize];
        reader.read_exact(&mut blob).await?;
        extensions.push((tag, blob));
    }

    Ok(Frame {
        kind,
        payload,
        extensions,
    })
}
