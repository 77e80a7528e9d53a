//! Envelope framing over a byte stream.
//!
//! Each frame is an `EnvelopeHeader` followed by `length` payload bytes.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::FromBytes;

use shard_core::wire::{self, EnvelopeHeader, WireError, ENVELOPE_HEADER_LEN};
use shard_core::Envelope;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("stream i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad frame: {0}")]
    Wire(#[from] WireError),
}

/// Encode and write one envelope.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = wire::encode_envelope(envelope)?;
    write_frame(writer, &frame).await?;
    Ok(())
}

/// Write an already encoded frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Bytes) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read the next envelope. `Ok(None)` means the peer closed the stream
/// cleanly between frames.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Envelope>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; ENVELOPE_HEADER_LEN];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = EnvelopeHeader::read_from(&head[..]).ok_or(WireError::Truncated)?;
    let length = header.validate()?;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(header.into_envelope(Bytes::from(payload))?))
}
