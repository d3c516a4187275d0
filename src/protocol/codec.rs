//! Length-framed envelope codec
//!
//! A frame is a `u32` little-endian length prefix followed by the bincode
//! serialization of one [`Envelope`]. The broker's connection workers
//! feed received bytes through [`FrameDecoder`], which tolerates partial
//! frames and yields one envelope per completed frame; the async helpers
//! read and write whole frames for client-side request/response use.

use anyhow::{anyhow, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::{Envelope, WireError};
use crate::defaults::{MAX_FRAME_LEN, WRITE_TIMEOUT};

/// Encode an envelope into a single framed byte vector
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = envelope.to_bytes()?;
    if body.len() > MAX_FRAME_LEN {
        return Err(anyhow!(WireError::FrameTooLarge(body.len(), MAX_FRAME_LEN)));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one whole envelope from a stream
///
/// Waits until the length prefix and the full frame body have arrived.
/// EOF before a complete frame surfaces as an I/O error, which callers
/// treat as disconnection.
pub async fn read_envelope<R>(stream: &mut R) -> Result<Envelope, WireError>
where
    R: AsyncRead + Unpin,
{
    // Read frame length (4 bytes)
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    // Validate frame length
    if frame_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(frame_len, MAX_FRAME_LEN));
    }

    // Read frame body
    let mut frame = vec![0u8; frame_len];
    stream.read_exact(&mut frame).await?;
    Envelope::from_bytes(&frame)
}

/// Write one whole envelope to a stream, bounded by [`WRITE_TIMEOUT`]
///
/// The timeout keeps the broker responsive when a peer stops draining its
/// RECV channel; the caller decides whether a timed-out peer is dropped.
pub async fn write_envelope<W>(stream: &mut W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope).map_err(|e| match e.downcast::<WireError>() {
        Ok(wire) => wire,
        Err(other) => WireError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            other.to_string(),
        )),
    })?;

    let write_fut = async {
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(()) as std::io::Result<()>
    };

    match timeout(WRITE_TIMEOUT, write_fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WireError::Io(e)),
        Err(_) => Err(WireError::WriteTimeout),
    }
}

/// Incremental frame extractor, the connection workers' read path
///
/// Bytes are appended as they arrive; [`FrameDecoder::next_envelope`]
/// yields an envelope once a complete frame is buffered and `None` on a
/// short read, leaving the partial frame in place for the next append.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes to the working buffer
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete envelope, if one is buffered
    ///
    /// A frame whose body fails to decode is consumed before the error is
    /// returned, so one bad envelope cannot wedge the stream; only an
    /// oversized length prefix leaves the buffer unusable.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>, WireError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(frame_len, MAX_FRAME_LEN));
        }
        if self.buf.len() < 4 + frame_len {
            return Ok(None);
        }
        let parsed = Envelope::from_bytes(&self.buf[4..4 + frame_len]);
        self.buf.drain(..4 + frame_len);
        parsed.map(Some)
    }

    /// Number of buffered bytes not yet consumed
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Operation, Originator};

    fn sample(payload: Vec<u8>) -> Envelope {
        Envelope::request(Operation::Send, Originator::AppClient)
            .with_route("app_a", "app_b")
            .with_payload(payload)
    }

    /// Test that a frame decodes back to the envelope that produced it
    #[test]
    fn test_frame_round_trip() {
        let envelope = sample(vec![9, 0, 9, 0]);
        let frame = encode_frame(&envelope).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        let decoded = decoder.next_envelope().unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoder.pending(), 0);
    }

    /// Test that a short read yields no envelope and no data loss
    #[test]
    fn test_split_frame_decodes_after_completion() {
        let envelope = sample(vec![1, 2, 3]);
        let frame = encode_frame(&envelope).unwrap();
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut decoder = FrameDecoder::new();
        decoder.extend(head);
        assert!(decoder.next_envelope().unwrap().is_none());

        decoder.extend(tail);
        assert_eq!(decoder.next_envelope().unwrap().unwrap(), envelope);
    }

    /// Test that back-to-back frames are extracted one per call
    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = sample(vec![1]);
        let second = sample(vec![2, 2]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&first).unwrap());
        decoder.extend(&encode_frame(&second).unwrap());

        assert_eq!(decoder.next_envelope().unwrap().unwrap(), first);
        assert_eq!(decoder.next_envelope().unwrap().unwrap(), second);
        assert!(decoder.next_envelope().unwrap().is_none());
    }

    /// Test that an oversized length prefix is rejected
    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&(u32::MAX).to_le_bytes());
        assert!(matches!(
            decoder.next_envelope(),
            Err(WireError::FrameTooLarge(_, _))
        ));
    }

    /// Test that a malformed frame body errors once and is consumed, so
    /// the following frame still decodes
    #[test]
    fn test_malformed_body_does_not_wedge_the_stream() {
        let garbage = [255u8; 6];
        let mut decoder = FrameDecoder::new();
        decoder.extend(&(garbage.len() as u32).to_le_bytes());
        decoder.extend(&garbage);
        decoder.extend(&encode_frame(&sample(vec![7])).unwrap());

        assert!(matches!(
            decoder.next_envelope(),
            Err(WireError::Malformed(_))
        ));
        assert_eq!(decoder.next_envelope().unwrap().unwrap(), sample(vec![7]));
        assert_eq!(decoder.pending(), 0);
    }

    /// Test the async helpers against an in-memory duplex stream
    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let envelope = sample(vec![0; 64]);
        write_envelope(&mut client, &envelope).await.unwrap();

        let decoded = read_envelope(&mut server).await.unwrap();
        assert_eq!(decoded, envelope);
    }
}
