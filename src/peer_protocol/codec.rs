use std::io;

use bytes::{Buf, BufMut, BytesMut};
use futures::{Sink, Stream};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::prelude::*;

use super::message::{DecodeError, PeerMessage};

/// largest payload a peer may announce in a length prefix.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX_LEN: usize = 4;

/// failures of the connection itself. after one of these the stream is unusable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// a complete frame whose payload may or may not have been a valid message. a bad payload does
/// not desynchronise the stream, so it is handed up rather than failing the stream.
pub type Decoded = Result<PeerMessage, DecodeError>;

pub type PeerFrames<T> = Framed<T, MessageCodec>;

pub trait PeerStream:
    Stream<Item = Result<Decoded, ProtocolError>>
    + Sink<PeerMessage, Error = ProtocolError>
    + Unpin
    + Send
{
}

impl<T> PeerStream for T where
    T: Stream<Item = Result<Decoded, ProtocolError>>
        + Sink<PeerMessage, Error = ProtocolError>
        + Unpin
        + Send
{
}

pub fn upgrade_stream<T>(stream: T) -> PeerFrames<T>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(stream, MessageCodec)
}

/// `<u32 big endian payload length><json payload>`
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Decoded;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX_LEN {
            return Ok(None);
        }

        // peek the length, the prefix stays in the buffer until the whole frame has arrived
        let mut prefix = [0; LEN_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LEN_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > MAX_FRAME_LEN {
            warn!(len, "peer announced an oversized frame");
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        let frame_len = LEN_PREFIX_LEN + len;
        if src.len() < frame_len {
            trace!(
                "read buffer holds {} bytes but the frame is {} bytes long",
                src.len(),
                frame_len
            );
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX_LEN);
        let payload = src.split_to(len);
        Ok(Some(PeerMessage::from_payload(&payload)))
    }
}

impl Encoder<PeerMessage> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.to_payload().map_err(ProtocolError::Encode)?;

        // never put a frame on the wire that the other side is bound to refuse
        if payload.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len: payload.len(),
                max: MAX_FRAME_LEN,
            });
        }

        dst.reserve(LEN_PREFIX_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
