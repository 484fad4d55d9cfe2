use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::lite::protocol::{
    self, DecodeError, Direction, MAX_FRAME_LEN, Packet, PacketContext, State,
};

/// Uncompressed packet cap enforced by vanilla servers.
pub const VANILLA_UNCOMPRESSED_CAP: usize = 8 * 1024 * 1024;
/// No configuration may raise the uncompressed cap above this.
pub const HARD_UNCOMPRESSED_CAP: usize = 16 * 1024 * 1024;

/// Consecutive empty frames tolerated before the stream is considered garbage.
const MAX_EMPTY_FRAMES: usize = 10;

const READ_CHUNK: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("framing: {0}")]
    Framing(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("decode {packet}: {source}")]
    Decode {
        packet: String,
        #[source]
        source: DecodeError,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The packet decoded but the frame had surplus bytes. The decoded context is kept.
    #[error("decoded {} but {unread} byte(s) were left unread", .ctx.describe())]
    DecoderLeftBytes {
        ctx: Box<PacketContext>,
        unread: usize,
    },
}

impl CodecError {
    pub fn is_soft(&self) -> bool {
        matches!(self, CodecError::DecoderLeftBytes { .. })
    }
}

/// Treats surplus trailing bytes as success, keeping the decoded packet.
pub fn accept_left_bytes(
    res: Result<PacketContext, CodecError>,
) -> Result<PacketContext, CodecError> {
    match res {
        Err(CodecError::DecoderLeftBytes { ctx, unread }) => {
            tracing::debug!(packet = %ctx.describe(), unread, "codec: ignoring trailing bytes");
            Ok(*ctx)
        }
        other => other,
    }
}

/// Reads length-prefixed, optionally compressed frames from `R`.
///
/// Reads are chunked into an internal buffer, so bytes past the current frame may already
/// have been pulled off the stream. [`Decoder::into_parts`] hands them back.
pub struct Decoder<R> {
    rd: R,
    buf: BytesMut,
    direction: Direction,
    state: State,
    protocol: i32,
    compression_threshold: Option<usize>,
    uncompressed_cap: usize,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(rd: R, direction: Direction) -> Self {
        Self {
            rd,
            buf: BytesMut::with_capacity(READ_CHUNK),
            direction,
            state: State::Handshake,
            protocol: 0,
            compression_threshold: None,
            uncompressed_cap: VANILLA_UNCOMPRESSED_CAP,
        }
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn set_protocol(&mut self, protocol: i32) {
        self.protocol = protocol;
    }

    /// `None` disables compression.
    pub fn set_compression_threshold(&mut self, threshold: Option<usize>) {
        self.compression_threshold = threshold;
    }

    pub fn set_uncompressed_cap(&mut self, cap: usize) {
        self.uncompressed_cap = cap.min(HARD_UNCOMPRESSED_CAP);
    }

    pub fn get_ref(&self) -> &R {
        &self.rd
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.rd
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.rd, self.buf)
    }

    pub async fn decode(&mut self) -> Result<PacketContext, CodecError> {
        let mut empty = 0usize;
        loop {
            let frame = self.read_frame().await?;
            if frame.is_empty() {
                empty += 1;
                if empty > MAX_EMPTY_FRAMES {
                    return Err(CodecError::Framing(format!(
                        "more than {MAX_EMPTY_FRAMES} consecutive empty frames"
                    )));
                }
                continue;
            }
            let payload = self.decompress(frame)?;
            return self.decode_payload(payload);
        }
    }

    async fn read_frame(&mut self) -> Result<Bytes, CodecError> {
        loop {
            let peeked = protocol::peek_varint(&self.buf)
                .map_err(|e| CodecError::Framing(format!("frame length: {e}")))?;
            if let Some((len, width)) = peeked {
                if len < 0 || len as usize > MAX_FRAME_LEN {
                    return Err(CodecError::Framing(format!(
                        "frame length {len} out of range 0..={MAX_FRAME_LEN}"
                    )));
                }
                let len = len as usize;
                if self.buf.len() >= width + len {
                    self.buf.advance(width);
                    return Ok(self.buf.split_to(len).freeze());
                }
                self.buf.reserve(width + len - self.buf.len());
            } else {
                self.buf.reserve(READ_CHUNK);
            }

            let n = self.rd.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed mid-frame",
                )));
            }
        }
    }

    fn decompress(&self, frame: Bytes) -> Result<Bytes, CodecError> {
        let Some(threshold) = self.compression_threshold else {
            return Ok(frame);
        };

        let mut rd = frame;
        let size = protocol::get_varint(&mut rd)
            .map_err(|e| CodecError::Protocol(format!("uncompressed size: {e}")))?;
        if size == 0 {
            return Ok(rd);
        }
        if size < 0 {
            return Err(CodecError::Protocol(format!(
                "negative uncompressed size {size}"
            )));
        }
        let size = size as usize;
        if size < threshold {
            return Err(CodecError::Protocol(format!(
                "uncompressed size {size} below threshold {threshold}"
            )));
        }
        if size > self.uncompressed_cap {
            return Err(CodecError::Protocol(format!(
                "uncompressed size {size} exceeds cap {}",
                self.uncompressed_cap
            )));
        }

        let mut out = Vec::with_capacity(size);
        ZlibDecoder::new(&rd[..])
            .take(size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Protocol(format!("zlib: {e}")))?;
        if out.len() != size {
            return Err(CodecError::Protocol(format!(
                "decompressed {} byte(s), header claimed {size}",
                out.len()
            )));
        }
        Ok(Bytes::from(out))
    }

    fn decode_payload(&self, payload: Bytes) -> Result<PacketContext, CodecError> {
        let mut rd = payload.clone();
        let packet_id = protocol::get_varint(&mut rd).map_err(|source| CodecError::Decode {
            packet: "packet id".into(),
            source,
        })?;

        let packet = match Packet::decode(self.state, self.direction, packet_id, &mut rd) {
            None => None,
            Some(Ok(p)) => Some(p),
            Some(Err(source)) => {
                return Err(CodecError::Decode {
                    packet: format!("{:?}/{:?} id={packet_id:#04x}", self.state, self.direction),
                    source,
                });
            }
        };

        let known = packet.is_some();
        let ctx = PacketContext {
            direction: self.direction,
            protocol: self.protocol,
            packet_id,
            packet,
            payload,
        };
        if known && rd.has_remaining() {
            return Err(CodecError::DecoderLeftBytes {
                unread: rd.remaining(),
                ctx: Box::new(ctx),
            });
        }
        Ok(ctx)
    }
}

#[derive(Debug, Clone, Copy)]
struct CompressionSettings {
    threshold: usize,
    level: Compression,
}

/// Writes one frame per packet; each frame is assembled in a scratch buffer first.
pub struct Encoder<W> {
    wr: W,
    compression: Option<CompressionSettings>,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    pub fn new(wr: W) -> Self {
        Self {
            wr,
            compression: None,
            scratch: BytesMut::with_capacity(256),
        }
    }

    /// `level` is a zlib level 0-9; values outside the range fall back to the default.
    pub fn set_compression(&mut self, threshold: Option<usize>, level: i32) {
        self.compression = threshold.map(|threshold| CompressionSettings {
            threshold,
            level: match u32::try_from(level) {
                Ok(l) if l <= 9 => Compression::new(l),
                _ => Compression::default(),
            },
        });
    }

    pub fn into_inner(self) -> W {
        self.wr
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), CodecError> {
        self.write_payload(&packet.to_payload()).await
    }

    /// Frames `payload` (packet id + body) and writes it in a single call.
    pub async fn write_payload(&mut self, payload: &[u8]) -> Result<(), CodecError> {
        let body = match self.compression {
            None => Bytes::copy_from_slice(payload),
            Some(c) => compress_payload(payload, c)?,
        };
        if body.len() > MAX_FRAME_LEN {
            return Err(CodecError::Framing(format!(
                "frame length {} exceeds {MAX_FRAME_LEN}",
                body.len()
            )));
        }

        self.scratch.clear();
        protocol::put_varint(&mut self.scratch, body.len() as i32);
        self.scratch.put_slice(&body);
        self.wr.write_all(&self.scratch).await?;
        self.wr.flush().await?;
        Ok(())
    }
}

fn compress_payload(payload: &[u8], c: CompressionSettings) -> Result<Bytes, CodecError> {
    let mut out = BytesMut::with_capacity(payload.len() + 5);
    if payload.len() < c.threshold {
        protocol::put_varint(&mut out, 0);
        out.put_slice(payload);
        return Ok(out.freeze());
    }
    if payload.len() > HARD_UNCOMPRESSED_CAP {
        return Err(CodecError::Protocol(format!(
            "packet of {} byte(s) exceeds cap {HARD_UNCOMPRESSED_CAP}",
            payload.len()
        )));
    }

    protocol::put_varint(&mut out, payload.len() as i32);
    let mut z = ZlibEncoder::new(out.writer(), c.level);
    z.write_all(payload)?;
    Ok(z.finish()?.into_inner().freeze())
}

/// Writes `VarInt(len(payload)) ++ payload` without compression.
pub async fn write_frame<W: AsyncWrite + Unpin>(wr: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    protocol::put_varint(&mut buf, payload.len() as i32);
    buf.put_slice(payload);
    wr.write_all(&buf).await?;
    wr.flush().await
}
