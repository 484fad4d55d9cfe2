use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest frame length a 3-byte VarInt can carry (2^21 - 1).
pub const MAX_FRAME_LEN: usize = 2_097_151;

/// Vanilla string cap in UTF-16 code units.
pub const MAX_STRING_LEN: usize = 32_767;

pub const HANDSHAKE_PACKET_ID: i32 = 0x00;
pub const STATUS_REQUEST_PACKET_ID: i32 = 0x00;
pub const STATUS_RESPONSE_PACKET_ID: i32 = 0x00;
pub const STATUS_PING_PACKET_ID: i32 = 0x01;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet body underflow: need {need} more byte(s)")]
    Underflow { need: usize },
    #[error("varint is longer than 5 bytes")]
    VarIntTooLong,
    #[error("string length {len} out of range (max {max} bytes)")]
    StringLength { len: i64, max: usize },
    #[error("string is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Serverbound,
    Clientbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Handshake,
    Status,
    Login,
}

pub fn get_varint(buf: &mut impl Buf) -> Result<i32, DecodeError> {
    let mut value: u32 = 0;
    for i in 0..5 {
        if !buf.has_remaining() {
            return Err(DecodeError::Underflow { need: 1 });
        }
        let b = buf.get_u8();
        value |= u32::from(b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(DecodeError::VarIntTooLong)
}

/// Decodes a VarInt at the start of `buf` without consuming it.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and its encoded width.
pub fn peek_varint(buf: &[u8]) -> Result<Option<(i32, usize)>, DecodeError> {
    let mut value: u32 = 0;
    for (i, b) in buf.iter().take(5).enumerate() {
        value |= u32::from(b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((value as i32, i + 1)));
        }
    }
    if buf.len() >= 5 {
        return Err(DecodeError::VarIntTooLong);
    }
    Ok(None)
}

pub fn put_varint(buf: &mut impl BufMut, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7F == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8(((v & 0x7F) | 0x80) as u8);
        v >>= 7;
    }
}

pub fn varint_len(value: i32) -> usize {
    let v = value as u32;
    match v {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

pub fn get_string(buf: &mut impl Buf, max_chars: usize) -> Result<String, DecodeError> {
    let len = get_varint(buf)?;
    let max_bytes = max_chars * 3;
    if len < 0 || len as usize > max_bytes {
        return Err(DecodeError::StringLength {
            len: i64::from(len),
            max: max_bytes,
        });
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Underflow {
            need: len - buf.remaining(),
        });
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_varint(buf, s.len() as i32);
    buf.put_slice(s.as_bytes());
}

fn get_u16(buf: &mut impl Buf) -> Result<u16, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::Underflow {
            need: 2 - buf.remaining(),
        });
    }
    Ok(buf.get_u16())
}

fn get_i64(buf: &mut impl Buf) -> Result<i64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::Underflow {
            need: 8 - buf.remaining(),
        });
    }
    Ok(buf.get_i64())
}

/// The first packet of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    /// Raw virtual host, including any Forge, Floodgate or TCPShield decoration.
    pub server_address: String,
    pub port: u16,
    pub next_state: i32,
}

impl Handshake {
    pub const NEXT_STATE_STATUS: i32 = 1;
    pub const NEXT_STATE_LOGIN: i32 = 2;
    pub const NEXT_STATE_TRANSFER: i32 = 3;

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        let protocol_version = get_varint(buf)?;
        let server_address = get_string(buf, MAX_STRING_LEN)?;
        let port = get_u16(buf)?;
        let next_state = get_varint(buf)?;
        Ok(Self {
            protocol_version,
            server_address,
            port,
            next_state,
        })
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        put_varint(buf, self.protocol_version);
        put_string(buf, &self.server_address);
        buf.put_u16(self.port);
        put_varint(buf, self.next_state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    /// The status JSON document.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake(Handshake),
    StatusRequest,
    StatusResponse(StatusResponse),
    StatusPing(i64),
    StatusPong(i64),
}

impl Packet {
    pub fn id(&self) -> i32 {
        match self {
            Packet::Handshake(_) => HANDSHAKE_PACKET_ID,
            Packet::StatusRequest => STATUS_REQUEST_PACKET_ID,
            Packet::StatusResponse(_) => STATUS_RESPONSE_PACKET_ID,
            Packet::StatusPing(_) | Packet::StatusPong(_) => STATUS_PING_PACKET_ID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Handshake(_) => "Handshake",
            Packet::StatusRequest => "StatusRequest",
            Packet::StatusResponse(_) => "StatusResponse",
            Packet::StatusPing(_) => "StatusPing",
            Packet::StatusPong(_) => "StatusPong",
        }
    }

    /// Decodes a known packet body. Returns `None` for packets this proxy does not register.
    pub fn decode(
        state: State,
        direction: Direction,
        packet_id: i32,
        buf: &mut impl Buf,
    ) -> Option<Result<Packet, DecodeError>> {
        use Direction::*;
        let res = match (state, direction, packet_id) {
            (State::Handshake, Serverbound, HANDSHAKE_PACKET_ID) => {
                Handshake::decode(buf).map(Packet::Handshake)
            }
            (State::Status, Serverbound, STATUS_REQUEST_PACKET_ID) => Ok(Packet::StatusRequest),
            (State::Status, Serverbound, STATUS_PING_PACKET_ID) => {
                get_i64(buf).map(Packet::StatusPing)
            }
            (State::Status, Clientbound, STATUS_RESPONSE_PACKET_ID) => {
                get_string(buf, MAX_STRING_LEN)
                    .map(|status| Packet::StatusResponse(StatusResponse { status }))
            }
            (State::Status, Clientbound, STATUS_PING_PACKET_ID) => {
                get_i64(buf).map(Packet::StatusPong)
            }
            _ => return None,
        };
        Some(res)
    }

    pub fn encode_body(&self, buf: &mut impl BufMut) {
        match self {
            Packet::Handshake(h) => h.encode(buf),
            Packet::StatusRequest => {}
            Packet::StatusResponse(r) => put_string(buf, &r.status),
            Packet::StatusPing(v) | Packet::StatusPong(v) => buf.put_i64(*v),
        }
    }

    /// Packet id followed by the body; the unit a frame carries.
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        put_varint(&mut buf, self.id());
        self.encode_body(&mut buf);
        buf.freeze()
    }
}

/// A decoded frame together with the bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct PacketContext {
    pub direction: Direction,
    pub protocol: i32,
    pub packet_id: i32,
    /// `None` when the id is not registered for the decoder's state.
    pub packet: Option<Packet>,
    /// Packet id plus body, uncompressed. Replayed verbatim unless rewritten.
    pub payload: Bytes,
}

impl PacketContext {
    pub fn from_packet(direction: Direction, protocol: i32, packet: Packet) -> Self {
        Self {
            direction,
            protocol,
            packet_id: packet.id(),
            payload: packet.to_payload(),
            packet: Some(packet),
        }
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        match &self.packet {
            Some(Packet::Handshake(h)) => Some(h),
            _ => None,
        }
    }

    /// Replaces the handshake and re-encodes the payload from it.
    pub fn update_handshake(&mut self, handshake: Handshake) {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 16);
        put_varint(&mut buf, self.packet_id);
        handshake.encode(&mut buf);
        self.payload = buf.freeze();
        self.packet = Some(Packet::Handshake(handshake));
    }

    pub fn describe(&self) -> String {
        match &self.packet {
            Some(p) => format!("{}(id={:#04x})", p.name(), self.packet_id),
            None => format!("Unknown(id={:#04x})", self.packet_id),
        }
    }
}
