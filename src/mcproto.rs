//! Java edition wire plumbing: VarInt framing, handshake parsing and the
//! handful of status/login packets the proxy speaks on its own behalf.
//!
//! Packet structure on the wire is `VarInt length | VarInt packetId | payload`.
//! More information: https://minecraft.wiki/w/Java_Edition_protocol/Packets

use bytes::Buf;
use std::io::Cursor;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HANDSHAKE_ID: i32 = 0x00;
pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;
pub const PING_ID: i32 = 0x01;
pub const LOGIN_DISCONNECT_ID: i32 = 0x00;

/// First byte of a pre-1.7 legacy server list ping.
pub const LEGACY_PING_BYTE: u8 = 0xFE;

/// Frame cap while reading the handshake and login phase from a client.
pub const MAX_CLIENT_FRAME: usize = 2048;
/// Frame cap for status responses read back from a backend (favicons are big).
pub const MAX_STATUS_FRAME: usize = 128 * 1024;
/// The server address field of a handshake is capped by the protocol.
pub const MAX_SERVER_ADDRESS_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed VarInt (no terminator within 5 bytes)")]
    MalformedVarInt,
    #[error("truncated packet")]
    Truncated,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("string of {0} bytes exceeds limit")]
    StringTooLong(usize),
    #[error("string is not valid UTF-8")]
    InvalidString,
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacket(i32),
    #[error("unknown next state {0}")]
    UnknownNextState(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read a VarInt from the buffer, returning (value, bytes consumed).
/// Returns None if malformed.
pub fn read_varint(buf: &[u8]) -> Option<(i32, usize)> {
    let mut result: u32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 5 {
            return None;
        }
        result |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((result as i32, i + 1));
        }
    }
    None
}

pub fn write_varint(val: i32, buf: &mut Vec<u8>) {
    let mut raw = val as u32;
    loop {
        if raw & !0x7F == 0 {
            buf.push(raw as u8);
            return;
        }
        buf.push(((raw & 0x7F) | 0x80) as u8);
        raw >>= 7;
    }
}

pub fn get_varint(cur: &mut Cursor<&[u8]>) -> Result<i32, ProtocolError> {
    let mut result: u32 = 0;
    for i in 0..5 {
        if !cur.has_remaining() {
            return Err(ProtocolError::Truncated);
        }
        let byte = cur.get_u8();
        result |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(ProtocolError::MalformedVarInt)
}

/// Read a VarInt-length-prefixed UTF-8 string, rejecting anything over `max` bytes.
pub fn get_string(cur: &mut Cursor<&[u8]>, max: usize) -> Result<String, ProtocolError> {
    let len = get_varint(cur)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::InvalidString)?;
    if len > max {
        return Err(ProtocolError::StringTooLong(len));
    }
    if cur.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let mut bytes = vec![0u8; len];
    cur.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)
}

pub fn put_string(s: &str, buf: &mut Vec<u8>) {
    write_varint(s.len() as i32, buf);
    buf.extend_from_slice(s.as_bytes());
}

/// Read one framed packet from the stream, appending the exact wire bytes to
/// `raw` so callers can later replay them verbatim. Returns `packetId | payload`.
pub async fn read_frame<R>(
    stream: &mut R,
    max: usize,
    raw: &mut Vec<u8>,
) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len: u32 = 0;
    for i in 0.. {
        if i == 5 {
            return Err(ProtocolError::MalformedVarInt);
        }
        let byte = stream.read_u8().await?;
        raw.push(byte);
        len |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            break;
        }
    }
    let len = len as i32;
    if len < 0 || len as usize > max {
        return Err(ProtocolError::FrameTooLarge(len.max(0) as usize));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    raw.extend_from_slice(&body);
    Ok(body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
    Transfer,
}

impl NextState {
    pub fn from_id(id: i32) -> Result<Self, ProtocolError> {
        match id {
            1 => Ok(NextState::Status),
            2 => Ok(NextState::Login),
            3 => Ok(NextState::Transfer),
            other => Err(ProtocolError::UnknownNextState(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

/// Parse a handshake packet body (`packetId | payload`).
pub fn parse_handshake(body: &[u8]) -> Result<Handshake, ProtocolError> {
    let mut cur = Cursor::new(body);
    let id = get_varint(&mut cur)?;
    if id != HANDSHAKE_ID {
        return Err(ProtocolError::UnexpectedPacket(id));
    }
    let protocol = get_varint(&mut cur)?;
    let server_address = get_string(&mut cur, MAX_SERVER_ADDRESS_LEN)?;
    if cur.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    let server_port = cur.get_u16();
    let next_state = NextState::from_id(get_varint(&mut cur)?)?;
    Ok(Handshake {
        protocol,
        server_address,
        server_port,
        next_state,
    })
}

/// Extract the username from a Login Start packet body. Trailing fields
/// (profile UUID and friends, version dependent) are ignored.
pub fn parse_login_start(body: &[u8]) -> Result<String, ProtocolError> {
    let mut cur = Cursor::new(body);
    let id = get_varint(&mut cur)?;
    if id != 0x00 {
        return Err(ProtocolError::UnexpectedPacket(id));
    }
    get_string(&mut cur, 16)
}

/// Pull the JSON string out of a Status Response body.
pub fn parse_status_response(body: &[u8]) -> Result<String, ProtocolError> {
    let mut cur = Cursor::new(body);
    let id = get_varint(&mut cur)?;
    if id != STATUS_RESPONSE_ID {
        return Err(ProtocolError::UnexpectedPacket(id));
    }
    get_string(&mut cur, MAX_STATUS_FRAME)
}

fn frame(packet_id: i32, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(payload.len() + 5);
    write_varint(packet_id, &mut data);
    data.extend_from_slice(payload);
    let mut packet = Vec::with_capacity(data.len() + 5);
    write_varint(data.len() as i32, &mut packet);
    packet.extend_from_slice(&data);
    packet
}

pub fn status_response_packet(json: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(json.len() + 5);
    put_string(json, &mut payload);
    frame(STATUS_RESPONSE_ID, &payload)
}

/// Ping responses echo the client's 8-byte payload unchanged.
pub fn pong_packet(payload: &[u8]) -> Vec<u8> {
    frame(PING_ID, payload)
}

pub fn login_disconnect_packet(reason_json: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(reason_json.len() + 5);
    put_string(reason_json, &mut payload);
    frame(LOGIN_DISCONNECT_ID, &payload)
}

/// Handshake the proxy sends when probing a backend itself.
pub fn client_handshake_packet(protocol: i32, address: &str, port: u16, next_state: i32) -> Vec<u8> {
    let mut payload = Vec::new();
    write_varint(protocol, &mut payload);
    put_string(address, &mut payload);
    payload.extend_from_slice(&port.to_be_bytes());
    write_varint(next_state, &mut payload);
    frame(HANDSHAKE_ID, &payload)
}

pub fn status_request_packet() -> Vec<u8> {
    frame(STATUS_REQUEST_ID, &[])
}

/// Response to a pre-1.7 legacy ping: `0xFF | u16 length | UTF-16BE payload`,
/// where the payload is the 1.6 `§1`-prefixed null-separated field list.
pub fn legacy_ping_response(version: &str, motd: &str, online: u32, max: u32) -> Vec<u8> {
    let text = format!("\u{a7}1\0127\0{version}\0{motd}\0{online}\0{max}");
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut out = Vec::with_capacity(3 + units.len() * 2);
    out.push(0xFF);
    out.extend_from_slice(&(units.len() as u16).to_be_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for val in [
            0i32,
            1,
            2,
            127,
            128,
            255,
            300,
            25565,
            2097151,
            2097152,
            i32::MAX,
        ] {
            let mut buf = Vec::new();
            write_varint(val, &mut buf);
            assert!(buf.len() <= 5);
            let (decoded, used) = read_varint(&buf).unwrap();
            assert_eq!(decoded, val);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn varint_boundary_lengths() {
        let mut buf = Vec::new();
        write_varint(127, &mut buf);
        assert_eq!(buf.len(), 1);
        buf.clear();
        write_varint(128, &mut buf);
        assert_eq!(buf.len(), 2);
        buf.clear();
        write_varint(i32::MAX, &mut buf);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn varint_rejects_overlong_encoding() {
        assert!(read_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).is_none());
        assert!(read_varint(&[0x80, 0x80]).is_none());
    }

    #[test]
    fn string_roundtrip() {
        let mut buf = Vec::new();
        put_string("play.example.org", &mut buf);
        let mut cur = Cursor::new(buf.as_slice());
        assert_eq!(get_string(&mut cur, 255).unwrap(), "play.example.org");
    }

    #[test]
    fn string_limit_enforced() {
        let long = "x".repeat(300);
        let mut buf = Vec::new();
        put_string(&long, &mut buf);
        let mut cur = Cursor::new(buf.as_slice());
        assert!(matches!(
            get_string(&mut cur, 255),
            Err(ProtocolError::StringTooLong(300))
        ));
    }

    #[test]
    fn handshake_roundtrip() {
        let packet = client_handshake_packet(765, "mc.example.org", 25565, 2);
        // skip the outer length prefix to get the body
        let (len, used) = read_varint(&packet).unwrap();
        let body = &packet[used..used + len as usize];
        let hs = parse_handshake(body).unwrap();
        assert_eq!(hs.protocol, 765);
        assert_eq!(hs.server_address, "mc.example.org");
        assert_eq!(hs.server_port, 25565);
        assert_eq!(hs.next_state, NextState::Login);
    }

    #[test]
    fn handshake_rejects_unknown_state() {
        let packet = client_handshake_packet(765, "mc.example.org", 25565, 9);
        let (len, used) = read_varint(&packet).unwrap();
        let body = &packet[used..used + len as usize];
        assert!(matches!(
            parse_handshake(body),
            Err(ProtocolError::UnknownNextState(9))
        ));
    }

    #[test]
    fn login_start_username() {
        let mut payload = Vec::new();
        put_string("alice", &mut payload);
        payload.extend_from_slice(&[0u8; 16]); // profile uuid, ignored
        let body = {
            let mut b = Vec::new();
            write_varint(0x00, &mut b);
            b.extend_from_slice(&payload);
            b
        };
        assert_eq!(parse_login_start(&body).unwrap(), "alice");
    }

    #[test]
    fn disconnect_packet_shape() {
        let packet = login_disconnect_packet(r#"{"text":"nope"}"#);
        let (len, used) = read_varint(&packet).unwrap();
        assert_eq!(packet.len(), used + len as usize);
        let mut cur = Cursor::new(&packet[used..]);
        assert_eq!(get_varint(&mut cur).unwrap(), LOGIN_DISCONNECT_ID);
        assert_eq!(get_string(&mut cur, 1024).unwrap(), r#"{"text":"nope"}"#);
    }

    #[tokio::test]
    async fn read_frame_captures_raw_bytes() {
        let packet = client_handshake_packet(765, "localhost", 25565, 1);
        let (mut tx, mut rx) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &packet)
            .await
            .unwrap();
        let mut raw = Vec::new();
        let body = read_frame(&mut rx, MAX_CLIENT_FRAME, &mut raw).await.unwrap();
        assert_eq!(raw, packet);
        let hs = parse_handshake(&body).unwrap();
        assert_eq!(hs.next_state, NextState::Status);
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized() {
        let mut packet = Vec::new();
        write_varint(1_000_000, &mut packet);
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &packet)
            .await
            .unwrap();
        let mut raw = Vec::new();
        assert!(matches!(
            read_frame(&mut rx, MAX_CLIENT_FRAME, &mut raw).await,
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn legacy_response_is_utf16() {
        let out = legacy_ping_response("1.20.5", "hi", 0, 20);
        assert_eq!(out[0], 0xFF);
        let units = u16::from_be_bytes([out[1], out[2]]) as usize;
        assert_eq!(out.len(), 3 + units * 2);
        // first payload char is '§'
        assert_eq!(u16::from_be_bytes([out[3], out[4]]), 0x00A7);
    }
}
