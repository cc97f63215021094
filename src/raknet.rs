//! RakNet offline messages, the part of the Bedrock protocol the proxy has
//! to understand before a session exists.
//!
//! See: https://wiki.vg/Raknet_Protocol

use bytes::{Buf, BufMut};
use std::io::Cursor;

pub const UNCONNECTED_PING: u8 = 0x01;
pub const UNCONNECTED_PING_OPEN_CONNECTIONS: u8 = 0x02;
pub const OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
pub const OPEN_CONNECTION_REPLY_1: u8 = 0x06;
pub const OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
pub const OPEN_CONNECTION_REPLY_2: u8 = 0x08;
pub const UNCONNECTED_PONG: u8 = 0x1C;

/// Fixed value present in every offline message.
pub const OFFLINE_MESSAGE_MAGIC: u128 = 0x00ffff00fefefefefdfdfdfd12345678;

/// Largest datagram we expect on the wire (conservative Ethernet MTU).
pub const MAX_DATAGRAM: usize = 1492;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnconnectedPing {
    pub time: i64,
    pub client_guid: i64,
}

impl UnconnectedPing {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        // id + time + magic + guid
        if bytes.len() < 1 + 8 + 16 + 8 {
            return None;
        }
        let mut cur = Cursor::new(bytes);
        let id = cur.get_u8();
        if id != UNCONNECTED_PING && id != UNCONNECTED_PING_OPEN_CONNECTIONS {
            return None;
        }
        let time = cur.get_i64();
        if cur.get_u128() != OFFLINE_MESSAGE_MAGIC {
            return None;
        }
        let client_guid = cur.get_i64();
        Some(UnconnectedPing { time, client_guid })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(33);
        buf.put_u8(UNCONNECTED_PING);
        buf.put_i64(self.time);
        buf.put_u128(OFFLINE_MESSAGE_MAGIC);
        buf.put_i64(self.client_guid);
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPong {
    pub time: i64,
    pub server_guid: i64,
    /// The "server ID string", an MOTD payload per [`Motd`].
    pub payload: String,
}

impl UnconnectedPong {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        // id + time + guid + magic + u16 length
        if bytes.len() < 1 + 8 + 8 + 16 + 2 {
            return None;
        }
        let mut cur = Cursor::new(bytes);
        if cur.get_u8() != UNCONNECTED_PONG {
            return None;
        }
        let time = cur.get_i64();
        let server_guid = cur.get_i64();
        if cur.get_u128() != OFFLINE_MESSAGE_MAGIC {
            return None;
        }
        let len = cur.get_u16() as usize;
        if cur.remaining() < len {
            return None;
        }
        let mut payload = vec![0u8; len];
        cur.copy_to_slice(&mut payload);
        let payload = String::from_utf8(payload).ok()?;
        Some(UnconnectedPong {
            time,
            server_guid,
            payload,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(35 + self.payload.len());
        buf.put_u8(UNCONNECTED_PONG);
        buf.put_i64(self.time);
        buf.put_i64(self.server_guid);
        buf.put_u128(OFFLINE_MESSAGE_MAGIC);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(self.payload.as_bytes());
        buf
    }
}

/// Structured Bedrock MOTD, the semicolon-separated list carried in pongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Motd {
    pub motd: String,
    pub protocol: i32,
    pub version: String,
    pub online_players: u32,
    pub max_players: u32,
    pub server_guid: i64,
    pub level_name: String,
    pub gamemode: String,
    pub port: u16,
}

impl Motd {
    pub fn encode_payload(&self) -> String {
        format!(
            "MCPE;{};{};{};{};{};{};{};{};1;{};{};",
            self.motd,
            self.protocol,
            self.version,
            self.online_players,
            self.max_players,
            self.server_guid,
            self.level_name,
            self.gamemode,
            self.port,
            self.port,
        )
    }

    pub fn decode_payload(payload: &str) -> Option<Motd> {
        let mut parts = payload.split(';');
        if parts.next()? != "MCPE" {
            return None;
        }
        let motd = parts.next()?.to_owned();
        let protocol = parts.next()?.parse().ok()?;
        let version = parts.next()?.to_owned();
        let online_players = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let max_players = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let server_guid = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let level_name = parts.next().map(str::to_owned).unwrap_or_default();
        let gamemode = parts.next().map(str::to_owned).unwrap_or_default();
        let _gamemode_numeric = parts.next();
        let port = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Some(Motd {
            motd,
            protocol,
            version,
            online_players,
            max_players,
            server_guid,
            level_name,
            gamemode,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_roundtrip() {
        let ping = UnconnectedPing {
            time: 123_456_789,
            client_guid: -42,
        };
        let bytes = ping.to_bytes();
        assert_eq!(bytes.len(), 33);
        assert_eq!(UnconnectedPing::from_bytes(&bytes), Some(ping));
    }

    #[test]
    fn ping_rejects_wrong_magic() {
        let mut bytes = UnconnectedPing {
            time: 1,
            client_guid: 2,
        }
        .to_bytes();
        bytes[10] ^= 0xFF;
        assert_eq!(UnconnectedPing::from_bytes(&bytes), None);
    }

    #[test]
    fn pong_roundtrip() {
        let motd = Motd {
            motd: "Creative Fun".into(),
            protocol: 686,
            version: "1.21.2".into(),
            online_players: 3,
            max_players: 20,
            server_guid: 99,
            level_name: "world".into(),
            gamemode: "Survival".into(),
            port: 19132,
        };
        let pong = UnconnectedPong {
            time: 4242,
            server_guid: 99,
            payload: motd.encode_payload(),
        };
        let decoded = UnconnectedPong::from_bytes(&pong.to_bytes()).unwrap();
        assert_eq!(decoded, pong);
        assert_eq!(Motd::decode_payload(&decoded.payload), Some(motd));
    }

    #[test]
    fn motd_payload_layout() {
        let motd = Motd {
            motd: "hi".into(),
            protocol: 686,
            version: "1.21.2".into(),
            online_players: 0,
            max_players: 10,
            server_guid: 7,
            level_name: "world".into(),
            gamemode: "Survival".into(),
            port: 19132,
        };
        assert_eq!(
            motd.encode_payload(),
            "MCPE;hi;686;1.21.2;0;10;7;world;Survival;1;19132;19132;"
        );
    }

    #[test]
    fn pong_from_garbage_is_none() {
        assert_eq!(UnconnectedPong::from_bytes(&[0x1C, 0x00]), None);
        assert_eq!(UnconnectedPong::from_bytes(&[]), None);
    }
}
