//! Tunnel wire format.
//!
//! Plain layout (the system of record):
//!
//! ```text
//! +-------+---------+-----------------+
//! | FLAGS | FLOW_ID |     PAYLOAD     |
//! +-------+---------+-----------------+
//! |   1   |    1    |  0..=8190 bytes |
//! +-------+---------+-----------------+
//! ```
//!
//! Padded layout (optional, both ends must agree):
//!
//! ```text
//! | FLAGS | FLOW_ID | BEGIN_LEN | END_LEN | BEGIN_PAD | PAYLOAD | END_PAD |
//! ```
//!
//! Padding only varies datagram sizes; it carries no security properties.

use bytes::{BufMut, Bytes, BytesMut};
use rand::{RngExt, rng};
use thiserror::Error;

/// Upper bound for any encoded frame.
pub const MAX_FRAME_BYTES: usize = 8192;

pub const HEADER_LEN: usize = 2;
pub const PADDED_HEADER_LEN: usize = 4;

/// Maximum length of each padding run in the padded layout.
pub const MAX_PAD_LEN: usize = 16;

pub const MAX_PAYLOAD: usize = MAX_FRAME_BYTES - HEADER_LEN;
pub const MAX_PADDED_PAYLOAD: usize = MAX_FRAME_BYTES - PADDED_HEADER_LEN - 2 * MAX_PAD_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown flag: {0}")]
    UnknownFlag(u8),
    #[error("padding exceeds frame length")]
    BadPadding,
    #[error("bad announcement payload ({0} bytes)")]
    BadAnnouncement(usize),
}

/// Frame kind. Exactly one per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Flag {
    Data = 0,
    Dummy = 1,
    KeepAlive = 2,
    Close = 3,
    Announce = 4,
    KeepAliveAck = 5,
    Mode = 6,
}

impl Flag {
    pub fn as_str(self) -> &'static str {
        match self {
            Flag::Data => "data",
            Flag::Dummy => "dummy",
            Flag::KeepAlive => "keepalive",
            Flag::Close => "close",
            Flag::Announce => "announce",
            Flag::KeepAliveAck => "keepalive_ack",
            Flag::Mode => "mode",
        }
    }
}

impl TryFrom<u8> for Flag {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Flag::Data,
            1 => Flag::Dummy,
            2 => Flag::KeepAlive,
            3 => Flag::Close,
            4 => Flag::Announce,
            5 => Flag::KeepAliveAck,
            6 => Flag::Mode,
            other => return Err(FrameError::UnknownFlag(other)),
        })
    }
}

/// Session mode carried by a `Flag::Mode` frame. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Tunnel = 1,
    Vpn = 2,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tunnel" => Some(Mode::Tunnel),
            "vpn" => Some(Mode::Vpn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Tunnel => "tunnel",
            Mode::Vpn => "vpn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flag: Flag,
    pub flow: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flag: Flag, flow: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            flag,
            flow,
            payload: payload.into(),
        }
    }

    fn control(flag: Flag) -> Self {
        Self::new(flag, 0, Bytes::new())
    }

    pub fn data(flow: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(Flag::Data, flow, payload)
    }

    pub fn dummy() -> Self {
        Self::control(Flag::Dummy)
    }

    pub fn keep_alive() -> Self {
        Self::control(Flag::KeepAlive)
    }

    pub fn keep_alive_ack() -> Self {
        Self::control(Flag::KeepAliveAck)
    }

    pub fn close() -> Self {
        Self::control(Flag::Close)
    }

    /// Binds `flow` to a destination port on the far side. Port is little-endian.
    pub fn announce(flow: u8, port: u16) -> Self {
        Self::new(Flag::Announce, flow, port.to_le_bytes().to_vec())
    }

    pub fn mode(mode: Mode) -> Self {
        Self::new(Flag::Mode, 0, vec![mode as u8])
    }

    pub fn announced_port(&self) -> Result<u16, FrameError> {
        match self.payload.as_ref() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            other => Err(FrameError::BadAnnouncement(other.len())),
        }
    }

    /// `None` for an empty payload or an unknown mode byte.
    pub fn announced_mode(&self) -> Option<Mode> {
        match self.payload.first() {
            Some(1) => Some(Mode::Tunnel),
            Some(2) => Some(Mode::Vpn),
            _ => None,
        }
    }
}

/// Selects the frame layout. Both tunnel ends must use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Plain,
    Padded,
}

impl Codec {
    pub fn from_padding(padding: bool) -> Self {
        if padding { Codec::Padded } else { Codec::Plain }
    }

    pub fn max_payload(self) -> usize {
        match self {
            Codec::Plain => MAX_PAYLOAD,
            Codec::Padded => MAX_PADDED_PAYLOAD,
        }
    }

    pub fn header_len(self) -> usize {
        match self {
            Codec::Plain => HEADER_LEN,
            Codec::Padded => PADDED_HEADER_LEN,
        }
    }

    pub fn encode(self, frame: &Frame) -> Result<Bytes, FrameError> {
        let len = frame.payload.len();
        let max = self.max_payload();
        if len > max {
            return Err(FrameError::PayloadTooLarge { len, max });
        }

        match self {
            Codec::Plain => {
                let mut out = BytesMut::with_capacity(HEADER_LEN + len);
                out.put_u8(frame.flag as u8);
                out.put_u8(frame.flow);
                out.put_slice(&frame.payload);
                Ok(out.freeze())
            }
            Codec::Padded => {
                let mut r = rng();
                let begin = r.random_range(0..=MAX_PAD_LEN);
                let end = r.random_range(0..=MAX_PAD_LEN);

                let mut out = BytesMut::with_capacity(PADDED_HEADER_LEN + begin + len + end);
                out.put_u8(frame.flag as u8);
                out.put_u8(frame.flow);
                out.put_u8(begin as u8);
                out.put_u8(end as u8);
                for _ in 0..begin {
                    out.put_u8(r.random());
                }
                out.put_slice(&frame.payload);
                for _ in 0..end {
                    out.put_u8(r.random());
                }
                Ok(out.freeze())
            }
        }
    }

    pub fn decode(self, buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < self.header_len() {
            return Err(FrameError::TooShort(buf.len()));
        }
        let flag = Flag::try_from(buf[0])?;
        let flow = buf[1];

        let payload = match self {
            Codec::Plain => &buf[HEADER_LEN..],
            Codec::Padded => {
                let begin = buf[2] as usize;
                let end = buf[3] as usize;
                let start = PADDED_HEADER_LEN + begin;
                if start + end > buf.len() {
                    return Err(FrameError::BadPadding);
                }
                &buf[start..buf.len() - end]
            }
        };

        Ok(Frame {
            flag,
            flow,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}
