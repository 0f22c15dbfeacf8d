//! Mock record and handshake message framing
//!
//! Records look like TLS records on the wire (type, version, length) but
//! carry their payload in the clear, followed by a 16-bit checksum.

use crate::sio::error::TlsError;
use crate::sio::version::TlsVersion;
use bytes::{Buf, BufMut, BytesMut};

/// Record header length
pub const HEADER_LEN: usize = 5;
/// Record trailer (checksum) length
pub const TRAILER_LEN: usize = 2;
/// Largest payload the mock protocol carries in one record
pub const MAX_FRAGMENT: usize = 4096;

const RECORD_VERSION: [u8; 2] = [3, 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }
}

/// One decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content_type: ContentType,
    pub payload: Vec<u8>,
}

/// Result of looking at the front of a receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peeked {
    /// A whole record and the number of buffer bytes it occupies
    Record(Record, usize),
    /// More bytes are needed. The exact shortfall is known once the header
    /// has arrived.
    Incomplete(Option<usize>),
}

fn checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |sum, byte| sum.wrapping_add(u16::from(*byte)))
}

/// Append one framed record to `out`
pub fn encode(content_type: ContentType, payload: &[u8], out: &mut BytesMut) {
    debug_assert!(payload.len() <= u16::MAX as usize);
    out.reserve(HEADER_LEN + payload.len() + TRAILER_LEN);
    out.put_u8(content_type as u8);
    out.put_slice(&RECORD_VERSION);
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
    out.put_u16(checksum(payload));
}

/// Decode the record at the front of `buf` without consuming it
pub fn peek(buf: &[u8]) -> Result<Peeked, TlsError> {
    if buf.len() < HEADER_LEN {
        return Ok(Peeked::Incomplete(None));
    }

    let content_type = ContentType::from_u8(buf[0])
        .ok_or_else(|| TlsError::protocol(format!("mock: unknown record type {}", buf[0])))?;
    if buf[1..3] != RECORD_VERSION {
        return Err(TlsError::protocol("mock: wrong version number in record header"));
    }
    let length = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if length > MAX_FRAGMENT {
        return Err(TlsError::protocol(format!("mock: record of {} bytes is too long", length)));
    }

    let total = HEADER_LEN + length + TRAILER_LEN;
    if buf.len() < total {
        return Ok(Peeked::Incomplete(Some(total - buf.len())));
    }

    let payload = &buf[HEADER_LEN..HEADER_LEN + length];
    let mut trailer = &buf[HEADER_LEN + length..total];
    if trailer.get_u16() != checksum(payload) {
        return Err(TlsError::protocol("mock: record checksum mismatch"));
    }

    Ok(Peeked::Record(
        Record {
            content_type,
            payload: payload.to_vec(),
        },
        total,
    ))
}

/// Alert levels and descriptions used by the mock protocol
pub mod alert {
    pub const WARNING: u8 = 1;
    pub const FATAL: u8 = 2;

    pub const CLOSE_NOTIFY: u8 = 0;
    pub const HANDSHAKE_FAILURE: u8 = 40;
    pub const BAD_CERTIFICATE: u8 = 42;
    pub const PROTOCOL_VERSION: u8 = 70;

    pub fn describe(description: u8) -> &'static str {
        match description {
            CLOSE_NOTIFY => "close notify",
            HANDSHAKE_FAILURE => "handshake failure",
            BAD_CERTIFICATE => "bad certificate",
            PROTOCOL_VERSION => "protocol version",
            _ => "unknown alert",
        }
    }
}

/// Client authentication demanded by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    #[default]
    None,
    Request,
    Require,
}

/// Handshake messages of the mock protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    HelloRequest,
    ClientHello {
        hostname: String,
    },
    ServerHello {
        client_auth: ClientAuth,
        version: TlsVersion,
        max_fragment: u16,
        /// Names the server certificate is valid for
        names: Vec<String>,
        /// Issuers the server accepts client certificates from
        issuers: Vec<String>,
    },
    Certificate {
        name: Option<String>,
    },
    Finished,
}

const HELLO_REQUEST: u8 = 0;
const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const CERTIFICATE: u8 = 11;
const FINISHED: u8 = 20;

fn put_str(out: &mut Vec<u8>, text: &str) {
    let bytes = &text.as_bytes()[..text.len().min(u8::MAX as usize)];
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

fn put_list(out: &mut Vec<u8>, items: &[String]) {
    let count = items.len().min(u8::MAX as usize);
    out.push(count as u8);
    for item in &items[..count] {
        put_str(out, item);
    }
}

fn truncated() -> TlsError {
    TlsError::protocol("mock: truncated handshake message")
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, TlsError> {
    if buf.is_empty() {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_str(buf: &mut &[u8]) -> Result<String, TlsError> {
    let len = get_u8(buf)? as usize;
    if buf.len() < len {
        return Err(truncated());
    }
    let text = String::from_utf8_lossy(&buf[..len]).into_owned();
    buf.advance(len);
    Ok(text)
}

fn get_list(buf: &mut &[u8]) -> Result<Vec<String>, TlsError> {
    let count = get_u8(buf)?;
    (0..count).map(|_| get_str(buf)).collect()
}

impl Handshake {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Handshake::HelloRequest => out.push(HELLO_REQUEST),
            Handshake::ClientHello { hostname } => {
                out.push(CLIENT_HELLO);
                put_str(&mut out, hostname);
            }
            Handshake::ServerHello {
                client_auth,
                version,
                max_fragment,
                names,
                issuers,
            } => {
                out.push(SERVER_HELLO);
                out.push(match client_auth {
                    ClientAuth::None => 0,
                    ClientAuth::Request => 1,
                    ClientAuth::Require => 3,
                });
                out.push(version.level());
                out.extend_from_slice(&max_fragment.to_be_bytes());
                put_list(&mut out, names);
                put_list(&mut out, issuers);
            }
            Handshake::Certificate { name } => {
                out.push(CERTIFICATE);
                match name {
                    Some(name) => {
                        out.push(1);
                        put_str(&mut out, name);
                    }
                    None => out.push(0),
                }
            }
            Handshake::Finished => out.push(FINISHED),
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, TlsError> {
        let buf = &mut buf;
        let message = match get_u8(buf)? {
            HELLO_REQUEST => Handshake::HelloRequest,
            CLIENT_HELLO => Handshake::ClientHello {
                hostname: get_str(buf)?,
            },
            SERVER_HELLO => {
                let flags = get_u8(buf)?;
                let client_auth = match flags & 0x3 {
                    0 => ClientAuth::None,
                    1 => ClientAuth::Request,
                    _ => ClientAuth::Require,
                };
                let level = get_u8(buf)?;
                let version = TlsVersion::from_level(level).ok_or_else(|| {
                    TlsError::protocol(format!("mock: unsupported protocol version {}", level))
                })?;
                if buf.len() < 2 {
                    return Err(truncated());
                }
                let max_fragment = buf.get_u16();
                Handshake::ServerHello {
                    client_auth,
                    version,
                    max_fragment,
                    names: get_list(buf)?,
                    issuers: get_list(buf)?,
                }
            }
            CERTIFICATE => {
                let name = match get_u8(buf)? {
                    0 => None,
                    _ => Some(get_str(buf)?),
                };
                Handshake::Certificate { name }
            }
            FINISHED => Handshake::Finished,
            other => {
                return Err(TlsError::protocol(format!(
                    "mock: unknown handshake message {}",
                    other
                )))
            }
        };
        Ok(message)
    }

    /// Frame this message as a handshake record
    pub fn write_to(&self, out: &mut BytesMut) {
        encode(ContentType::Handshake, &self.encode(), out);
    }
}

/// Frame an alert record
pub fn write_alert(level: u8, description: u8, out: &mut BytesMut) {
    encode(ContentType::Alert, &[level, description], out);
}
