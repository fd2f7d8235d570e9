//! Channel request model and wire payload codec.
//!
//! Payloads follow the SSH connection protocol encoding: `uint32` values are
//! big-endian, strings are a `uint32` length followed by that many bytes.
//! Decoding is strict about truncation and trailing bytes, but textual fields
//! are decoded lossily so that whatever a client sends is still captured.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::Window;

/// Vendor keep-alive request names that are silently ignored.
pub const KEEPALIVE_REQUESTS: &[&str] = &[
    "winadj@putty.projects.tartarus.org",
    "simple@putty.projects.tartarus.org",
    "keepalive@openssh.com",
];

/// A request payload did not match the structure its type requires.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload ended before a field could be read.
    #[error("payload truncated reading {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    /// Bytes were left over after the last field.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Classification of a channel request by its type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    PtyReq,
    Env,
    Shell,
    Exec,
    Subsystem,
    WindowChange,
    KeepAlive,
    Unknown,
}

impl RequestKind {
    /// Maps a request type name to its kind.
    pub fn from_name(name: &str) -> Self {
        match name {
            "pty-req" => Self::PtyReq,
            "env" => Self::Env,
            "shell" => Self::Shell,
            "exec" => Self::Exec,
            "subsystem" => Self::Subsystem,
            "window-change" => Self::WindowChange,
            other if KEEPALIVE_REQUESTS.contains(&other) => Self::KeepAlive,
            _ => Self::Unknown,
        }
    }
}

/// A single request received on a logical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Request type name as sent by the peer.
    pub name: String,
    /// Whether the peer expects an explicit reply.
    pub want_reply: bool,
    /// Raw type-specific payload.
    pub payload: Bytes,
}

impl ChannelRequest {
    /// Creates a request that wants a reply.
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            want_reply: true,
            payload: payload.into(),
        }
    }

    /// Sets whether the peer expects a reply.
    pub fn with_want_reply(mut self, want_reply: bool) -> Self {
        self.want_reply = want_reply;
        self
    }

    /// Returns the kind of this request.
    pub fn kind(&self) -> RequestKind {
        RequestKind::from_name(&self.name)
    }
}

// -----------------------------------------------------------------------------
// Reader / writer helpers
// -----------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, field: &'static str, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        self.need(field, 4)?;
        Ok(self.buf.get_u32())
    }

    fn bytes(&mut self, field: &'static str) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32(field)? as usize;
        self.need(field, len)?;
        let value = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(value)
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        self.bytes(field)
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

fn put_string(out: &mut BytesMut, value: &[u8]) {
    // SSH strings are length-prefixed with a u32.
    out.put_u32(value.len() as u32);
    out.put_slice(value);
}

// -----------------------------------------------------------------------------
// Payload structures
// -----------------------------------------------------------------------------

/// Parameters of a `pty-req` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal type, e.g. "xterm-256color".
    pub term: String,
    /// Width in characters.
    pub width: u32,
    /// Height in characters.
    pub height: u32,
    /// Width in pixels.
    pub pixel_width: u32,
    /// Height in pixels.
    pub pixel_height: u32,
    /// Encoded terminal modes, kept opaque.
    pub modes: Vec<u8>,
}

impl Default for PtyRequest {
    /// The pty synthesized when a shell is requested without a `pty-req`.
    fn default() -> Self {
        Self {
            term: "vt100".to_string(),
            width: 80,
            height: 24,
            pixel_width: 0,
            pixel_height: 0,
            modes: Vec::new(),
        }
    }
}

impl PtyRequest {
    /// Decodes a `pty-req` payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let req = Self {
            term: r.string("term")?,
            width: r.u32("width")?,
            height: r.u32("height")?,
            pixel_width: r.u32("pixel_width")?,
            pixel_height: r.u32("pixel_height")?,
            modes: r.bytes("modes")?,
        };
        r.finish()?;
        Ok(req)
    }

    /// Encodes this request as a `pty-req` payload.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(24 + self.term.len() + self.modes.len());
        put_string(&mut out, self.term.as_bytes());
        out.put_u32(self.width);
        out.put_u32(self.height);
        out.put_u32(self.pixel_width);
        out.put_u32(self.pixel_height);
        put_string(&mut out, &self.modes);
        out.freeze()
    }

    /// Returns the character geometry.
    pub fn window(&self) -> Window {
        Window {
            width: self.width,
            height: self.height,
        }
    }
}

/// An `env` request. Acknowledged, never applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRequest {
    pub name: String,
    pub value: String,
}

impl EnvRequest {
    /// Decodes an `env` payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let req = Self {
            name: r.string("name")?,
            value: r.string("value")?,
        };
        r.finish()?;
        Ok(req)
    }

    /// Encodes this request as an `env` payload.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(8 + self.name.len() + self.value.len());
        put_string(&mut out, self.name.as_bytes());
        put_string(&mut out, self.value.as_bytes());
        out.freeze()
    }
}

/// A `window-change` request. Pixel dimensions are read but not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChangeRequest {
    pub width: u32,
    pub height: u32,
}

impl WindowChangeRequest {
    /// Decodes a `window-change` payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let width = r.u32("width")?;
        let height = r.u32("height")?;
        r.u32("pixel_width")?;
        r.u32("pixel_height")?;
        r.finish()?;
        Ok(Self { width, height })
    }

    /// Encodes a `window-change` payload with the given pixel dimensions.
    pub fn encode(&self, pixel_width: u32, pixel_height: u32) -> Bytes {
        let mut out = BytesMut::with_capacity(16);
        out.put_u32(self.width);
        out.put_u32(self.height);
        out.put_u32(pixel_width);
        out.put_u32(pixel_height);
        out.freeze()
    }

    /// Returns the new character geometry.
    pub fn window(&self) -> Window {
        Window {
            width: self.width,
            height: self.height,
        }
    }
}

/// Decodes the payload of a request that carries a single string, such as
/// `subsystem` (the subsystem name) or `exec` (the command line).
pub fn decode_single_string(payload: &[u8], field: &'static str) -> Result<String, DecodeError> {
    let mut r = Reader::new(payload);
    let value = r.string(field)?;
    r.finish()?;
    Ok(value)
}

/// Encodes a payload carrying a single string.
pub fn encode_single_string(value: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + value.len());
    put_string(&mut out, value);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xterm_pty() -> PtyRequest {
        PtyRequest {
            term: "xterm".to_string(),
            width: 132,
            height: 43,
            pixel_width: 640,
            pixel_height: 480,
            modes: vec![1, 0, 0, 0, 3, 0],
        }
    }

    #[test]
    fn test_pty_request_wire_layout() {
        let encoded = xterm_pty().encode();
        let mut expected = vec![0, 0, 0, 5];
        expected.extend_from_slice(b"xterm");
        expected.extend_from_slice(&[0, 0, 0, 132, 0, 0, 0, 43, 0, 0, 2, 128, 0, 0, 1, 224]);
        expected.extend_from_slice(&[0, 0, 0, 6, 1, 0, 0, 0, 3, 0]);
        assert_eq!(&encoded[..], &expected[..]);
        assert_eq!(PtyRequest::decode(&expected).unwrap(), xterm_pty());
    }

    #[test]
    fn test_pty_request_truncated() {
        let encoded = xterm_pty().encode();
        let err = PtyRequest::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { field: "modes", .. }));

        let err = PtyRequest::decode(&[]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { field: "term", .. }));
    }

    #[test]
    fn test_pty_request_oversized_length_prefix() {
        // Term length claims far more bytes than exist.
        let payload = [0xff, 0xff, 0xff, 0xff, b'x'];
        assert!(matches!(
            PtyRequest::decode(&payload),
            Err(DecodeError::Truncated { field: "term", .. })
        ));
    }

    #[test]
    fn test_pty_request_trailing_bytes() {
        let mut payload = xterm_pty().encode().to_vec();
        payload.push(0);
        assert_eq!(
            PtyRequest::decode(&payload),
            Err(DecodeError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_pty_request_default_is_vt100() {
        let pty = PtyRequest::default();
        assert_eq!(pty.term, "vt100");
        assert_eq!(pty.window(), Window { width: 80, height: 24 });
        assert!(pty.modes.is_empty());
    }

    #[test]
    fn test_env_request_decode() {
        let mut payload = vec![0, 0, 0, 4];
        payload.extend_from_slice(b"LANG");
        payload.extend_from_slice(&[0, 0, 0, 5]);
        payload.extend_from_slice(b"C.UTF");
        let env = EnvRequest::decode(&payload).unwrap();
        assert_eq!(env.name, "LANG");
        assert_eq!(env.value, "C.UTF");
    }

    #[test]
    fn test_env_request_missing_value() {
        let payload = [0, 0, 0, 1, b'A'];
        assert!(matches!(
            EnvRequest::decode(&payload),
            Err(DecodeError::Truncated { field: "value", .. })
        ));
    }

    #[test]
    fn test_env_request_non_utf8_is_kept() {
        let payload = [0, 0, 0, 1, b'A', 0, 0, 0, 2, 0xff, b'z'];
        let env = EnvRequest::decode(&payload).unwrap();
        assert_eq!(env.name, "A");
        assert!(env.value.ends_with('z'));
    }

    #[test]
    fn test_window_change_reads_only_character_dims() {
        let payload = [0, 0, 0, 100, 0, 0, 0, 30, 0, 0, 3, 0, 0, 0, 2, 0];
        let change = WindowChangeRequest::decode(&payload).unwrap();
        assert_eq!(change.window(), Window { width: 100, height: 30 });
    }

    #[test]
    fn test_window_change_requires_pixel_fields() {
        let payload = [0, 0, 0, 100, 0, 0, 0, 30];
        assert!(matches!(
            WindowChangeRequest::decode(&payload),
            Err(DecodeError::Truncated { field: "pixel_width", .. })
        ));
    }

    #[test]
    fn test_single_string_payload() {
        let payload = encode_single_string(b"sftp");
        assert_eq!(decode_single_string(&payload, "subsystem").unwrap(), "sftp");
        assert!(decode_single_string(&payload[..3], "subsystem").is_err());
    }

    #[test]
    fn test_request_kind_from_name() {
        assert_eq!(RequestKind::from_name("pty-req"), RequestKind::PtyReq);
        assert_eq!(RequestKind::from_name("window-change"), RequestKind::WindowChange);
        assert_eq!(
            RequestKind::from_name("winadj@putty.projects.tartarus.org"),
            RequestKind::KeepAlive
        );
        assert_eq!(RequestKind::from_name("x11-req"), RequestKind::Unknown);
    }
}
