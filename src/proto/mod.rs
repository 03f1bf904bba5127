// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trojan Protocol
//!
//! Trojan is designed to build a tunnel through firewalls to bypass blocking
//! and censorship, looking like ordinary TLS traffic from the outside.
//!
//! A server that fails to verify the password or to parse the request must
//! close the carrier without writing anything back, so that probing it is
//! indistinguishable from probing a non-trojan TLS endpoint.
//!
//! # Protocol Details
//!
//! See [`Request`] and [`UdpPacket`].

use std::fmt::{self, Display, Formatter};
use std::io;

use sha2::{Digest, Sha224};

mod addr;
mod udp_packet;

pub use addr::*;
pub use udp_packet::*;

pub(crate) const CRLF: &[u8] = b"\r\n";

/// Length of the hex-encoded password digest.
pub const DIGEST_LEN: usize = 56;

// digest + CRLF + cmd + ATYP + port + CRLF
const MIN_REQUEST_LEN: usize = DIGEST_LEN + 2 + 1 + 1 + 2 + 2;

/// Error that the data is malformed
#[derive(Debug, PartialEq, Eq)]
pub struct ProtocolError;

impl From<ProtocolError> for io::Error {
    fn from(_: ProtocolError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, "malformed packet received")
    }
}

/// SHA224 password digest, kept in its 56 byte lower hexadecimal wire form.
#[derive(Clone, Copy)]
pub struct PasswordDigest {
    raw: [u8; DIGEST_LEN],
}

const HEX: &[u8; 16] = b"0123456789abcdef";

impl PasswordDigest {
    /// Digest a shared secret.
    pub fn new(secret: &[u8]) -> PasswordDigest {
        let sum = Sha224::digest(secret);
        let mut raw = [0; DIGEST_LEN];
        for (i, b) in sum.iter().enumerate() {
            raw[2 * i] = HEX[(b >> 4) as usize];
            raw[2 * i + 1] = HEX[(b & 0x0f) as usize];
        }
        PasswordDigest { raw }
    }

    /// Compare against the leading bytes of a received buffer.
    ///
    /// Runs in constant time over the full digest length so the outcome is
    /// not observable through response timing.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        let bytes = match bytes.get(..DIGEST_LEN) {
            Some(b) => b,
            None => return false,
        };
        let mut diff = 0u8;
        for (a, b) in self.raw.iter().zip(bytes) {
            diff |= a ^ b;
        }
        diff == 0
    }

    /// The hexadecimal wire form.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.raw
    }
}

impl Display for PasswordDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // SAFETY: raw is built from HEX, always valid UTF-8
        let str = unsafe { std::str::from_utf8_unchecked(&self.raw) };
        f.write_str(str)
    }
}

/// Trojan (Socks5-like) Command
///
/// Similar to Socks5 except `Bind` which is not supported by Trojan
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// `0x01`: Connect / TCP Stream
    Connect = 0x01,
    /// `0x03`: UDP Associate / UDP Packets
    UdpAssociate = 0x03,
}

impl Command {
    /// Parse from one byte.
    ///
    /// # Errors
    ///
    /// If `byte` is an unknown Command.
    #[inline]
    pub fn from_byte(byte: u8) -> Result<Command, ProtocolError> {
        match byte {
            0x01 => Ok(Command::Connect),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProtocolError),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let str = match self {
            Command::Connect => "tcp",
            Command::UdpAssociate => "udp",
        };
        f.write_str(str)
    }
}

/// Error from [`Request::parse`]
#[derive(Debug, PartialEq, Eq)]
pub enum RequestError {
    /// The password prefix does not match the server digest.
    ///
    /// The carrier must be closed without a reply.
    Auth,
    /// Anything else wrong with the header.
    Protocol,
}

impl From<ProtocolError> for RequestError {
    fn from(_: ProtocolError) -> Self {
        RequestError::Protocol
    }
}

/// Trojan Request
///
/// # Protocol
///
/// | [`PasswordDigest`] |   CRLF    | [`Command`] | [`Address`] |   CRLF    | Payload  |
/// | ------------------ | --------- | ----------- | ----------- | --------- | -------- |
/// |         56         | `b"\r\n"` |      1      |  Variable   | `b"\r\n"` | Variable |
pub struct Request<'a> {
    pub cmd: Command,
    pub addr: Address<'a>,
    pub payload: &'a [u8],
}

impl<'a> Request<'a> {
    /// Parse and authenticate the first chunk of a session.
    ///
    /// # Errors
    ///
    /// [`RequestError::Auth`] when the leading 56 bytes do not match
    /// `digest`; [`RequestError::Protocol`] when the chunk is shorter than a
    /// viable request, a `b"\r\n"` is missing, or a field fails to parse.
    pub fn parse(bytes: &'a [u8], digest: &PasswordDigest) -> Result<Request<'a>, RequestError> {
        if bytes.len() < MIN_REQUEST_LEN {
            return Err(RequestError::Protocol);
        }
        if !digest.verify(bytes) {
            return Err(RequestError::Auth);
        }
        if &bytes[DIGEST_LEN..DIGEST_LEN + 2] != CRLF {
            return Err(RequestError::Protocol);
        }
        let cmd = Command::from_byte(bytes[DIGEST_LEN + 2])?;
        let addr = Address::from_bytes(&bytes[DIGEST_LEN + 3..])?;

        let payload = {
            let offset = DIGEST_LEN + 3 + addr.size() + 2;
            let crlf = bytes.get(offset - 2..offset).ok_or(RequestError::Protocol)?;
            if crlf != CRLF {
                return Err(RequestError::Protocol);
            }
            &bytes[offset..]
        };

        Ok(Request { cmd, addr, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"1234";
    const SECRET_HEX: &[u8] = b"99fb2f48c6af4761f904fc85f95eb56190e5d40b1f44ec3a9c1fa319";

    fn request(cmd: u8, addr: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(SECRET_HEX);
        bytes.extend_from_slice(b"\r\n");
        bytes.push(cmd);
        bytes.extend_from_slice(addr);
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn digest_is_deterministic_lower_hex() {
        let digest = PasswordDigest::new(SECRET);
        assert_eq!(digest.as_bytes(), SECRET_HEX);
        assert_eq!(digest.to_string(), String::from_utf8_lossy(SECRET_HEX));
        assert_eq!(digest.as_bytes(), PasswordDigest::new(SECRET).as_bytes());
    }

    #[test]
    fn verify_checks_prefix_only() {
        let digest = PasswordDigest::new(SECRET);
        let mut bytes = SECRET_HEX.to_vec();
        bytes.extend_from_slice(b"\r\ntrailing");
        assert!(digest.verify(&bytes));
        assert!(!digest.verify(&bytes[..55]));
        bytes[10] ^= 0x01;
        assert!(!digest.verify(&bytes));
    }

    #[test]
    fn parse_connect_with_payload() {
        let bytes = request(0x01, &[0x01, 127, 0, 0, 1, 0x00, 0x50], b"GET / HTTP/1.0\r\n\r\n");
        let digest = PasswordDigest::new(SECRET);

        let req = Request::parse(&bytes, &digest).unwrap();
        assert_eq!(req.cmd, Command::Connect);
        assert_eq!(req.addr.to_string(), "127.0.0.1:80");
        assert_eq!(req.payload, b"GET / HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn parse_udp_associate_header_only() {
        let bytes = request(0x03, &[0x01, 8, 8, 8, 8, 0x00, 0x35], b"");
        let digest = PasswordDigest::new(SECRET);

        let req = Request::parse(&bytes, &digest).unwrap();
        assert_eq!(req.cmd, Command::UdpAssociate);
        assert_eq!(req.addr.to_string(), "8.8.8.8:53");
        assert!(req.payload.is_empty());
    }

    #[test]
    fn parse_rejects_short_input() {
        let digest = PasswordDigest::new(SECRET);
        for len in 0..MIN_REQUEST_LEN {
            let mut bytes = request(0x01, &[0x01, 127, 0, 0, 1, 0x00, 0x50], b"");
            bytes.truncate(len);
            assert!(matches!(Request::parse(&bytes, &digest), Err(RequestError::Protocol)));
        }
    }

    #[test]
    fn parse_rejects_bad_password() {
        let digest = PasswordDigest::new(SECRET);
        let bytes = [0x61u8; 80];
        assert!(matches!(Request::parse(&bytes, &digest), Err(RequestError::Auth)));
    }

    #[test]
    fn parse_rejects_bad_atyp() {
        let digest = PasswordDigest::new(SECRET);
        let bytes = request(0x01, &[0x09, 1, 2, 3, 4, 5, 6, 7], b"");
        assert!(matches!(Request::parse(&bytes, &digest), Err(RequestError::Protocol)));
    }

    #[test]
    fn parse_rejects_unknown_cmd() {
        let digest = PasswordDigest::new(SECRET);
        // 0x02 is Socks5 Bind, not a trojan command
        let bytes = request(0x02, &[0x01, 127, 0, 0, 1, 0x00, 0x50], b"");
        assert!(matches!(Request::parse(&bytes, &digest), Err(RequestError::Protocol)));
    }

    #[test]
    fn parse_rejects_missing_crlf() {
        let digest = PasswordDigest::new(SECRET);

        let mut bytes = request(0x01, &[0x01, 127, 0, 0, 1, 0x00, 0x50], b"x");
        bytes[DIGEST_LEN] = b'x';
        assert!(matches!(Request::parse(&bytes, &digest), Err(RequestError::Protocol)));

        let mut bytes = request(0x01, &[0x01, 127, 0, 0, 1, 0x00, 0x50], b"x");
        bytes[DIGEST_LEN + 3 + 7] = b'x';
        assert!(matches!(Request::parse(&bytes, &digest), Err(RequestError::Protocol)));
    }
}
