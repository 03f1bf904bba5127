// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use tokio::net::{self, TcpStream};

use super::ProtocolError;

/// Socks5-like Address Field
///
/// # Protocol
///
/// | ATYP | DST.ADDR | DST.PORT |
/// | ---- | -------- | -------- |
/// |  1   | Variable |    2     |
///
/// ## ATYP
///
/// ### IP V4 address: `0x01`
///
/// the address is a version-4 IP address, with a length of 4 octets.
///
/// ### DOMAINNAME: `0x03`
///
/// the address field contains a fully-qualified domain name. The first
/// octet of the address field contains the number of octets of name that
/// follow, there is no terminating NUL octet.
///
/// ### IP V6 address: `0x04`
///
/// the address is a version-6 IP address, with a length of 16 octets.
///
/// A decoded address keeps a reference to the exact wire bytes it was parsed
/// from: relays step through packed buffers with [`Address::size`] and reuse
/// [`Address::wire`] verbatim when reframing replies.
#[derive(Clone, Copy)]
pub struct Address<'a> {
    wire: &'a [u8],
    repr: AddressRepr<'a>,
}

#[derive(Clone, Copy)]
enum AddressRepr<'a> {
    Ip(SocketAddr),
    Name(&'a str, u16),
}

impl<'a> Address<'a> {
    /// Parse a Socks5-like Address field from the head of `bytes`.
    ///
    /// Trailing bytes are not consumed; use [`Address::size`] to skip past
    /// the field.
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Address<'a>, ProtocolError> {
        let kind = bytes.first().ok_or(ProtocolError)?;

        match kind {
            0x01 => {
                // IPv4, len: 6
                let slice = bytes.get(1..7).ok_or(ProtocolError)?;

                let ip = <[u8; 4]>::try_from(&slice[..4]).unwrap();
                let port = u16::from_be_bytes([slice[4], slice[5]]);

                Ok(Address {
                    wire: &bytes[..7],
                    repr: AddressRepr::Ip(SocketAddrV4::new(ip.into(), port).into()),
                })
            }
            0x03 => {
                // Domain Name
                let name_len = *bytes.get(1).ok_or(ProtocolError)? as usize;
                if name_len == 0 {
                    return Err(ProtocolError);
                }

                // len: name_len + 2
                let slice = bytes.get(2..2 + name_len + 2).ok_or(ProtocolError)?;

                let name =
                    std::str::from_utf8(&slice[..name_len]).map_err(|_| ProtocolError)?;
                let port = u16::from_be_bytes([slice[name_len], slice[name_len + 1]]);

                Ok(Address {
                    wire: &bytes[..1 + 1 + name_len + 2],
                    repr: AddressRepr::Name(name, port),
                })
            }
            0x04 => {
                // IPv6, len: 18
                let slice = bytes.get(1..19).ok_or(ProtocolError)?;

                let ip = <[u8; 16]>::try_from(&slice[..16]).unwrap();
                let port = u16::from_be_bytes([slice[16], slice[17]]);

                Ok(Address {
                    wire: &bytes[..19],
                    repr: AddressRepr::Ip(SocketAddrV6::new(ip.into(), port, 0, 0).into()),
                })
            }
            _ => Err(ProtocolError),
        }
    }

    /// The exact bytes this address occupies in its source buffer.
    #[inline]
    pub fn wire(&self) -> &'a [u8] {
        self.wire
    }

    /// The size of the address field in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.wire.len()
    }

    /// Open a TCP stream to the address, resolving names via the system.
    pub async fn open_tcp(&self) -> io::Result<TcpStream> {
        match self.repr {
            AddressRepr::Ip(a) => TcpStream::connect(a).await,
            AddressRepr::Name(n, p) => TcpStream::connect((n, p)).await,
        }
    }

    /// Resolve to a single socket address for UDP delivery.
    pub async fn resolve_udp(&self) -> io::Result<SocketAddr> {
        match self.repr {
            AddressRepr::Ip(a) => Ok(a),
            AddressRepr::Name(n, p) => net::lookup_host((n, p)).await?.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "name resolved to no address")
            }),
        }
    }
}

impl Display for Address<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.repr {
            AddressRepr::Ip(a) => a.fmt(f),
            AddressRepr::Name(n, p) => write!(f, "{}:{}", n, p),
        }
    }
}

/// Append the wire form of a resolved socket address.
///
/// Used when reframing replies from peers other than the cached first
/// destination, where no client-supplied wire bytes exist to reuse.
pub fn extend_socket_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(a) => {
            buf.push(0x01);
            buf.extend(a.ip().octets());
            buf.extend(a.port().to_be_bytes());
        }
        SocketAddr::V6(a) => {
            buf.push(0x04);
            buf.extend(a.ip().octets());
            buf.extend(a.port().to_be_bytes());
        }
    }
}
