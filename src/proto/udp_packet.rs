// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{Address, ProtocolError, CRLF};

/// UDP Packet
///
/// Each datagram crossing the carrier is wrapped in one of these, in both
/// directions: the address is the destination on the way out and the source
/// on the way back.
///
/// # Protocol
///
/// | [`Address`] | Length |  CRLF   | Payload  |
/// | ----------- | ------ | ------- | -------- |
/// |  Variable   |   2    | b"\r\n" | Variable |
pub struct UdpPacket<'a> {
    pub addr: Address<'a>,
    pub payload: &'a [u8],
}

impl<'a> UdpPacket<'a> {
    /// Parse one UDP Packet filling a whole carrier message.
    ///
    /// The declared length must consume the message exactly: a truncated
    /// payload, trailing bytes, or a second concatenated packet are all
    /// malformed. One carrier message carries one packet.
    pub fn from_bytes(bytes: &'a [u8]) -> Result<UdpPacket<'a>, ProtocolError> {
        let addr = Address::from_bytes(bytes)?;

        let rest = &bytes[addr.size()..];
        let header = rest.get(..4).ok_or(ProtocolError)?;
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        if &header[2..4] != CRLF {
            return Err(ProtocolError);
        }

        let payload = &rest[4..];
        if payload.len() != len {
            return Err(ProtocolError);
        }

        Ok(UdpPacket { addr, payload })
    }

    /// Total wire size of the packet.
    pub fn size(&self) -> usize {
        self.addr.size() + 2 + 2 + self.payload.len()
    }
}
