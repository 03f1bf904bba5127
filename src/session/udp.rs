// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::carrier::{CarrierRead, CarrierWrite};
use crate::proto::{extend_socket_addr, Request, UdpPacket, CRLF};
use crate::server::ServerContext;

use super::{flatten, Error};

/// One UDP Associate bridge.
///
/// The request address only announces intent; every datagram crossing the
/// carrier names its own destination. The address of the first data packet
/// is cached: its resolved endpoint saves re-resolution on the forward path
/// and its wire bytes are replayed verbatim on matching replies.
pub struct UdpSession {
    socket: Arc<UdpSocket>,
    payload: Bytes,
}

impl UdpSession {
    /// Bind the relay socket at the configured or an ephemeral address.
    pub(super) async fn bind(ctx: &ServerContext, req: &Request<'_>) -> Result<UdpSession, Error> {
        let socket = match ctx.udp_bind {
            Some(bind) => UdpSocket::bind(bind).await,
            None => match UdpSocket::bind(default_bind()).await {
                Ok(socket) => Ok(socket),
                // the dual-stack bind fails on hosts without a v6 stack
                Err(_) if default_bind().is_ipv6() => {
                    UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0)).await
                }
                Err(e) => Err(e),
            },
        };
        let socket = match socket {
            Ok(socket) => socket,
            Err(e) => {
                return Err(Error::Dial {
                    target: req.addr.to_string(),
                    source: e,
                })
            }
        };

        Ok(UdpSession {
            socket: Arc::new(socket),
            payload: Bytes::copy_from_slice(req.payload),
        })
    }

    pub(super) async fn run<R, W>(
        self,
        ctx: &ServerContext,
        mut reader: R,
        mut writer: W,
        cancel: CancellationToken,
    ) -> Result<(), Error>
    where
        R: CarrierRead + 'static,
        W: CarrierWrite + 'static,
    {
        let is_v6 = matches!(self.socket.local_addr()?, SocketAddr::V6(_));

        // First data packet: byte-stream clients usually coalesce it with
        // the request, otherwise it is the next carrier message.
        let mut first_buf = ctx.buffers.acquire();
        let first = if self.payload.is_empty() {
            let n = reader.read_chunk(&mut first_buf).await?;
            if n == 0 {
                return Ok(());
            }
            &first_buf[..]
        } else {
            &self.payload[..]
        };

        let (first_dest, first_resolved) = {
            let packet = UdpPacket::from_bytes(first)?;
            let resolved = match packet.addr.resolve_udp().await {
                Ok(a) => canonical(a),
                Err(e) => {
                    return Err(Error::Dial {
                        target: packet.addr.to_string(),
                        source: e,
                    })
                }
            };
            self.socket
                .send_to(packet.payload, map_family(is_v6, resolved))
                .await?;
            (Bytes::copy_from_slice(packet.addr.wire()), resolved)
        };
        drop(first_buf);

        // client -> destinations
        let socket = self.socket.clone();
        let pool = ctx.buffers.clone();
        let dest_wire = first_dest.clone();
        let mut inbound = tokio::spawn(async move {
            let mut buf = pool.acquire();
            loop {
                let n = reader.read_chunk(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let packet = UdpPacket::from_bytes(&buf).map_err(io::Error::from)?;
                let dest = if packet.addr.wire() == &dest_wire[..] {
                    first_resolved
                } else {
                    canonical(packet.addr.resolve_udp().await?)
                };
                socket.send_to(packet.payload, map_family(is_v6, dest)).await?;
            }
            io::Result::Ok(())
        });

        // destinations -> client
        let socket = self.socket.clone();
        let pool = ctx.buffers.clone();
        let mut outbound = tokio::spawn(async move {
            let mut payload = pool.acquire();
            let mut frame = pool.acquire();
            let cap = payload.capacity();
            payload.resize(cap, 0);
            loop {
                let (n, peer) = socket.recv_from(&mut payload).await?;
                let peer = canonical(peer);

                frame.clear();
                if peer == first_resolved {
                    frame.extend_from_slice(&first_dest);
                } else {
                    extend_socket_addr(&mut frame, &peer);
                }
                frame.extend((n as u16).to_be_bytes());
                frame.extend_from_slice(CRLF);
                frame.extend_from_slice(&payload[..n]);

                writer.write_chunk(&frame).await?;
            }
        });

        let result = tokio::select! {
            r = &mut inbound => {
                outbound.abort();
                flatten(r)
            }
            r = &mut outbound => {
                inbound.abort();
                flatten(r)
            }
            _ = cancel.cancelled() => {
                inbound.abort();
                outbound.abort();
                Ok(())
            }
        };
        result.map_err(Error::Io)
    }
}

fn default_bind() -> SocketAddr {
    #[cfg(target_os = "linux")]
    let ip = IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED);
    #[cfg(not(target_os = "linux"))]
    let ip = IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);
    SocketAddr::new(ip, 0)
}

/// Strip the `::ffff:a.b.c.d` mapping a dual-stack socket reports for V4
/// peers, so comparisons and reply encoding see the plain V4 form.
fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// A V6 socket cannot send to a bare V4 destination; map it back.
fn map_family(is_v6: bool, dest: SocketAddr) -> SocketAddr {
    match dest {
        SocketAddr::V4(a) if is_v6 => {
            SocketAddr::new(IpAddr::V6(a.ip().to_ipv6_mapped()), a.port())
        }
        dest => dest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_unmaps_v4() {
        let mapped: SocketAddr = "[::ffff:1.2.3.4]:53".parse().unwrap();
        let plain: SocketAddr = "1.2.3.4:53".parse().unwrap();
        assert_eq!(canonical(mapped), plain);

        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        assert_eq!(canonical(v6), v6);
    }

    #[test]
    fn map_family_targets_the_socket() {
        let v4: SocketAddr = "1.2.3.4:53".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:1.2.3.4]:53".parse().unwrap();
        assert_eq!(map_family(true, v4), mapped);
        assert_eq!(map_family(false, v4), v4);
    }
}
