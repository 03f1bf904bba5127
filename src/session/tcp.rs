// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::carrier::{CarrierRead, CarrierWrite};
use crate::proto::Request;
use crate::server::ServerContext;

use super::{flatten, Error};

/// One TCP Connect bridge.
pub struct TcpSession {
    socket: TcpStream,
    payload: Bytes,
}

impl TcpSession {
    /// Dial the requested upstream, bounded by the configured dial timeout.
    pub(super) async fn open(ctx: &ServerContext, req: &Request<'_>) -> Result<TcpSession, Error> {
        let socket = match time::timeout(ctx.dial_timeout, req.addr.open_tcp()).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                return Err(Error::Dial {
                    target: req.addr.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                return Err(Error::Dial {
                    target: req.addr.to_string(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "dial timed out"),
                })
            }
        };

        Ok(TcpSession {
            socket,
            payload: Bytes::copy_from_slice(req.payload),
        })
    }

    pub(super) async fn run<R, W>(
        mut self,
        ctx: &ServerContext,
        mut reader: R,
        mut writer: W,
        cancel: CancellationToken,
    ) -> Result<(), Error>
    where
        R: CarrierRead + 'static,
        W: CarrierWrite + 'static,
    {
        // flush the request payload before the pumps start
        if !self.payload.is_empty() {
            self.socket.write_all(&self.payload).await?;
        }

        let (mut upstream_rd, mut upstream_wr) = self.socket.into_split();

        let pool = ctx.buffers.clone();
        let mut inbound = tokio::spawn(async move {
            // client -> upstream
            let mut buf = pool.acquire();
            loop {
                let n = reader.read_chunk(&mut buf).await?;
                if n == 0 {
                    break;
                }
                upstream_wr.write_all(&buf).await?;
            }
            let _ = upstream_wr.shutdown().await;
            io::Result::Ok(())
        });

        let pool = ctx.buffers.clone();
        let mut outbound = tokio::spawn(async move {
            // upstream -> client
            let mut buf = pool.acquire();
            loop {
                buf.clear();
                let n = upstream_rd.read_buf(&mut *buf).await?;
                if n == 0 {
                    break;
                }
                writer.write_chunk(&buf).await?;
            }
            writer.close().await;
            io::Result::Ok(())
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
