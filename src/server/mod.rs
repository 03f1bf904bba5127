// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunnel server
//!
//! The TLS front: a TCP accept loop that terminates TLS and hands each
//! plaintext stream to the relay core as a byte-stream carrier. RPC hosts
//! bypass the front and feed message streams through
//! [`serve_message_stream`].
//!
//! Authentication and framing failures close the carrier without writing
//! anything back; to a probe this server is just another TLS endpoint.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::carrier::{ByteStream, Carrier, CarrierRead, MessageStream};
use crate::pool::{BufferPool, Envelope, DEFAULT_BUF_SIZE};
use crate::proto::{PasswordDigest, Request, RequestError};
use crate::session::{Error, RelaySession};

/// Process-wide relay state: the precomputed digest, the pools and the
/// knobs. Constructed once at startup and shared by every session.
pub struct ServerContext {
    pub digest: PasswordDigest,
    pub buffers: Arc<BufferPool>,
    pub envelopes: Arc<BufferPool>,
    pub dial_timeout: Duration,
    pub udp_bind: Option<SocketAddr>,
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(secret: &[u8]) -> ServerContext {
        ServerContext::with_buffer_size(secret, DEFAULT_BUF_SIZE)
    }

    pub fn with_buffer_size(secret: &[u8], buf_size: usize) -> ServerContext {
        ServerContext {
            digest: PasswordDigest::new(secret),
            buffers: BufferPool::new(buf_size),
            envelopes: BufferPool::new(buf_size),
            dial_timeout: Duration::from_secs(8),
            udp_bind: None,
            shutdown: CancellationToken::new(),
        }
    }
}

pub struct Server {
    pub bind: SocketAddr,
    pub tls: TlsAcceptor,
    pub ctx: Arc<ServerContext>,
}

impl Server {
    pub async fn run(self) -> io::Result<()> {
        let tcp = TcpListener::bind(self.bind).await?;

        log::info!("listen on {}/tcp", self.bind);
        loop {
            let (stream, src) = match tcp.accept().await {
                Ok(x) => x,
                Err(e) => {
                    log::error!("tcp accept: {}", e);
                    continue;
                }
            };
            let tls = self.tls.clone();
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_stream(ctx, tls, stream, src).await {
                    log::debug!("incoming from {}: {}", src, e);
                }
            });
        }
    }
}

async fn serve_stream(
    ctx: Arc<ServerContext>,
    tls: TlsAcceptor,
    stream: TcpStream,
    src: SocketAddr,
) -> io::Result<()> {
    log::debug!("tcp incoming from {}", src);

    let _ = stream.set_nodelay(true);
    let stream = tls.accept(stream).await?;
    serve_carrier(ctx, ByteStream(stream), src).await
}

/// Entry point for RPC hosts: serve one bidirectional message stream.
///
/// `rx` yields one trojan frame per envelope; frames for the client are sent
/// to `tx` as envelopes drawn from the context's envelope pool.
pub async fn serve_message_stream(
    ctx: Arc<ServerContext>,
    rx: mpsc::Receiver<Envelope>,
    tx: mpsc::Sender<Envelope>,
    src: SocketAddr,
) -> io::Result<()> {
    let envelopes = ctx.envelopes.clone();
    serve_carrier(ctx, MessageStream::new(rx, tx, envelopes), src).await
}

/// Drive one carrier from first chunk to teardown.
pub async fn serve_carrier<C: Carrier>(
    ctx: Arc<ServerContext>,
    carrier: C,
    src: SocketAddr,
) -> io::Result<()> {
    let (mut reader, writer) = carrier.into_split();

    let mut first = ctx.buffers.acquire();
    let n = reader.read_chunk(&mut first).await?;
    if n == 0 {
        return Ok(());
    }

    let req = match Request::parse(&first, &ctx.digest) {
        Ok(req) => req,
        Err(RequestError::Auth) => {
            log::debug!("bad password from {}", src);
            return Ok(());
        }
        Err(RequestError::Protocol) => {
            log::debug!("malformed request from {}", src);
            return Ok(());
        }
    };

    let session = match RelaySession::new(&ctx, &req).await {
        Ok(session) => session,
        Err(Error::Dial { target, source }) => {
            log::info!("upstream {} unreachable: {}", target, source);
            return Ok(());
        }
        Err(e) => {
            log::debug!("dispatch from {}: {}", src, e);
            return Ok(());
        }
    };

    log::info!("tunnel {} <-> {}/{} start", src, req.addr, req.cmd);

    let cancel = ctx.shutdown.child_token();
    match session.run(&ctx, reader, writer, cancel).await {
        Ok(()) => log::info!("tunnel {} <-> {}/{} end", src, req.addr, req.cmd),
        Err(e) => log::debug!("tunnel {} <-> {}/{} end: {}", src, req.addr, req.cmd, e),
    }
    Ok(())
}
