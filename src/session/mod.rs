// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Relay sessions
//!
//! A session bridges one authenticated carrier to one upstream resource: a
//! dialed TCP stream for `Connect`, a bound UDP socket for `UdpAssociate`.
//! Each direction runs as its own task; the first one to finish ends the
//! session and the other is torn down without draining.

use std::io;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::carrier::{CarrierRead, CarrierWrite};
use crate::proto::{Command, ProtocolError, Request};
use crate::server::ServerContext;

mod tcp;
mod udp;

pub use tcp::TcpSession;
pub use udp::UdpSession;

/// Session-level failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed request or packet framing. Closed without a reply.
    #[error("malformed request")]
    Protocol,
    /// The requested upstream could not be reached.
    #[error("upstream {target}: {source}")]
    Dial { target: String, source: io::Error },
    /// Read/write failure on either side after establishment.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<ProtocolError> for Error {
    fn from(_: ProtocolError) -> Self {
        Error::Protocol
    }
}

pub enum RelaySession {
    Tcp(TcpSession),
    Udp(UdpSession),
}

impl RelaySession {
    /// Open the upstream resource for a parsed request without touching the
    /// carrier.
    pub async fn new(ctx: &ServerContext, req: &Request<'_>) -> Result<RelaySession, Error> {
        match req.cmd {
            Command::Connect => {
                let session = TcpSession::open(ctx, req).await?;
                Ok(RelaySession::Tcp(session))
            }
            Command::UdpAssociate => {
                let session = UdpSession::bind(ctx, req).await?;
                Ok(RelaySession::Udp(session))
            }
        }
    }

    /// Bridge the carrier halves and the upstream until either direction
    /// finishes, errors, or `cancel` fires. Cancellation is a clean end.
    pub async fn run<R, W>(
        self,
        ctx: &ServerContext,
        reader: R,
        writer: W,
        cancel: CancellationToken,
    ) -> Result<(), Error>
    where
        R: CarrierRead + 'static,
        W: CarrierWrite + 'static,
    {
        match self {
            RelaySession::Tcp(s) => s.run(ctx, reader, writer, cancel).await,
            RelaySession::Udp(s) => s.run(ctx, reader, writer, cancel).await,
        }
    }
}

fn flatten(result: Result<io::Result<()>, JoinError>) -> io::Result<()> {
    match result {
        Ok(r) => r,
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}
