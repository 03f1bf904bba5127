// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Carrier abstraction
//!
//! A carrier is the authenticated, confidential transport between client and
//! server. Two kinds exist: a TLS-terminated byte stream ([`ByteStream`]),
//! and a bidirectional message stream of length-delimited payloads handed
//! over by an RPC host ([`MessageStream`]). The relay engines are written
//! once against the split halves.
//!
//! Message carriers preserve framing by construction; byte carriers rely on
//! the client writing one trojan frame per stream write, which the protocol
//! requires.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::pool::{BufferPool, Envelope, PooledBuf};

/// Inbound half of a carrier.
#[async_trait]
pub trait CarrierRead: Send {
    /// Read the next chunk or message into `buf`, replacing its contents.
    ///
    /// Returns the number of bytes placed in `buf`; 0 means the peer closed
    /// the carrier in an orderly way.
    async fn read_chunk(&mut self, buf: &mut PooledBuf) -> io::Result<usize>;
}

/// Outbound half of a carrier. One writer at a time.
#[async_trait]
pub trait CarrierWrite: Send {
    /// Write one chunk or message in full.
    async fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Signal end of stream to the peer. Best effort.
    async fn close(&mut self);
}

/// A bidirectional carrier splittable into independently owned halves.
pub trait Carrier: Send {
    type Read: CarrierRead + 'static;
    type Write: CarrierWrite + 'static;

    fn into_split(self) -> (Self::Read, Self::Write);
}

/// Byte stream carrier over any duplex stream, usually a TLS server stream.
pub struct ByteStream<S>(pub S);

impl<S> Carrier for ByteStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Read = ByteStreamRead<S>;
    type Write = ByteStreamWrite<S>;

    fn into_split(self) -> (Self::Read, Self::Write) {
        let (r, w) = tokio::io::split(self.0);
        (ByteStreamRead(r), ByteStreamWrite(w))
    }
}

pub struct ByteStreamRead<S>(ReadHalf<S>);

#[async_trait]
impl<S> CarrierRead for ByteStreamRead<S>
where
    S: AsyncRead + Send + 'static,
{
    async fn read_chunk(&mut self, buf: &mut PooledBuf) -> io::Result<usize> {
        buf.clear();
        self.0.read_buf(&mut **buf).await
    }
}

pub struct ByteStreamWrite<S>(WriteHalf<S>);

#[async_trait]
impl<S> CarrierWrite for ByteStreamWrite<S>
where
    S: AsyncWrite + Send + 'static,
{
    async fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes).await
    }

    async fn close(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

/// Message stream carrier: a channel pair owned by an RPC host.
///
/// Each inbound envelope is exactly one trojan frame; each outbound frame is
/// sent as one envelope drawn from the envelope pool. The host returns
/// consumed envelopes to the pool by dropping them.
pub struct MessageStream {
    rx: mpsc::Receiver<Envelope>,
    tx: mpsc::Sender<Envelope>,
    envelopes: Arc<BufferPool>,
}

impl MessageStream {
    pub fn new(
        rx: mpsc::Receiver<Envelope>,
        tx: mpsc::Sender<Envelope>,
        envelopes: Arc<BufferPool>,
    ) -> MessageStream {
        MessageStream { rx, tx, envelopes }
    }
}

impl Carrier for MessageStream {
    type Read = MessageStreamRead;
    type Write = MessageStreamWrite;

    fn into_split(self) -> (Self::Read, Self::Write) {
        (
            MessageStreamRead { rx: self.rx },
            MessageStreamWrite {
                tx: self.tx,
                envelopes: self.envelopes,
            },
        )
    }
}

pub struct MessageStreamRead {
    rx: mpsc::Receiver<Envelope>,
}

#[async_trait]
impl CarrierRead for MessageStreamRead {
    async fn read_chunk(&mut self, buf: &mut PooledBuf) -> io::Result<usize> {
        buf.clear();
        let msg = match self.rx.recv().await {
            Some(m) => m,
            None => return Ok(0),
        };
        if msg.len() > buf.capacity() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message exceeds relay buffer size",
            ));
        }
        buf.extend_from_slice(&msg);
        Ok(msg.len())
    }
}

pub struct MessageStreamWrite {
    tx: mpsc::Sender<Envelope>,
    envelopes: Arc<BufferPool>,
}

#[async_trait]
impl CarrierWrite for MessageStreamWrite {
    async fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut envelope = self.envelopes.acquire();
        envelope.extend_from_slice(bytes);
        self.tx
            .send(envelope)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "message stream closed"))
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn byte_stream_chunks() {
        let pool = BufferPool::new(64);
        let (client, server) = tokio::io::duplex(256);
        let (mut r, mut w) = ByteStream(server).into_split();
        let (mut cr, mut cw) = tokio::io::split(client);

        cw.write_all(b"hello").await.unwrap();
        let mut buf = pool.acquire();
        let n = r.read_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        w.write_chunk(b"world").await.unwrap();
        let mut out = [0u8; 5];
        cr.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"world");

        drop(cw);
        drop(cr);
        let n = r.read_chunk(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn message_stream_frames() {
        let pool = BufferPool::new(64);
        let envelopes = BufferPool::new(64);

        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (mut r, mut w) = MessageStream::new(in_rx, out_tx, envelopes.clone()).into_split();

        let mut msg = envelopes.acquire();
        msg.extend_from_slice(b"one frame");
        in_tx.send(msg).await.unwrap();

        let mut buf = pool.acquire();
        let n = r.read_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one frame");

        w.write_chunk(b"reply").await.unwrap();
        let reply = out_rx.recv().await.unwrap();
        assert_eq!(&reply[..], b"reply");

        drop(in_tx);
        assert_eq!(r.read_chunk(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn message_stream_rejects_oversize() {
        let pool = BufferPool::new(8);
        let envelopes = BufferPool::new(64);

        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel::<Envelope>(4);
        let (mut r, _w) = MessageStream::new(in_rx, out_tx, envelopes.clone()).into_split();

        let mut msg = envelopes.acquire();
        msg.extend_from_slice(b"way too large for the pool");
        in_tx.send(msg).await.unwrap();

        let mut buf = pool.acquire();
        assert!(r.read_chunk(&mut buf).await.is_err());
    }
}
