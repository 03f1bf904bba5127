// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pooled relay buffers
//!
//! Every relay direction borrows a fixed-size buffer from a shared pool
//! instead of allocating per read. Two process-wide pools exist: one for raw
//! relay buffers and one for the envelopes of the message-stream carrier.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Default buffer size. Fits a usual ethernet MTU.
pub const DEFAULT_BUF_SIZE: usize = 1500;

/// Idle buffers a pool retains; beyond this, released buffers are dropped.
const MAX_IDLE: usize = 1024;

/// A shared pool of fixed-size byte buffers.
pub struct BufferPool {
    size: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool {
            size,
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Buffer size handed out by this pool.
    pub fn buf_size(&self) -> usize {
        self.size
    }

    /// Take a buffer, allocating a fresh one when the pool is empty.
    ///
    /// The buffer always comes back empty with its full capacity spare.
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let buf = self.idle.lock().unwrap().pop();
        let buf = buf.unwrap_or_else(|| Vec::with_capacity(self.size));
        PooledBuf {
            buf,
            pool: self.clone(),
        }
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < MAX_IDLE {
            idle.push(buf);
        }
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// Owned by exactly one relay direction at a time; returned to the pool on
/// drop, on error paths included.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(mem::take(&mut self.buf));
    }
}

/// Message envelope for the message-stream carrier, loaned from the
/// envelope pool.
pub type Envelope = PooledBuf;
