// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trojan tunneling relay
//!
//! A server-side relay for the Trojan protocol: clients present a hashed
//! shared secret and a Socks5-like command as the first bytes of an
//! authenticated carrier, and the server bridges the stream to an arbitrary
//! TCP endpoint or UDP peer set.
//!
//! Two carriers are supported through one relay engine: a TLS-terminated
//! byte stream, and a message stream of length-delimited payloads handed
//! over by an RPC host. See [`carrier`].

pub mod carrier;
pub mod pool;
pub mod proto;
pub mod server;
pub mod session;
pub mod tls;
