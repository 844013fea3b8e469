//! Client endpoint: the local SOCKS5 listener.

#[allow(clippy::module_inception)]
mod client;

pub use client::*;
