//! Server endpoint: tunnel stream and datagram listeners.

mod datagram;
#[allow(clippy::module_inception)]
mod server;

pub use server::*;
