//! sockstun core types, constants, and configuration.
//!
//! This module has no networking of its own. It defines the values every
//! other layer agrees on: wire constants, the [`Address`] type, the error
//! hierarchy, and the immutable [`TunnelConfig`].

mod address;
mod config;
mod constants;
mod error;

pub use address::*;
pub use config::*;
pub use constants::*;
pub use error::*;
