//! sockstun - Transport Layer
//!
//! Plaintext framing shared by both tunnel ends. A frame carries one
//! destination address and one write worth of payload; the cipher layer
//! wraps each frame in exactly one record.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Connection coordinators          │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   [LEN][ATYP][DST.ADDR][DST.PORT][DATA] │
//! ├─────────────────────────────────────────┤
//! │         Security Layer                  │
//! ├─────────────────────────────────────────┤
//! │              TCP / UDP                  │
//! └─────────────────────────────────────────┘
//! ```

mod frame;

pub use frame::*;
