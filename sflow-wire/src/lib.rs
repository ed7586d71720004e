//! sFlow v5 wire model and VXLAN decapsulating rewriter.
//!
//! The crate rewrites sFlow v5 datagrams whose raw-packet-header records
//! carry VXLAN-encapsulated frames: the outer Ethernet/IP/UDP/VXLAN prefix
//! of each sampled frame is removed and the record's length fields are
//! recomputed, so a downstream collector sees the inner frame directly.
//!
//! Everything operates on a pair of pre-sized byte buffers owned by a
//! [`cursor::Cursor`]; the steady-state rewrite path performs no heap
//! allocation. A datagram that cannot be rewritten (unsupported envelope,
//! malformed length, truncation) is forwarded verbatim instead.

pub mod cursor;
pub mod datagram;

pub use cursor::{Cursor, CursorError};
pub use datagram::{RewriteError, rewrite};
