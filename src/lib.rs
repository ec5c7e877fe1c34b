//! Peerbook is a stochastic peer-address manager for Bitcoin-like
//! peer-to-peer nodes. It remembers a bounded set of network endpoints,
//! selects among them when the node wants a new outbound connection, and
//! persists everything across restarts.
//!
//! The interesting pieces live in the member crates:
//!
//! * [`p2p::addrmgr`]: the bucketed address manager.
//! * [`p2p::addrstat`]: the long-term reputation tracker.
pub use peerbook_common as common;
pub use peerbook_p2p as p2p;
