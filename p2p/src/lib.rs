#![allow(clippy::new_without_default)]
//! Peer address management.
//!
//! This crate holds the two address stores of a peerbook node: the
//! stochastic [`addrmgr::AddressManager`], which decides what endpoints
//! to remember and which one to dial next, and the
//! [`addrstat::AddressStats`] reputation tracker, which remembers how
//! often each endpoint has been seen reachable over the past two weeks.
pub mod addrmgr;
pub mod addrstat;
pub mod error;

pub use bitcoin;

pub use addrmgr::AddressManager;
pub use addrstat::AddressStats;
pub use error::Error;
