//! Multi-peer crawler and chain monitor for the Florincoin network.
//!
//! The crawler keeps many outbound sessions alive at once, syncs headers and
//! blocks from each peer independently, groups peers by the chain they
//! observe, and raises an alert when the full node reports a competing
//! branch near the tip.

pub mod chain_view;
pub mod fullnode;
pub mod p2p;
pub mod scanner;
pub mod session;
pub mod stats;
