//! Network parameters and protocol-wide constants.

pub mod constants;
pub mod params;

/// Raw 32-byte hash in internal (wire) byte order.
pub type Hash256 = [u8; 32];

pub use params::{chain_params, hash256_from_hex, ChainParams, Network};
