use std::fmt;

use floscan_consensus::Hash256;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Block or transaction hash in internal (wire) byte order.
///
/// Inventory vectors, locators, and `getdata` payloads carry this order.
/// For the display order used by logs and RPC, convert with [`BlockHash::reversed`].
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockHash(Hash256);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn from_bytes(bytes: Hash256) -> Self {
        BlockHash(bytes)
    }

    pub fn as_bytes(&self) -> &Hash256 {
        &self.0
    }

    pub fn reversed(&self) -> Rhash {
        let mut out = [0u8; 32];
        for (index, byte) in self.0.iter().rev().enumerate() {
            out[index] = *byte;
        }
        Rhash(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.reversed())
    }
}

/// Block or transaction hash in reversed (display) byte order.
///
/// This is the form humans read and `getchaintips` reports. It is a distinct
/// type from [`BlockHash`] so the two orders cannot be conflated.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Rhash(Hash256);

impl Rhash {
    pub fn from_bytes(bytes: Hash256) -> Self {
        Rhash(bytes)
    }

    pub fn as_bytes(&self) -> &Hash256 {
        &self.0
    }

    pub fn internal(&self) -> BlockHash {
        let mut out = [0u8; 32];
        for (index, byte) in self.0.iter().rev().enumerate() {
            out[index] = *byte;
        }
        BlockHash(out)
    }

    pub fn from_hex(hex: &str) -> Option<Rhash> {
        if hex.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        let bytes = hex.as_bytes();
        for index in 0..32 {
            let high = hex_value(bytes[index * 2])?;
            let low = hex_value(bytes[index * 2 + 1])?;
            out[index] = (high << 4) | low;
        }
        Some(Rhash(out))
    }
}

impl fmt::Display for Rhash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Rhash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rhash({self})")
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(hex_digit(byte >> 4));
        out.push(hex_digit(byte & 0x0f));
    }
    out
}

fn hex_digit(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        _ => (b'a' + (value - 10)) as char,
    }
}
