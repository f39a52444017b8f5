//! Per-network chain parameters.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Network {
    Livenet,
    Testnet,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::Livenet => "livenet",
            Network::Testnet => "testnet",
        }
    }
}

/// Static parameters for one network.
///
/// `sync_anchor` is the trusted checkpoint from which header sync starts;
/// the crawler never requests headers predating it.
#[derive(Clone, Copy, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub name: &'static str,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
    pub sync_anchor: &'static str,
    pub sync_anchor_height: i32,
}

const LIVENET_PARAMS: ChainParams = ChainParams {
    network: Network::Livenet,
    name: "livenet",
    message_start: [0xfd, 0xc0, 0x5a, 0xf2],
    default_port: 7312,
    dns_seeds: &[
        "seed1.florincoin.org",
        "seed2.florincoin.org",
        "flodns.oip.fun",
        "dnsseed.florin.zelcore.io",
    ],
    sync_anchor: "1b8b90e1fb0b9b5be0a2973773dcd9df12d9cdebce6bc22c6c6034cd2a2b1a7a",
    sync_anchor_height: 2_000_000,
};

const TESTNET_PARAMS: ChainParams = ChainParams {
    network: Network::Testnet,
    name: "testnet",
    message_start: [0xfd, 0xc0, 0x5a, 0xf1],
    default_port: 17_312,
    dns_seeds: &["testnet-seed.florincoin.org"],
    sync_anchor: "9b7bc86236c34b5e3a39118c5d3ee24b6775aeb765b5b5e9372b1f0e53dcfa32",
    sync_anchor_height: 50_000,
};

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Livenet => LIVENET_PARAMS,
        Network::Testnet => TESTNET_PARAMS,
    }
}

/// Parses a display-order (reversed) hex string into an internal-order hash.
pub fn hash256_from_hex(hex: &str) -> Result<Hash256, String> {
    if hex.len() != 64 {
        return Err(format!("expected 64 hex characters, got {}", hex.len()));
    }
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for index in 0..32 {
        let high = hex_value(bytes[index * 2])
            .ok_or_else(|| format!("invalid hex character in '{hex}'"))?;
        let low = hex_value(bytes[index * 2 + 1])
            .ok_or_else(|| format!("invalid hex character in '{hex}'"))?;
        // Display order is reversed relative to the wire.
        out[31 - index] = (high << 4) | low;
    }
    Ok(out)
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_hashes_parse() {
        for network in [Network::Livenet, Network::Testnet] {
            let params = chain_params(network);
            let hash = hash256_from_hex(params.sync_anchor).expect("anchor parses");
            assert_ne!(hash, [0u8; 32]);
        }
    }

    #[test]
    fn hex_parse_reverses_byte_order() {
        let hex = "00000000000000000000000000000000000000000000000000000000000000ff";
        let hash = hash256_from_hex(hex).unwrap();
        assert_eq!(hash[0], 0xff);
        assert_eq!(hash[31], 0x00);
    }

    #[test]
    fn hex_parse_rejects_bad_input() {
        assert!(hash256_from_hex("abcd").is_err());
        assert!(hash256_from_hex(&"zz".repeat(32)).is_err());
    }
}
