use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256d, BlockHash, Rhash};
use crate::transaction::Transaction;

/// The 80-byte Litecoin-family block header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: BlockHash,
    pub merkle_root: BlockHash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(BlockHeader {
            version: decoder.read_i32_le()?,
            prev_hash: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_hash);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode_to(&mut encoder);
        encoder.into_inner()
    }

    /// Identity hash, double-SHA256 over the serialized header.
    ///
    /// Florincoin uses scrypt only for the proof-of-work check; block ids on
    /// the wire are sha256d, which is all the crawler needs.
    pub fn hash(&self) -> BlockHash {
        BlockHash::from_bytes(sha256d(&self.consensus_encode()))
    }

    pub fn rhash(&self) -> Rhash {
        self.hash().reversed()
    }
}

/// A full block body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::VarIntOutOfRange)?;
        let mut transactions = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode_from(&mut decoder)?);
        }
        Ok(Block {
            header,
            transactions,
        })
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.consensus_encode_to(&mut encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode_to(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn rhash(&self) -> Rhash {
        self.header.rhash()
    }

    pub fn txids(&self) -> Vec<BlockHash> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Height encoded in the coinbase scriptSig (BIP34).
    ///
    /// The wire header carries no height; this is the only way the crawler
    /// learns where a block body sits on its peer's chain.
    pub fn coinbase_height(&self) -> Option<i32> {
        let coinbase = self.transactions.first()?;
        if !coinbase.is_coinbase() {
            return None;
        }
        decode_script_int(&coinbase.inputs[0].script_sig)
    }
}

/// Serializes a height as the minimal script push BIP34 requires.
pub fn encode_coinbase_height(height: i32) -> Vec<u8> {
    if height == 0 {
        return vec![0x00];
    }
    if (1..=16).contains(&height) {
        return vec![0x50 + height as u8];
    }
    let mut bytes = Vec::new();
    let mut value = height as u32;
    while value > 0 {
        bytes.push((value & 0xff) as u8);
        value >>= 8;
    }
    // A set high bit would flip the script-number sign; pad with a zero byte.
    if bytes.last().copied().unwrap_or(0) & 0x80 != 0 {
        bytes.push(0x00);
    }
    let mut script = Vec::with_capacity(bytes.len() + 1);
    script.push(bytes.len() as u8);
    script.extend_from_slice(&bytes);
    script
}

fn decode_script_int(script: &[u8]) -> Option<i32> {
    let opcode = *script.first()?;
    match opcode {
        0x00 => Some(0),
        0x51..=0x60 => Some(i32::from(opcode - 0x50)),
        1..=4 => {
            let length = opcode as usize;
            if script.len() < 1 + length {
                return None;
            }
            let mut value: i64 = 0;
            for (index, byte) in script[1..=length].iter().enumerate() {
                value |= i64::from(*byte) << (8 * index);
            }
            // Sign bit of the final byte makes the script number negative;
            // no real chain encodes a negative height.
            if script[length] & 0x80 != 0 {
                return None;
            }
            i32::try_from(value).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{OutPoint, TxIn, TxOut};

    fn coinbase_at(height: i32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prev_out: OutPoint {
                    txid: BlockHash::ZERO,
                    vout: u32::MAX,
                },
                script_sig: encode_coinbase_height(height),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value: 2_500_000_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn block_at(height: i32, prev_hash: BlockHash) -> Block {
        Block {
            header: BlockHeader {
                version: 4,
                prev_hash,
                merkle_root: BlockHash::from_bytes(sha256d(&height.to_le_bytes())),
                time: 1_700_000_000 + height as u32,
                bits: 0x1e0f_ffff,
                nonce: height as u32,
            },
            transactions: vec![coinbase_at(height)],
        }
    }

    #[test]
    fn coinbase_height_round_trips() {
        for height in [0, 1, 16, 17, 127, 128, 255, 65_535, 2_000_000, i32::MAX] {
            let block = block_at(height, BlockHash::ZERO);
            assert_eq!(block.coinbase_height(), Some(height), "height {height}");
        }
    }

    #[test]
    fn coinbase_height_needs_a_coinbase() {
        let mut block = block_at(42, BlockHash::ZERO);
        block.transactions[0].inputs[0].prev_out.vout = 0;
        assert_eq!(block.coinbase_height(), None);
    }

    #[test]
    fn block_round_trip_preserves_hash() {
        let block = block_at(1234, BlockHash::from_bytes(sha256d(b"parent")));
        let bytes = block.consensus_encode();
        let decoded = Block::consensus_decode(&bytes).expect("decodes");
        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(decoded, block);
    }

    #[test]
    fn headers_chain_by_prev_hash() {
        let genesis = block_at(0, BlockHash::ZERO);
        let child = block_at(1, genesis.hash());
        assert_eq!(child.header.prev_hash, genesis.header.hash());
        assert_ne!(child.hash(), genesis.hash());
    }
}
