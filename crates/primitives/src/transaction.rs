use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256d, BlockHash};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutPoint {
    pub txid: BlockHash,
    pub vout: u32,
}

impl OutPoint {
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prev_out: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

/// A legacy-format transaction.
///
/// The crawler requests plain (non-witness) serialization via `getdata`, so
/// witness data never appears on this path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        Self::consensus_decode_from(&mut decoder)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_varint()?;
        let input_count = usize::try_from(input_count).map_err(|_| DecodeError::VarIntOutOfRange)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let txid = decoder.read_hash()?;
            let vout = decoder.read_u32_le()?;
            let script_sig = decoder.read_var_bytes()?.to_vec();
            let sequence = decoder.read_u32_le()?;
            inputs.push(TxIn {
                prev_out: OutPoint { txid, vout },
                script_sig,
                sequence,
            });
        }
        let output_count = decoder.read_varint()?;
        let output_count =
            usize::try_from(output_count).map_err(|_| DecodeError::VarIntOutOfRange)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?.to_vec();
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            encoder.write_hash(&input.prev_out.txid);
            encoder.write_u32_le(input.prev_out.vout);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn txid(&self) -> BlockHash {
        BlockHash::from_bytes(sha256d(&self.consensus_encode()))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_out.is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TxIn {
                prev_out: OutPoint {
                    txid: BlockHash::from_bytes(sha256d(b"prev")),
                    vout: 1,
                },
                script_sig: vec![0x51],
                sequence: 0xffff_fffe,
            }],
            outputs: vec![TxOut {
                value: 5_000_000_000,
                script_pubkey: vec![0x6a, 0x01, 0x00],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let tx = sample_tx();
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decodes");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.inputs[0].prev_out = OutPoint {
            txid: BlockHash::ZERO,
            vout: u32::MAX,
        };
        assert!(tx.is_coinbase());
    }
}
