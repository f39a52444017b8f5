//! Scripted fake peer used by the end-to-end crawler tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use floscan_consensus::constants::{NODE_NETWORK, PROTOCOL_VERSION};
use floscan_primitives::block::{encode_coinbase_height, Block, BlockHeader};
use floscan_primitives::encoding::{Decoder, Encoder};
use floscan_primitives::hash::{sha256d, BlockHash};
use floscan_primitives::transaction::{OutPoint, Transaction, TxIn, TxOut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const MAX_HEADERS_PER_BATCH: usize = 2000;

/// A deterministic chain of full blocks hanging off the sync anchor.
pub struct FakeChain {
    pub anchor: BlockHash,
    pub anchor_height: i32,
    pub blocks: Vec<Block>,
    index: HashMap<BlockHash, usize>,
}

impl FakeChain {
    pub fn build(anchor: BlockHash, anchor_height: i32, length: usize) -> Self {
        let mut blocks = Vec::with_capacity(length);
        let mut index = HashMap::with_capacity(length);
        let mut prev = anchor;
        for i in 0..length {
            let height = anchor_height + 1 + i as i32;
            let coinbase = Transaction {
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
            };
            let header = BlockHeader {
                version: 4,
                prev_hash: prev,
                merkle_root: coinbase.txid(),
                time: 1_700_000_000 + i as u32,
                bits: 0x1e0f_ffff,
                nonce: i as u32,
            };
            prev = header.hash();
            index.insert(prev, blocks.len());
            blocks.push(Block {
                header,
                transactions: vec![coinbase],
            });
        }
        FakeChain {
            anchor,
            anchor_height,
            blocks,
            index,
        }
    }

    pub fn tip_height(&self) -> i32 {
        self.anchor_height + self.blocks.len() as i32
    }

    /// Index of the first block after the given locator hash.
    fn position_after(&self, locator: &[BlockHash]) -> usize {
        for hash in locator {
            if *hash == self.anchor {
                return 0;
            }
            if let Some(index) = self.index.get(hash) {
                return index + 1;
            }
        }
        0
    }

    fn block_by_hash(&self, hash: &BlockHash) -> Option<&Block> {
        self.index.get(hash).map(|index| &self.blocks[*index])
    }
}

#[derive(Default)]
pub struct FakePeerStats {
    pub getheaders: AtomicUsize,
    pub getblocks: AtomicUsize,
    pub getdata_blocks: AtomicUsize,
}

pub struct FakePeerConfig {
    pub magic: [u8; 4],
    pub chain: Arc<FakeChain>,
    pub inv_batch: usize,
    /// Entries replayed on the first `getaddr`.
    pub addr_gossip: Vec<SocketAddr>,
}

/// Binds a scripted peer on localhost and serves one connection at a time.
pub async fn spawn_fake_peer(config: FakePeerConfig) -> (SocketAddr, Arc<FakePeerStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake peer");
    let addr = listener.local_addr().expect("local addr");
    let stats = Arc::new(FakePeerStats::default());
    let stats_for_task = Arc::clone(&stats);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let config = FakePeerConfig {
                magic: config.magic,
                chain: Arc::clone(&config.chain),
                inv_batch: config.inv_batch,
                addr_gossip: config.addr_gossip.clone(),
            };
            let _ = serve_connection(stream, config, Arc::clone(&stats_for_task)).await;
        }
    });
    (addr, stats)
}

async fn serve_connection(
    mut stream: TcpStream,
    config: FakePeerConfig,
    stats: Arc<FakePeerStats>,
) -> std::io::Result<()> {
    let magic = config.magic;
    let mut addr_sent = false;
    loop {
        let (command, payload) = read_frame(&mut stream, magic).await?;
        match command.as_str() {
            "version" => {
                let version = build_version_payload(config.chain.tip_height());
                write_frame(&mut stream, magic, "version", &version).await?;
                write_frame(&mut stream, magic, "verack", &[]).await?;
            }
            "getheaders" => {
                stats.getheaders.fetch_add(1, Ordering::SeqCst);
                let locator = parse_locator(&payload);
                let start = config.chain.position_after(&locator);
                let end = (start + MAX_HEADERS_PER_BATCH).min(config.chain.blocks.len());
                let mut encoder = Encoder::new();
                encoder.write_varint((end - start) as u64);
                for block in &config.chain.blocks[start..end] {
                    block.header.consensus_encode_to(&mut encoder);
                    encoder.write_varint(0);
                }
                write_frame(&mut stream, magic, "headers", &encoder.into_inner()).await?;
            }
            "getblocks" => {
                stats.getblocks.fetch_add(1, Ordering::SeqCst);
                let locator = parse_locator(&payload);
                let start = config.chain.position_after(&locator);
                let end = (start + config.inv_batch).min(config.chain.blocks.len());
                if start >= end {
                    continue;
                }
                let mut encoder = Encoder::new();
                encoder.write_varint((end - start) as u64);
                for block in &config.chain.blocks[start..end] {
                    encoder.write_u32_le(2);
                    encoder.write_hash(&block.hash());
                }
                write_frame(&mut stream, magic, "inv", &encoder.into_inner()).await?;
            }
            "getdata" => {
                let mut decoder = Decoder::new(&payload);
                let count = decoder.read_varint().unwrap_or(0);
                for _ in 0..count {
                    let Ok(kind) = decoder.read_u32_le() else { break };
                    let Ok(hash) = decoder.read_hash() else { break };
                    if kind != 2 {
                        continue;
                    }
                    if let Some(block) = config.chain.block_by_hash(&hash) {
                        stats.getdata_blocks.fetch_add(1, Ordering::SeqCst);
                        write_frame(&mut stream, magic, "block", &block.consensus_encode())
                            .await?;
                    }
                }
            }
            "getaddr" => {
                if addr_sent || config.addr_gossip.is_empty() {
                    continue;
                }
                addr_sent = true;
                let mut encoder = Encoder::new();
                encoder.write_varint(config.addr_gossip.len() as u64);
                for addr in &config.addr_gossip {
                    encoder.write_u32_le(1_700_000_000);
                    encoder.write_u64_le(NODE_NETWORK);
                    let ip = match addr.ip() {
                        std::net::IpAddr::V4(ip4) => ip4.to_ipv6_mapped().octets(),
                        std::net::IpAddr::V6(ip6) => ip6.octets(),
                    };
                    encoder.write_bytes(&ip);
                    encoder.write_bytes(&addr.port().to_be_bytes());
                }
                write_frame(&mut stream, magic, "addr", &encoder.into_inner()).await?;
            }
            _ => {}
        }
    }
}

fn parse_locator(payload: &[u8]) -> Vec<BlockHash> {
    let mut decoder = Decoder::new(payload);
    let Ok(_version) = decoder.read_i32_le() else {
        return Vec::new();
    };
    let Ok(count) = decoder.read_varint() else {
        return Vec::new();
    };
    let mut locator = Vec::new();
    for _ in 0..count {
        match decoder.read_hash() {
            Ok(hash) => locator.push(hash),
            Err(_) => break,
        }
    }
    locator
}

fn build_version_payload(start_height: i32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(NODE_NETWORK);
    encoder.write_i64_le(1_700_000_000);
    for _ in 0..2 {
        encoder.write_u64_le(NODE_NETWORK);
        encoder.write_bytes(&[0u8; 16]);
        encoder.write_bytes(&0u16.to_be_bytes());
    }
    encoder.write_u64_le(0x4242_4242_4242_4242);
    encoder.write_var_str("/Florincoin:0.15.2/");
    encoder.write_i32_le(start_height);
    encoder.write_u8(0);
    encoder.into_inner()
}

pub async fn write_frame(
    stream: &mut TcpStream,
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(24 + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; 12];
    command_bytes[..command.len()].copy_from_slice(command.as_bytes());
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(payload);
    frame.extend_from_slice(&checksum[..4]);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await
}

pub async fn read_frame(
    stream: &mut TcpStream,
    magic: [u8; 4],
) -> std::io::Result<(String, Vec<u8>)> {
    let mut header = [0u8; 24];
    stream.read_exact(&mut header).await?;
    assert_eq!(&header[..4], &magic, "fake peer saw wrong magic");
    let command = header[4..16]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect::<String>();
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;
    Ok((command, payload))
}
