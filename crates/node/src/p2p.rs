use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use floscan_consensus::constants::{NODE_NETWORK, PROTOCOL_VERSION, USER_AGENT};
use floscan_primitives::block::BlockHeader;
use floscan_primitives::encoding::{Decoder, Encoder};
use floscan_primitives::hash::{sha256d, BlockHash};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_INV_RESULTS: usize = 50_000;
pub const MAX_ADDR_RESULTS: usize = 1000;
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("peer is stalling: {0}")]
    Stalling(&'static str),
}

/// How a session failure is surfaced, per the crawler's error policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectClass {
    /// Ignore entirely; the supervisor is not notified.
    Silent,
    /// Expected churn; emit a disconnect but keep the logs quiet.
    Quiet,
    /// Unexpected; log at error level and emit a disconnect.
    Loud,
}

impl PeerError {
    pub fn disconnect_class(&self) -> DisconnectClass {
        match self {
            PeerError::Io(err) => match err.kind() {
                io::ErrorKind::ConnectionReset => DisconnectClass::Silent,
                io::ErrorKind::ConnectionRefused
                | io::ErrorKind::HostUnreachable
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
                | io::ErrorKind::UnexpectedEof => DisconnectClass::Quiet,
                _ => DisconnectClass::Loud,
            },
            PeerError::Stalling(_) => DisconnectClass::Quiet,
            PeerError::Protocol(_) => DisconnectClass::Loud,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NetTotalsSnapshot {
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub connections: usize,
}

#[derive(Debug, Default)]
pub struct NetTotals {
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    connections: AtomicUsize,
}

impl NetTotals {
    pub fn add_recv(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        self.connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            })
            .ok();
    }

    pub fn snapshot(&self) -> NetTotalsSnapshot {
        NetTotalsSnapshot {
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the connection gauge when the last half of a peer goes away.
struct ConnectionGuard {
    net_totals: Arc<NetTotals>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.net_totals.dec_connections();
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InventoryVector {
    pub kind: u32,
    pub hash: BlockHash,
}

impl InventoryVector {
    pub fn block(hash: BlockHash) -> Self {
        InventoryVector {
            kind: MSG_BLOCK,
            hash,
        }
    }

    pub fn tx(hash: BlockHash) -> Self {
        InventoryVector { kind: MSG_TX, hash }
    }

    pub fn is_block(&self) -> bool {
        self.kind == MSG_BLOCK
    }

    pub fn is_tx(&self) -> bool {
        self.kind == MSG_TX
    }
}

#[derive(Clone, Debug, Default)]
pub struct VersionInfo {
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
}

pub struct Peer {
    stream: TcpStream,
    magic: [u8; 4],
    addr: SocketAddr,
    net_totals: Arc<NetTotals>,
    guard: ConnectionGuard,
}

impl Peer {
    pub async fn connect(
        addr: SocketAddr,
        magic: [u8; 4],
        net_totals: Arc<NetTotals>,
    ) -> Result<Self, PeerError> {
        let stream = TcpStream::connect(addr).await?;
        net_totals.inc_connections();
        let guard = ConnectionGuard {
            net_totals: Arc::clone(&net_totals),
        };
        Ok(Self {
            stream,
            magic,
            addr,
            net_totals,
            guard,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn send_message(&mut self, command: &str, payload: &[u8]) -> Result<(), PeerError> {
        write_frame(&mut self.stream, self.magic, command, payload, &self.net_totals).await
    }

    pub async fn read_message(&mut self) -> Result<(String, Vec<u8>), PeerError> {
        read_frame(&mut self.stream, self.magic, &self.net_totals).await
    }

    /// Version/verack exchange. Answers `ping` inline; anything else received
    /// before both sides acknowledged is dropped.
    pub async fn handshake(&mut self, start_height: i32) -> Result<VersionInfo, PeerError> {
        let payload = build_version_payload(start_height);
        self.send_message("version", &payload).await?;

        let mut info = VersionInfo::default();
        let mut got_verack = false;
        let mut got_version = false;
        while !(got_verack && got_version) {
            let (command, payload) = self.read_message().await?;
            match command.as_str() {
                "version" => {
                    got_version = true;
                    self.send_message("verack", &[]).await?;
                    if let Ok(parsed) = parse_version(&payload) {
                        info = parsed;
                    }
                }
                "verack" => {
                    got_verack = true;
                }
                "ping" => {
                    self.send_message("pong", &payload).await?;
                }
                _ => {}
            }
        }
        Ok(info)
    }

    /// Splits into independently owned halves so a session can read and
    /// write concurrently.
    pub fn split(self) -> (PeerReader, PeerWriter) {
        let (reader, writer) = self.stream.into_split();
        (
            PeerReader {
                reader,
                magic: self.magic,
                net_totals: Arc::clone(&self.net_totals),
            },
            PeerWriter {
                writer,
                magic: self.magic,
                net_totals: self.net_totals,
                _guard: self.guard,
            },
        )
    }
}

pub struct PeerReader {
    reader: OwnedReadHalf,
    magic: [u8; 4],
    net_totals: Arc<NetTotals>,
}

impl PeerReader {
    pub async fn read_message(&mut self) -> Result<(String, Vec<u8>), PeerError> {
        read_frame(&mut self.reader, self.magic, &self.net_totals).await
    }
}

pub struct PeerWriter {
    writer: OwnedWriteHalf,
    magic: [u8; 4],
    net_totals: Arc<NetTotals>,
    _guard: ConnectionGuard,
}

impl PeerWriter {
    pub async fn send_message(&mut self, command: &str, payload: &[u8]) -> Result<(), PeerError> {
        write_frame(&mut self.writer, self.magic, command, payload, &self.net_totals).await
    }

    pub async fn send_getheaders(&mut self, locator: &[BlockHash]) -> Result<(), PeerError> {
        let payload = build_locator_payload(locator);
        self.send_message("getheaders", &payload).await
    }

    pub async fn send_getblocks(&mut self, locator: &[BlockHash]) -> Result<(), PeerError> {
        let payload = build_locator_payload(locator);
        self.send_message("getblocks", &payload).await
    }

    pub async fn send_getdata(&mut self, items: &[InventoryVector]) -> Result<(), PeerError> {
        let payload = build_getdata_payload(items);
        self.send_message("getdata", &payload).await
    }

    pub async fn send_getaddr(&mut self) -> Result<(), PeerError> {
        self.send_message("getaddr", &[]).await
    }

    pub async fn send_pong(&mut self, ping_payload: &[u8]) -> Result<(), PeerError> {
        self.send_message("pong", ping_payload).await
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
    net_totals: &NetTotals,
) -> Result<(), PeerError> {
    let cmd = command.as_bytes();
    if cmd.len() > 12 {
        return Err(PeerError::Protocol(format!("command '{command}' too long")));
    }
    let mut frame = Vec::with_capacity(24 + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; 12];
    command_bytes[..cmd.len()].copy_from_slice(cmd);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(payload);
    frame.extend_from_slice(&checksum[..4]);
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    net_totals.add_sent(frame.len());
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 4],
    net_totals: &NetTotals,
) -> Result<(String, Vec<u8>), PeerError> {
    let mut header = [0u8; 24];
    reader.read_exact(&mut header).await?;
    if header[..4] != magic {
        return Err(PeerError::Protocol("invalid network magic".to_string()));
    }
    let command = header[4..16]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect::<String>();
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(PeerError::Protocol(format!(
            "payload of {length} bytes exceeds limit"
        )));
    }
    let checksum = [header[20], header[21], header[22], header[23]];
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    let calc = sha256d(&payload);
    if checksum != calc[..4] {
        return Err(PeerError::Protocol("payload checksum mismatch".to_string()));
    }
    net_totals.add_recv(24 + payload.len());
    Ok((command, payload))
}

pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, PeerError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder
        .read_varint()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    let count = usize::try_from(count).map_err(|_| protocol("header count out of range"))?;
    if count > floscan_consensus::constants::MAX_HEADERS_RESULTS {
        return Err(protocol("header count exceeds limit"));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header = BlockHeader::consensus_decode_from(&mut decoder)
            .map_err(|err| PeerError::Protocol(err.to_string()))?;
        let _tx_count = decoder
            .read_varint()
            .map_err(|err| PeerError::Protocol(err.to_string()))?;
        headers.push(header);
    }
    Ok(headers)
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InventoryVector>, PeerError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder
        .read_varint()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    let count = usize::try_from(count).map_err(|_| protocol("inv count out of range"))?;
    if count > MAX_INV_RESULTS {
        return Err(protocol("inv count exceeds limit"));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = decoder
            .read_u32_le()
            .map_err(|err| PeerError::Protocol(err.to_string()))?;
        let hash = decoder
            .read_hash()
            .map_err(|err| PeerError::Protocol(err.to_string()))?;
        items.push(InventoryVector { kind, hash });
    }
    Ok(items)
}

pub fn parse_addr(payload: &[u8]) -> Result<Vec<SocketAddr>, PeerError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder
        .read_varint()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    let count = usize::try_from(count).map_err(|_| protocol("addr count out of range"))?;
    if count > MAX_ADDR_RESULTS {
        return Err(protocol("addr count exceeds limit"));
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let _time = decoder
            .read_u32_le()
            .map_err(|err| PeerError::Protocol(err.to_string()))?;
        let _services = decoder
            .read_u64_le()
            .map_err(|err| PeerError::Protocol(err.to_string()))?;
        let ip_bytes = decoder
            .read_fixed::<16>()
            .map_err(|err| PeerError::Protocol(err.to_string()))?;
        let port_bytes = decoder
            .read_fixed::<2>()
            .map_err(|err| PeerError::Protocol(err.to_string()))?;
        let port = u16::from_be_bytes(port_bytes);
        if port == 0 {
            continue;
        }
        let ip6 = Ipv6Addr::from(ip_bytes);
        let ip = if let Some(ip4) = ip6.to_ipv4_mapped() {
            IpAddr::V4(ip4)
        } else {
            IpAddr::V6(ip6)
        };
        if ip.is_unspecified() || ip.is_loopback() {
            continue;
        }
        addrs.push(SocketAddr::new(ip, port));
    }
    Ok(addrs)
}

fn protocol(message: &str) -> PeerError {
    PeerError::Protocol(message.to_string())
}

fn build_version_payload(start_height: i32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(NODE_NETWORK);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    encoder.write_i64_le(timestamp);
    write_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    write_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    encoder.write_u64_le(rand::random());
    encoder.write_var_str(USER_AGENT);
    encoder.write_i32_le(start_height);
    encoder.write_u8(0);
    encoder.into_inner()
}

fn build_locator_payload(locator: &[BlockHash]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash(hash);
    }
    encoder.write_hash(&BlockHash::ZERO);
    encoder.into_inner()
}

fn build_getdata_payload(items: &[InventoryVector]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(items.len() as u64);
    for item in items {
        encoder.write_u32_le(item.kind);
        encoder.write_hash(&item.hash);
    }
    encoder.into_inner()
}

fn write_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_bytes(&port.to_be_bytes());
}

fn parse_version(payload: &[u8]) -> Result<VersionInfo, PeerError> {
    let mut decoder = Decoder::new(payload);
    let version = decoder
        .read_i32_le()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    let services = decoder
        .read_u64_le()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    let _timestamp = decoder
        .read_i64_le()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let _nonce = decoder
        .read_u64_le()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    let user_agent = decoder
        .read_var_str()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    let start_height = decoder
        .read_i32_le()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    Ok(VersionInfo {
        version,
        services,
        user_agent,
        start_height,
    })
}

fn read_net_addr(decoder: &mut Decoder<'_>) -> Result<(), PeerError> {
    let _services = decoder
        .read_u64_le()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    let _ip = decoder
        .read_fixed::<16>()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    let _port = decoder
        .read_fixed::<2>()
        .map_err(|err| PeerError::Protocol(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn disconnect_classes_follow_policy() {
        let silent = PeerError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(silent.disconnect_class(), DisconnectClass::Silent);

        for kind in [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::HostUnreachable,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err = PeerError::Io(io::Error::from(kind));
            assert_eq!(err.disconnect_class(), DisconnectClass::Quiet, "{kind:?}");
        }
        assert_eq!(
            PeerError::Stalling("handshake timed out").disconnect_class(),
            DisconnectClass::Quiet
        );

        let loud = PeerError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(loud.disconnect_class(), DisconnectClass::Loud);
        assert_eq!(
            protocol("checksum mismatch").disconnect_class(),
            DisconnectClass::Loud
        );
    }

    #[test]
    fn inv_payload_round_trip() {
        let items = vec![
            InventoryVector::block(BlockHash::from_bytes(sha256d(b"a"))),
            InventoryVector::tx(BlockHash::from_bytes(sha256d(b"b"))),
        ];
        let payload = build_getdata_payload(&items);
        let parsed = parse_inv(&payload).expect("parses");
        assert_eq!(parsed, items);
        assert!(parsed[0].is_block());
        assert!(parsed[1].is_tx());
    }

    #[test]
    fn addr_parser_skips_unroutable_entries() {
        let mut encoder = Encoder::new();
        encoder.write_varint(3);
        // Routable v4-mapped address.
        let mut mapped = [0u8; 16];
        mapped[10] = 0xff;
        mapped[11] = 0xff;
        mapped[12..].copy_from_slice(&[93, 184, 216, 34]);
        for (ip, port) in [(mapped, 7312u16), ([0u8; 16], 7312), (mapped, 0)] {
            encoder.write_u32_le(1_700_000_000);
            encoder.write_u64_le(NODE_NETWORK);
            encoder.write_bytes(&ip);
            encoder.write_bytes(&port.to_be_bytes());
        }
        let addrs = parse_addr(&encoder.into_inner()).expect("parses");
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].to_string(), "93.184.216.34:7312");
    }

    #[test]
    fn version_payload_round_trip() {
        let payload = build_version_payload(1_234_567);
        let info = parse_version(&payload).expect("parses");
        assert_eq!(info.version, PROTOCOL_VERSION);
        assert_eq!(info.user_agent, USER_AGENT);
        assert_eq!(info.start_height, 1_234_567);
        assert_eq!(info.services, NODE_NETWORK);
    }

    #[test]
    fn headers_payload_round_trip() {
        let mut encoder = Encoder::new();
        encoder.write_varint(2);
        let mut prev = BlockHash::ZERO;
        for index in 0..2u32 {
            let header = BlockHeader {
                version: 4,
                prev_hash: prev,
                merkle_root: BlockHash::from_bytes(sha256d(&index.to_le_bytes())),
                time: 1_700_000_000,
                bits: 0x1e0f_ffff,
                nonce: index,
            };
            header.consensus_encode_to(&mut encoder);
            encoder.write_varint(0);
            prev = header.hash();
        }
        let headers = parse_headers(&encoder.into_inner()).expect("parses");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].prev_hash, headers[0].hash());
    }

    #[tokio::test]
    async fn framing_round_trips_over_a_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let magic = [0xfd, 0xc0, 0x5a, 0xf2];
        let totals = Arc::new(NetTotals::default());

        let server = tokio::spawn(async move {
            let totals = Arc::new(NetTotals::default());
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = stream;
            let (command, payload) = read_frame(&mut stream, magic, &totals).await.unwrap();
            write_frame(&mut stream, magic, &command, &payload, &totals)
                .await
                .unwrap();
        });

        let mut peer = Peer::connect(addr, magic, Arc::clone(&totals)).await.unwrap();
        peer.send_message("inv", b"payload").await.unwrap();
        let (command, payload) = peer.read_message().await.unwrap();
        assert_eq!(command, "inv");
        assert_eq!(payload, b"payload");
        assert_eq!(totals.snapshot().connections, 1);
        drop(peer);
        assert_eq!(totals.snapshot().connections, 0);
        server.await.unwrap();
    }
}
