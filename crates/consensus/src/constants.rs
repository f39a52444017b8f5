//! Protocol constants shared across the crawler.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_015;
/// Oldest protocol version the crawler will talk to.
pub const MIN_PEER_PROTO_VERSION: i32 = 70_002;
/// Service bit advertised in our version message.
pub const NODE_NETWORK: u64 = 1;
/// User agent sent during the version handshake.
pub const USER_AGENT: &str = "/floscan:0.1.0/";
/// Maximum number of headers a peer may send in one `headers` message.
pub const MAX_HEADERS_RESULTS: usize = 2000;
