use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use floscan_consensus::params::Network;
use floscan_node::fullnode::FullNodeAdapter;
use floscan_node::scanner::{
    Scanner, ScannerConfig, DEFAULT_MAX_PEERS, DEFAULT_REORG_TIP_MAXAGE,
    DEFAULT_REORG_TRIGGER_LENGTH,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_STATUS_INTERVAL_SECS: u64 = 15;

struct Config {
    network: Network,
    max_peers: usize,
    log_level: String,
    peer_log_level: Option<String>,
    reorg_trigger_length: u64,
    reorg_tip_maxage: i64,
    status_updates: bool,
    discover: bool,
    status_interval_secs: u64,
    status_json: bool,
    data_dir: Option<PathBuf>,
    fullnode_rpc: Option<SocketAddr>,
    rpc_user: Option<String>,
    rpc_pass: Option<String>,
    seed_peers: Vec<String>,
}

fn usage() -> String {
    [
        "usage: floscan [options]",
        "  --network <livenet|testnet>      network to crawl (default livenet)",
        "  --max-peers <n>                  cap on concurrent sessions (default 1000)",
        "  --log-level <level>              error|warn|info|debug|trace (default info)",
        "  --peer-log-level <level>         separate level for per-peer modules",
        "  --reorg-trigger-length <n>       minimum fork branch length (default 10)",
        "  --reorg-tip-maxage <n>           max fork distance below the tip (default 25)",
        "  --no-status-updates              disable the periodic status refresh",
        "  --no-discover                    skip DNS seed discovery at startup",
        "  --status-interval <secs>         seconds between status prints (default 15)",
        "  --status-json                    print status as JSON instead of text",
        "  --data-dir <path>                data directory of the backing full node",
        "  --fullnode-rpc <addr:port>       JSON-RPC endpoint of the full node",
        "  --rpc-user <user>                full node RPC username",
        "  --rpc-pass <pass>                full node RPC password",
        "  --add-peer <addr:port>           extra seed peer (repeatable)",
    ]
    .join("\n")
}

fn parse_args() -> Result<Config, String> {
    let mut network = Network::Livenet;
    let mut max_peers = DEFAULT_MAX_PEERS;
    let mut log_level = "info".to_string();
    let mut peer_log_level: Option<String> = None;
    let mut reorg_trigger_length = DEFAULT_REORG_TRIGGER_LENGTH;
    let mut reorg_tip_maxage = DEFAULT_REORG_TIP_MAXAGE;
    let mut status_updates = true;
    let mut discover = true;
    let mut status_interval_secs = DEFAULT_STATUS_INTERVAL_SECS;
    let mut status_json = false;
    let mut data_dir: Option<PathBuf> = None;
    let mut fullnode_rpc: Option<SocketAddr> = None;
    let mut rpc_user: Option<String> = None;
    let mut rpc_pass: Option<String> = None;
    let mut seed_peers: Vec<String> = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--network" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --network\n{}", usage()))?;
                network = match value.as_str() {
                    "livenet" | "mainnet" => Network::Livenet,
                    "testnet" => Network::Testnet,
                    _ => return Err(format!("invalid network '{value}'\n{}", usage())),
                };
            }
            "--max-peers" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --max-peers\n{}", usage()))?;
                max_peers = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid max peers '{value}'\n{}", usage()))?;
            }
            "--log-level" => {
                log_level = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-level\n{}", usage()))?;
            }
            "--peer-log-level" => {
                peer_log_level = Some(
                    args.next()
                        .ok_or_else(|| format!("missing value for --peer-log-level\n{}", usage()))?,
                );
            }
            "--reorg-trigger-length" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --reorg-trigger-length\n{}", usage())
                })?;
                reorg_trigger_length = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid trigger length '{value}'\n{}", usage()))?;
            }
            "--reorg-tip-maxage" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --reorg-tip-maxage\n{}", usage()))?;
                reorg_tip_maxage = value
                    .parse::<i64>()
                    .map_err(|_| format!("invalid tip maxage '{value}'\n{}", usage()))?;
            }
            "--no-status-updates" => {
                status_updates = false;
            }
            "--no-discover" => {
                discover = false;
            }
            "--status-interval" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --status-interval\n{}", usage()))?;
                status_interval_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid status interval '{value}'\n{}", usage()))?;
            }
            "--status-json" => {
                status_json = true;
            }
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                data_dir = Some(PathBuf::from(value));
            }
            "--fullnode-rpc" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --fullnode-rpc\n{}", usage()))?;
                fullnode_rpc = Some(
                    value
                        .parse::<SocketAddr>()
                        .map_err(|_| format!("invalid rpc addr '{value}'\n{}", usage()))?,
                );
            }
            "--rpc-user" => {
                rpc_user = Some(
                    args.next()
                        .ok_or_else(|| format!("missing value for --rpc-user\n{}", usage()))?,
                );
            }
            "--rpc-pass" => {
                rpc_pass = Some(
                    args.next()
                        .ok_or_else(|| format!("missing value for --rpc-pass\n{}", usage()))?,
                );
            }
            "--add-peer" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --add-peer\n{}", usage()))?;
                seed_peers.push(value);
            }
            "--help" | "-h" => {
                return Err(usage());
            }
            other => {
                return Err(format!("unknown option '{other}'\n{}", usage()));
            }
        }
    }

    Ok(Config {
        network,
        max_peers,
        log_level,
        peer_log_level,
        reorg_trigger_length,
        reorg_tip_maxage,
        status_updates,
        discover,
        status_interval_secs,
        status_json,
        data_dir,
        fullnode_rpc,
        rpc_user,
        rpc_pass,
        seed_peers,
    })
}

fn init_logging(config: &Config) -> Result<(), String> {
    let mut directives = config.log_level.clone();
    if let Some(peer_level) = &config.peer_log_level {
        directives.push_str(&format!(
            ",floscan_node::session={peer_level},floscan_node::p2p={peer_level}"
        ));
    }
    let filter = EnvFilter::try_new(&directives)
        .map_err(|err| format!("invalid log level '{directives}': {err}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = parse_args()?;
    init_logging(&config)?;

    let fullnode = match config.fullnode_rpc {
        Some(addr) => {
            let auth = match (&config.rpc_user, &config.rpc_pass) {
                (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
                (None, None) => None,
                _ => return Err("--rpc-user and --rpc-pass must be set together".to_string()),
            };
            FullNodeAdapter::rpc(addr, auth)
        }
        None => {
            warn!("no --fullnode-rpc configured; reorg monitoring disabled");
            FullNodeAdapter::disabled()
        }
    };
    if let Some(data_dir) = &config.data_dir {
        info!(path = %data_dir.display(), "full node data directory");
    }

    let scanner_config = ScannerConfig {
        network: config.network,
        max_peers: config.max_peers,
        reorg_trigger_length: config.reorg_trigger_length,
        reorg_tip_maxage: config.reorg_tip_maxage,
        status_updates: config.status_updates,
        discover: config.discover,
        seed_peers: config.seed_peers.clone(),
    };
    let (scanner, handle) = Scanner::new(scanner_config, fullnode)?;
    info!(network = config.network.name(), "starting scanner");
    let scanner_task = tokio::spawn(scanner.run());

    let mut reorg_rx = handle.watch_reorgs();
    let status = handle.status();
    let mut status_timer =
        tokio::time::interval(Duration::from_secs(config.status_interval_secs.max(1)));
    status_timer.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handle.shutdown();
                break;
            }
            event = &mut reorg_rx => {
                match event {
                    Ok(event) => {
                        warn!(
                            active_height = event.best_height_tip.height,
                            fork_height = event.reorg_tip.height,
                            branchlen = event.reorg_tip.branchlen,
                            fork_hash = %event.reorg_tip.hash,
                            "chain reorganization likely"
                        );
                        reorg_rx = handle.watch_reorgs();
                    }
                    Err(_) => break,
                }
            }
            _ = status_timer.tick() => {
                if config.status_updates {
                    let snapshot = status.borrow().clone();
                    if config.status_json {
                        println!("{}", snapshot.to_json());
                    } else {
                        print!("{}", snapshot.render());
                    }
                }
            }
        }
    }

    let _ = scanner_task.await;
    Ok(())
}
