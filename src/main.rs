use anyhow::{bail, Context};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use piece_exchange::config::Config;
use piece_exchange::metadata::{self, TorrentInfo};
use piece_exchange::peer::session::PeerSession;
use piece_exchange::scheduler::{PeerCandidate, Scheduler};
use piece_exchange::store::{MemoryStore, Store};
use piece_exchange::tracker::TrackerServer;
use piece_exchange::wire;
use std::collections::HashSet;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[clap(version, about = "a small piece-exchange engine and tracker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[clap(long, global = true)]
    config: Option<PathBuf>,
    /// This process's own bind host (tracker accept address for `tracker`,
    /// listen address for `start-peer`).
    #[clap(long, global = true)]
    host: Option<String>,
    /// This process's own bind port.
    #[clap(long, global = true)]
    port: Option<u16>,
    /// Host of the tracker this peer dials for handshake/get_peers/upload/update_pieces.
    #[clap(long = "peer-host", global = true)]
    peer_host: Option<String>,
    /// Port of the tracker this peer dials.
    #[clap(long = "peer-port", global = true)]
    peer_port: Option<u16>,
    #[clap(long = "peer-id", global = true)]
    peer_id: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tracker's directory service.
    Tracker,
    /// Publish a file to a running tracker and write its torrent metadata to disk.
    Upload {
        #[clap(long = "input")]
        input: PathBuf,
        /// Where to write the bencoded torrent metadata. Defaults to the
        /// input path with its extension replaced by `.torrent`.
        #[clap(long = "torrent")]
        torrent: Option<PathBuf>,
        peer_id: Option<String>,
    },
    /// Download a file described by a torrent metadata file.
    Download {
        #[clap(long = "torrent")]
        torrent: PathBuf,
        #[clap(long = "output")]
        output: PathBuf,
        peer_id: Option<String>,
    },
    /// List the peers a tracker knows about for a torrent file.
    Get {
        #[clap(long = "torrent")]
        torrent: PathBuf,
    },
    /// Run an inbound peer listener serving pieces out of a local store.
    StartPeer,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let base = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("reading config {}", path.display()))?,
        None => Config::default(),
    };
    Ok(base.apply_overrides(
        cli.host.clone(),
        cli.port,
        cli.peer_id.clone(),
        cli.peer_host.clone(),
        cli.peer_port,
    ))
}

fn tracker_addr(config: &Config) -> String {
    format!("{}:{}", config.tracker_host(), config.tracker_port())
}

fn run_tracker(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let server = TrackerServer::bind(&format!("{}:{}", config.host(), config.tracker_port()), store)?;
    server.run();
    Ok(())
}

fn run_start_peer(config: Config) -> anyhow::Result<()> {
    let peer_id = config.peer_id();
    let store = Arc::new(MemoryStore::new());
    let session = PeerSession::bind(&format!("{}:{}", config.host(), config.peer_port()), peer_id.clone(), store)?;
    log::info!("peer {peer_id} listening on {}", session.local_addr());
    session.run();
    Ok(())
}

fn run_upload(config: Config, input: PathBuf, peer_id: Option<String>, torrent: Option<PathBuf>) -> anyhow::Result<()> {
    let peer_id = peer_id.unwrap_or_else(|| config.peer_id());
    let piece_length = metadata::MIN_PIECE_LENGTH;
    let pieces = metadata::split_file(&input, piece_length).context("splitting file into pieces")?;
    let length = std::fs::metadata(&input)?.len();
    let piece_hashes = metadata::hash_pieces(&pieces);
    let pieces_b64: Vec<String> = pieces
        .iter()
        .map(|p| base64::engine::general_purpose::STANDARD.encode(p))
        .collect();
    let name = input
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();

    let info = TorrentInfo::new(name.clone(), piece_length, length, &piece_hashes);
    let torrent_path = torrent.unwrap_or_else(|| input.with_extension("torrent"));
    let encoded = metadata::encode(&info).context("encoding torrent metadata")?;
    std::fs::write(&torrent_path, &encoded).with_context(|| format!("writing torrent metadata to {}", torrent_path.display()))?;

    let mut stream = TcpStream::connect(tracker_addr(&config)).context("connecting to tracker")?;
    wire::set_default_timeouts(&stream)?;
    wire::send_message(
        &mut stream,
        &wire::handshake_request_with_addr(&peer_id, config.host(), config.peer_port()),
    )?;
    let resp = wire::recv_message(&mut stream)?;
    if !wire::is_success(&resp) {
        bail!("tracker rejected handshake: {resp}");
    }
    wire::send_message(
        &mut stream,
        &serde_json::json!({
            "type": "upload",
            "peer_id": peer_id,
            "name": name,
            "piece_length": piece_length,
            "length": length,
            "pieces_b64": pieces_b64,
        }),
    )?;
    let resp = wire::recv_message(&mut stream)?;
    if !wire::is_success(&resp) {
        bail!("upload rejected: {resp}");
    }
    println!(
        "published {name} as info_hash {}, wrote metadata to {}",
        resp["info_hash"],
        torrent_path.display()
    );
    Ok(())
}

fn fetch_peers(config: &Config, peer_id: &str, info_hash: &str) -> anyhow::Result<Vec<PeerCandidate>> {
    let mut stream = TcpStream::connect(tracker_addr(config)).context("connecting to tracker")?;
    wire::set_default_timeouts(&stream)?;
    wire::send_message(
        &mut stream,
        &wire::handshake_request_with_addr(peer_id, config.host(), config.peer_port()),
    )?;
    let resp = wire::recv_message(&mut stream)?;
    if !wire::is_success(&resp) {
        bail!("tracker rejected handshake: {resp}");
    }
    wire::send_message(&mut stream, &serde_json::json!({ "type": "get_peers", "info_hash": info_hash }))?;
    let resp = wire::recv_message(&mut stream)?;
    if !wire::is_success(&resp) {
        bail!("get_peers failed: {resp}");
    }
    let peers = resp["peers"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| {
            Some(PeerCandidate {
                peer_id: p.get("peer_id")?.as_str()?.to_string(),
                ip: p.get("ip_address")?.as_str()?.to_string(),
                port: p.get("port")?.as_u64()? as u16,
                pieces: p
                    .get("pieces")?
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.as_u64())
                    .map(|v| v as u32)
                    .collect::<HashSet<u32>>(),
            })
        })
        .collect();
    Ok(peers)
}

fn run_get(config: Config, torrent_path: PathBuf) -> anyhow::Result<()> {
    let bytes = std::fs::read(&torrent_path).context("reading torrent file")?;
    let info = metadata::decode(&bytes).context("decoding torrent metadata")?;
    let info_hash = info.info_hash()?;
    let peer_id = config.peer_id();
    let peers = fetch_peers(&config, &peer_id, &info_hash)?;
    if peers.is_empty() {
        println!("no peers known for {info_hash}");
    }
    for peer in peers {
        println!("{} at {} (pieces: {})", peer.peer_id, peer.addr(), peer.pieces.len());
    }
    Ok(())
}

fn run_download(config: Config, torrent_path: PathBuf, output: PathBuf, peer_id: Option<String>) -> anyhow::Result<()> {
    let bytes = std::fs::read(&torrent_path).context("reading torrent file")?;
    let info: TorrentInfo = metadata::decode(&bytes).context("decoding torrent metadata")?;
    let info_hash = info.info_hash()?;
    let my_peer_id = peer_id.unwrap_or_else(|| config.peer_id());

    let peers = fetch_peers(&config, &my_peer_id, &info_hash)?;
    if peers.is_empty() {
        bail!("no peers known for {info_hash}");
    }

    let scheduler = Scheduler::new(info, info_hash.clone(), my_peer_id.clone(), peers);
    let result = scheduler.run().context("downloading pieces")?;
    metadata::combine_pieces(&result.pieces, &output).context("assembling output file")?;

    let store = MemoryStore::new();
    store.upsert_peer(&my_peer_id, config.host(), config.peer_port())?;
    let mut held = HashSet::with_capacity(result.pieces.len());
    for (index, bytes) in result.pieces.iter().enumerate() {
        store.put_piece(&my_peer_id, &info_hash, index as u32, bytes.clone())?;
        held.insert(index as u32);
    }
    store.set_file_peers(&info_hash, &my_peer_id, held.clone())?;

    let mut stream = TcpStream::connect(tracker_addr(&config)).context("connecting to tracker")?;
    wire::set_default_timeouts(&stream)?;
    wire::send_message(
        &mut stream,
        &wire::handshake_request_with_addr(&my_peer_id, config.host(), config.peer_port()),
    )?;
    let resp = wire::recv_message(&mut stream)?;
    if !wire::is_success(&resp) {
        bail!("tracker rejected handshake: {resp}");
    }
    let mut pieces: Vec<u32> = held.into_iter().collect();
    pieces.sort_unstable();
    wire::send_message(
        &mut stream,
        &serde_json::json!({ "type": "update_pieces", "info_hash": info_hash, "pieces": pieces }),
    )?;
    let resp = wire::recv_message(&mut stream)?;
    if !wire::is_success(&resp) {
        bail!("update_pieces rejected: {resp}");
    }

    println!("wrote {} pieces to {}", result.pieces.len(), output.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let result = match cli.command {
        Command::Tracker => run_tracker(config),
        Command::Upload { input, peer_id, torrent } => run_upload(config, input, peer_id, torrent),
        Command::Download { torrent, output, peer_id } => run_download(config, torrent, output, peer_id),
        Command::Get { torrent } => run_get(config, torrent),
        Command::StartPeer => run_start_peer(config),
    };

    if let Err(e) = &result {
        log::error!("{e:?}");
    }
    result
}
