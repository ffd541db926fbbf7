/*!
`repo-mirror-server` serves a local, cryptographically signed manifest tree to clients
and, on a request for `timestamp.json`, reconciles that tree with an upstream mirror by
merging newly observed upstream manifests into locally resigned manifests.
*/

#![deny(rust_2018_idioms)]

mod handler;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use repo_mirror_core::{Reconciler, UpstreamCache};
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::{ResultExt, Snafu};
use tiny_http::Server;

/// Signing mirror server for a multi-platform component repository.
#[derive(Debug, Parser)]
struct Args {
    /// Directory serving the local mirror tree; also the root an `FsTxn` is scoped to.
    root_dir: PathBuf,

    /// `host:port` to bind.
    #[clap(long, default_value = "0.0.0.0:8989")]
    addr: String,

    /// Upstream mirror base URL, reverse-proxied to on a local 404.
    #[clap(long)]
    upstream: Option<String>,

    /// Working directory for the upstream client's downloaded manifests
    /// (`<tiuphome>/manifests`).
    #[clap(long)]
    tiuphome: PathBuf,

    /// Path to the private owner signing key.
    #[clap(long)]
    owner: PathBuf,

    /// Path to the owner's public `KeyInfo`; accepted for parity with the command's
    /// external interface. Per-owner public keys actually live inside `index.json`, so
    /// this is never read.
    #[clap(long)]
    ownerpub: Option<PathBuf>,

    /// Path to the private index signing key.
    #[clap(long)]
    index: PathBuf,

    /// Path to the private snapshot signing key.
    #[clap(long)]
    snapshot: PathBuf,

    /// Path to the private timestamp signing key.
    #[clap(long)]
    timestamp: PathBuf,

    #[clap(long, default_value = "INFO")]
    log_level: LevelFilter,
}

fn run() -> Result<()> {
    let args = Args::parse();
    TermLogger::init(
        args.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context(LoggerSnafu)?;

    let index_key = repo_mirror_signer::load_private_key(&args.index).context(KeySnafu {
        path: args.index.clone(),
    })?;
    let snapshot_key =
        repo_mirror_signer::load_private_key(&args.snapshot).context(KeySnafu {
            path: args.snapshot.clone(),
        })?;
    let timestamp_key =
        repo_mirror_signer::load_private_key(&args.timestamp).context(KeySnafu {
            path: args.timestamp.clone(),
        })?;
    let owner_key = repo_mirror_signer::load_private_key(&args.owner).context(KeySnafu {
        path: args.owner.clone(),
    })?;

    let manifests_dir = args.tiuphome.join("manifests");
    let upstream_client: Arc<dyn repo_mirror_core::UpstreamClient> = match &args.upstream {
        Some(url) => Arc::new(handler::HttpUpstreamClient::new(
            url.clone(),
            manifests_dir.clone(),
        )),
        None => Arc::new(handler::NoUpstreamClient),
    };
    let upstream = UpstreamCache::new(manifests_dir, upstream_client).context(CoreSnafu)?;

    let reconciler = Arc::new(Reconciler::new(
        args.root_dir.clone(),
        upstream,
        index_key,
        snapshot_key,
        timestamp_key,
        owner_key,
    ));

    let server = Server::http(&args.addr).map_err(|source| Error::Bind {
        addr: args.addr.clone(),
        source,
    })?;
    log::info!("listening on {}", args.addr);

    handler::serve(server, args.root_dir, args.upstream, reconciler);
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
enum Error {
    #[snafu(display("Logger setup error: {}", source))]
    Logger { source: log::SetLoggerError },

    #[snafu(display("Failed to load signing key '{}': {}", path.display(), source))]
    Key {
        path: PathBuf,
        source: repo_mirror_signer::Error,
    },

    #[snafu(display("{}", source))]
    Core { source: repo_mirror_core::Error },

    #[snafu(display("Failed to bind '{}': {}", addr, source))]
    Bind {
        addr: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;
