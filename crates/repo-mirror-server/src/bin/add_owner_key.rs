//! One-shot tool: inserts a new owner public key into `index.json`, resigning index,
//! snapshot, and timestamp in turn, exactly as the server's reconciliation driver would
//! after a merge — but run once, offline, by an operator.

use std::fs::File;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use repo_mirror_core::{Keys, Model, SessionManager};
use repo_mirror_schema::KeyInfo;
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

/// Adds a new owner public key to a signing mirror's index manifest.
#[derive(Debug, Parser)]
struct Args {
    /// Root directory of the signing mirror tree.
    root_dir: PathBuf,

    /// Owner ID the key is added under.
    #[clap(long)]
    owner: String,

    /// Path to the new owner's public `KeyInfo` file.
    #[clap(long)]
    public_key: PathBuf,

    /// Path to the private index signing key.
    #[clap(long)]
    index: PathBuf,

    /// Path to the private snapshot signing key.
    #[clap(long)]
    snapshot: PathBuf,

    /// Path to the private timestamp signing key.
    #[clap(long)]
    timestamp: PathBuf,

    /// Path to the private owner signing key (unused here, accepted for symmetry with the
    /// server's key set).
    #[clap(long)]
    owner_key: Option<PathBuf>,

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

    let public: KeyInfo = serde_json::from_reader(
        File::open(&args.public_key).context(OpenSnafu {
            path: args.public_key.clone(),
        })?,
    )
    .context(ParseSnafu {
        path: args.public_key.clone(),
    })?;
    let key_id = public.key_id().context(KeyIdSnafu)?;
    let key_id_for_log = key_id.clone();

    let index_key = repo_mirror_signer::load_private_key(&args.index).context(LoadKeySnafu {
        path: args.index.clone(),
    })?;
    let snapshot_key =
        repo_mirror_signer::load_private_key(&args.snapshot).context(LoadKeySnafu {
            path: args.snapshot.clone(),
        })?;
    let timestamp_key =
        repo_mirror_signer::load_private_key(&args.timestamp).context(LoadKeySnafu {
            path: args.timestamp.clone(),
        })?;
    // update_root_manifest and update_component writes are untouched by this tool; the
    // owner key is loaded only so `Keys` can be constructed uniformly.
    let owner_key = match &args.owner_key {
        Some(path) => repo_mirror_signer::load_private_key(path).context(LoadKeySnafu {
            path: path.clone(),
        })?,
        None => index_key.clone(),
    };

    let keys = Keys {
        index: &index_key,
        snapshot: &snapshot_key,
        timestamp: &timestamp_key,
        owner: &owner_key,
    };
    let model = Model::new(&keys);

    let sessions = std::sync::Arc::new(SessionManager::new());
    let id = Uuid::new_v4().to_string();
    sessions.begin(&id).context(CoreSnafu)?;
    let mut txn = sessions.load(&id, args.root_dir.clone()).context(CoreSnafu)?;

    let now = chrono::Utc::now();
    let owner = args.owner.clone();
    let index_manifest = model
        .update_index_manifest(&mut txn, now, move |mut signed| {
            signed
                .owners
                .entry(owner)
                .or_default()
                .keys
                .insert(key_id, public);
            signed
        })
        .context(CoreSnafu)?;

    let index_name = format!("{}.index.json", index_manifest.signed.version);
    let index_length = txn.stat(&index_name).context(CoreSnafu)?;
    let index_version = index_manifest.signed.version;

    model
        .update_snapshot_manifest(&mut txn, now, move |mut signed| {
            signed.meta.insert(
                "/index.json".to_string(),
                repo_mirror_schema::FileVersion {
                    version: index_version,
                    length: index_length,
                },
            );
            signed
        })
        .context(CoreSnafu)?;

    model
        .update_timestamp_manifest(&mut txn, now)
        .context(CoreSnafu)?;

    txn.commit().context(CoreSnafu)?;
    log::info!("added owner key {} for '{}'", key_id_for_log, args.owner);
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

    #[snafu(display("Failed to open '{}': {}", path.display(), source))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse '{}': {}", path.display(), source))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to compute key ID: {}", source))]
    KeyId { source: repo_mirror_schema::Error },

    #[snafu(display("Failed to load private key '{}': {}", path.display(), source))]
    LoadKey {
        path: PathBuf,
        source: repo_mirror_signer::Error,
    },

    #[snafu(display("{}", source))]
    Core { source: repo_mirror_core::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;
