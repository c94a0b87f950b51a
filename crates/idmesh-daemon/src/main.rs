//! idmesh daemon CLI
//!
//! Thin wrapper around idmesh-core: runs the identity service against a
//! local peer-routing daemon, plus maintenance commands that edit the
//! stored profile directly.
//!
//! ## Usage
//!
//! ```bash
//! # Run the identity service
//! idmesh run --socket tcp:127.0.0.1:8585
//!
//! # Edit the local profile (picked up at the next service start)
//! idmesh profile set --name "Alice" --lat 45.52 --long -122.68 --country us
//!
//! # Show the stored profile
//! idmesh profile show
//!
//! # Inspect a cached identity by signer pubkey
//! idmesh identity show <64-hex-chars>
//! ```
//!
//! The signing key comes from the `IDMESH_KEY` environment variable
//! (64 hex chars of Ed25519 seed). Without it an ephemeral key is generated
//! and its public half logged - useful for trying things out, useless for a
//! stable identity.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use idmesh_core::{
    profile, AnnounceConfig, AnnounceManager, HandlerConfig, IdentityHandler, MeshError, Profile,
    Store,
};
use idmesh_wire::{Endpoint, IdentityPayload, KeyPair};

const KEY_ENV: &str = "IDMESH_KEY";
const TRIM_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// idmesh - signed identity gossip for the mesh
#[derive(Parser)]
#[command(name = "idmesh")]
#[command(version)]
#[command(about = "Signs and gossips the local identity via a peer-routing daemon")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.idmesh)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the identity service
    Run {
        /// Daemon socket: tcp:<host>:<port> or unix:<path>
        #[arg(long, default_value = "tcp:127.0.0.1:8585")]
        socket: String,
    },

    /// Local profile management
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Cached identity lookups
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Store a new profile (takes effect at the next service start)
    Set {
        /// Display name (up to 30 bytes)
        #[arg(long)]
        name: String,
        /// Short biography (up to 120 bytes)
        #[arg(long, default_value = "")]
        bio: String,
        /// WGS84 latitude in degrees
        #[arg(long, default_value_t = 0.0)]
        lat: f64,
        /// WGS84 longitude in degrees
        #[arg(long, default_value_t = 0.0)]
        long: f64,
        /// ISO 3166-1 alpha-2 country code
        #[arg(long, default_value = "")]
        country: String,
        /// City name (up to 30 bytes)
        #[arg(long, default_value = "")]
        city: String,
        /// Path to a raw icon file (exactly 1585 bytes)
        #[arg(long)]
        icon_file: Option<PathBuf>,
    },
    /// Print the stored profile
    Show,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Print a cached identity by signer public key
    Show {
        /// Signer public key, 64 hex characters
        pubkey: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let cancel = CancellationToken::new();
    let store = Store::open(data_dir.join("identity.db"), cancel.clone())
        .context("cannot open identity store")?;

    match cli.command {
        Commands::Run { socket } => run_service(store, &socket, cancel).await,
        Commands::Profile { action } => match action {
            ProfileAction::Set {
                name,
                bio,
                lat,
                long,
                country,
                city,
                icon_file,
            } => profile_set(&store, name, bio, lat, long, country, city, icon_file).await,
            ProfileAction::Show => profile_show(&store).await,
        },
        Commands::Identity { action } => match action {
            IdentityAction::Show { pubkey } => identity_show(&store, &pubkey).await,
        },
    }
}

async fn run_service(store: Store, socket: &str, cancel: CancellationToken) -> Result<()> {
    let endpoint = Endpoint::from_str(socket).context("invalid daemon socket address")?;
    let key = load_keypair()?;
    info!(pubkey = %hex::encode(key.public_bytes()), "identity key loaded");

    // shut everything down on ctrl-c
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_cancel.cancel();
        }
    });

    let (change_tx, change_rx) = mpsc::channel(16);
    let (announce_tx, announce_rx) = mpsc::channel(2);

    let manager = AnnounceManager::new(
        key.clone(),
        store.clone(),
        AnnounceConfig::default(),
        change_rx,
        announce_tx,
    );
    let announce_task = tokio::spawn(manager.run(cancel.clone()));

    let trim_store = store.clone();
    let trim_cancel = cancel.clone();
    let trim_task = tokio::spawn(async move {
        trim_loop(trim_store, trim_cancel).await;
    });

    let handler = IdentityHandler::new(
        store,
        key,
        HandlerConfig::default(),
        endpoint,
        announce_rx,
        change_tx,
    );
    // a failed session is fatal: the supervisor restarts the whole process
    let result = handler.run(cancel.clone()).await;
    cancel.cancel();
    let _ = announce_task.await;
    let _ = trim_task.await;
    result.context("daemon session ended")
}

/// Periodic expiry sweep; the day counter does the actual bookkeeping.
async fn trim_loop(store: Store, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(TRIM_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                match store.trim().await {
                    Ok(true) => info!("day counter advanced, expired identities trimmed"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "trim sweep failed"),
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn profile_set(
    store: &Store,
    name: String,
    bio: String,
    lat: f64,
    long: f64,
    country: String,
    city: String,
    icon_file: Option<PathBuf>,
) -> Result<()> {
    if !(-90.0..=90.0).contains(&lat) {
        bail!("latitude out of range [-90, 90] (got {})", lat);
    }
    if !(-180.0..=180.0).contains(&long) {
        bail!("longitude out of range [-180, 180] (got {})", long);
    }
    let icon = match icon_file {
        Some(path) => std::fs::read(&path)
            .with_context(|| format!("cannot read icon file {}", path.display()))?,
        None => Vec::new(),
    };

    let profile = Profile {
        name,
        bio,
        lat: profile::quantize(lat),
        long: profile::quantize(long),
        country: country.to_uppercase(),
        city,
        icon,
    };
    profile.validate().map_err(|e| anyhow::anyhow!("{}", e))?;

    store
        .set_profile(&profile)
        .await
        .context("cannot store profile")?;
    print_json(&ProfileJson::from(&profile))?;
    Ok(())
}

async fn profile_show(store: &Store) -> Result<()> {
    match store.get_profile().await {
        Ok(profile) => print_json(&ProfileJson::from(&profile)),
        Err(e) if e.is_not_found() => {
            println!("no profile stored");
            Ok(())
        }
        Err(e) => Err(e).context("cannot load profile"),
    }
}

async fn identity_show(store: &Store, pubkey_hex: &str) -> Result<()> {
    let bytes = hex::decode(pubkey_hex).context("pubkey must be hex")?;
    let pubkey: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("pubkey must be 32 bytes (64 hex characters)"))?;

    let record = match store.get_identity(&pubkey).await {
        Ok(record) => record,
        Err(MeshError::NotFound) => {
            println!("identity not known");
            return Ok(());
        }
        Err(e) => return Err(e).context("cannot load identity"),
    };
    let payload = IdentityPayload::decode(&record.payload).context("stored payload is corrupt")?;

    print_json(&IdentityJson {
        signer: hex::encode(record.pubkey),
        signed_at: record.time,
        name: payload.name,
        bio: payload.bio,
        lat: profile::dequantize(payload.lat),
        long: profile::dequantize(payload.long),
        country: payload.country,
        city: payload.city,
        nodes: payload.nodes.iter().map(hex::encode).collect(),
        icon_bytes: payload.icon.len(),
    })
}

/// JSON shape for profile output; coordinates go back to degrees.
#[derive(Serialize)]
struct ProfileJson {
    name: String,
    bio: String,
    lat: f64,
    long: f64,
    country: String,
    city: String,
    icon_bytes: usize,
}

impl From<&Profile> for ProfileJson {
    fn from(p: &Profile) -> Self {
        Self {
            name: p.name.clone(),
            bio: p.bio.clone(),
            lat: profile::dequantize(p.lat),
            long: profile::dequantize(p.long),
            country: p.country.clone(),
            city: p.city.clone(),
            icon_bytes: p.icon.len(),
        }
    }
}

#[derive(Serialize)]
struct IdentityJson {
    signer: String,
    signed_at: i64,
    name: String,
    bio: String,
    lat: f64,
    long: f64,
    country: String,
    city: String,
    nodes: Vec<String>,
    icon_bytes: usize,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Load the signing key from the environment, or generate an ephemeral one.
///
/// Only the public half is ever logged.
fn load_keypair() -> Result<KeyPair> {
    match std::env::var(KEY_ENV) {
        Ok(hex_seed) => {
            let bytes = hex::decode(hex_seed.trim())
                .with_context(|| format!("{} must be hex", KEY_ENV))?;
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("{} must be 32 bytes (64 hex characters)", KEY_ENV))?;
            Ok(KeyPair::from_seed(&seed))
        }
        Err(std::env::VarError::NotPresent) => {
            let key = KeyPair::generate();
            warn!(
                pubkey = %hex::encode(key.public_bytes()),
                "{} not set, using an ephemeral identity key", KEY_ENV
            );
            Ok(key)
        }
        Err(e) => Err(e).with_context(|| format!("cannot read {}", KEY_ENV)),
    }
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Default data directory (~/.idmesh)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".idmesh")
}
