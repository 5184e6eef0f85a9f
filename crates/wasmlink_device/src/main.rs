pub mod client;
pub mod config;
pub mod listener;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wasmlink_core::registry::RESOURCE_SIZE;
use wasmlink_core::{EngineConfig, WasmtimeRuntime};

use crate::client::LoopbackClient;
use crate::config::{Config, LoggingConfig};

#[derive(Parser)]
#[command(name = "wasmlink-device")]
#[command(about = "wasmlink device host: module upload and execution over a loopback link")]
struct Cli {
    /// MTU to negotiate, overriding the configured client MTU
    #[arg(long, global = true)]
    mtu: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a module, then call one of its exports
    Run {
        /// Path to the .wasm module
        #[arg(long)]
        module: PathBuf,
        /// Exported function to call
        #[arg(long)]
        function: String,
        /// Up to four i32 arguments
        #[arg(long, num_args = 0..=4, allow_negative_numbers = true)]
        args: Vec<i32>,
    },
    /// Store a 32-byte resource and verify it
    Sprite {
        /// Resource id (0xFFFF is reserved)
        #[arg(long)]
        id: u16,
        /// Payload as 64 hex characters
        #[arg(long)]
        hex: String,
    },
    /// Show the configuration, or persist engine settings with --write
    Config {
        #[command(flatten)]
        engine: EngineConfig,
        /// Save the engine settings above to the config file
        #[arg(long)]
        write: bool,
    },
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    if logging.json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    } else {
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    }
}

fn run_module(
    config: &Config,
    module: &Path,
    function: &str,
    args: &[i32],
) -> anyhow::Result<()> {
    let bytes = fs::read(module).with_context(|| format!("reading {}", module.display()))?;
    let mut client = LoopbackClient::connect(config, WasmtimeRuntime::new())?;

    let status = client.upload(&bytes)?;
    println!("{}", serde_json::to_string(&json!({ "status": status }))?);

    let result = client.execute(function, args)?;
    println!("{}", serde_json::to_string(&json!({ "result": result }))?);

    client.disconnect()
}

fn store_sprite(config: &Config, id: u16, hex_payload: &str) -> anyhow::Result<()> {
    let bytes = hex::decode(hex_payload.trim()).context("payload is not valid hex")?;
    let payload: [u8; RESOURCE_SIZE] = bytes.as_slice().try_into().map_err(|_| {
        anyhow!(
            "payload must be exactly {RESOURCE_SIZE} bytes, got {}",
            bytes.len()
        )
    })?;

    let mut client = LoopbackClient::connect(config, WasmtimeRuntime::new())?;
    let (registry, verification) = client.store_resource(id, payload)?;
    let report = json!({
        "registry": {
            "total": registry.total,
            "free": registry.free,
            "last_id": registry.last_id,
            "status": registry.registry_status,
            "crc_errors": registry.crc_errors,
        },
        "verify": {
            "id": verification.id,
            "stored_crc16": verification.stored_crc16,
            "calculated_crc16": verification.calculated_crc16,
            "outcome": verification.outcome,
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    client.disconnect()
}

fn show_config(mut config: Config, engine: EngineConfig, write: bool) -> anyhow::Result<()> {
    if write {
        config.engine = engine;
        config.save()?;
        info!(path = %Config::get_config_path().display(), "configuration saved");
    }
    println!("# {}", Config::get_config_path().display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // Logging is configured from the file, so a broken file is reported
    // on stderr before the subscriber exists.
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config, using defaults: {e}");
            Config::default()
        }
    };
    init_logging(&config.logging);

    if let Some(mtu) = cli.mtu {
        config.client.mtu = mtu;
    }
    info!(
        mtu = config.client.mtu,
        buffer_capacity = config.engine.buffer_capacity,
        queue_capacity = config.engine.queue_capacity,
        "starting wasmlink device"
    );

    let result = match cli.command {
        Commands::Run {
            module,
            function,
            args,
        } => run_module(&config, &module, &function, &args),
        Commands::Sprite { id, hex } => store_sprite(&config, id, &hex),
        Commands::Config { engine, write } => show_config(config, engine, write),
    };

    if let Err(e) = result {
        error!(error = %e, "Fatal Error");
        std::process::exit(1);
    }
}
