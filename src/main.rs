//! Wallet Bridge CLI.
//!
//! This is the main binary entry point. See the `wallet_bridge` library for
//! the core functionality.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use wallet_bridge::commands::{self, Browser, CallOptions};
use wallet_bridge::rpc::ChainContext;
use wallet_bridge::{host, BridgeConfig};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How long to wait for stray blocking tasks (stdin reads) on exit.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

// CLI
#[derive(Parser)]
#[command(name = "wallet-bridge")]
#[command(version)]
#[command(about = "Native messaging bridge between a wallet extension and the desktop wallet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the browser's native messaging host (stdio <-> worker socket)
    Host {
        /// Extension origin passed by Chromium browsers
        #[arg(hide = true)]
        origin: Option<String>,
    },
    /// Call a wallet method on the running worker and print the result
    Call {
        /// Wallet method name, e.g. getAccounts
        method: String,
        /// Arguments as a JSON array (or a single JSON value)
        #[arg(long)]
        args: Option<String>,
        /// Application id to call as
        #[arg(long, default_value = "wallet-bridge-cli")]
        app_id: String,
        /// L1 chain id
        #[arg(long, default_value_t = 31337)]
        chain_id: u64,
        /// Rollup protocol version
        #[arg(long, default_value_t = 1)]
        chain_version: u64,
    },
    /// Print (or install) the native messaging host manifest
    Manifest {
        /// Extension id allowed to launch the host
        #[arg(long)]
        extension_id: String,
        /// Browser family
        #[arg(long, value_enum, default_value = "chrome")]
        browser: Browser,
        /// Host binary path (defaults to this executable)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Write the manifest into the browser's host directory
        #[arg(long)]
        install: bool,
    },
    /// Show the effective configuration
    Config {
        /// Persist it to config.json
        #[arg(long)]
        save: bool,
    },
}

/// Log to `WALLET_BRIDGE_LOG_FILE` or `<config_dir>/wallet-bridge.log`.
///
/// stdout carries the native messaging protocol, so logs never go there;
/// if no file can be opened they fall back to stderr.
fn init_logging() {
    let log_path = std::env::var("WALLET_BRIDGE_LOG_FILE")
        .map(PathBuf::from)
        .or_else(|_| BridgeConfig::config_dir().map(|dir| dir.join("wallet-bridge.log")));

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    let log_file = log_path
        .ok()
        .and_then(|path| OpenOptions::new().create(true).append(true).open(path).ok());
    match log_file {
        Some(file) => builder.target(env_logger::Target::Pipe(Box::new(file))),
        None => builder.target(env_logger::Target::Stderr),
    };
    builder.init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to start tokio runtime")
}

fn main() -> Result<()> {
    init_logging();

    // Set up panic hook to log panics before the default handler runs
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));

    let cli = Cli::parse();

    match cli.command {
        Commands::Host { origin } => {
            if let Some(origin) = origin {
                log::info!("[Host] Launched for {origin}");
            }
            let config = BridgeConfig::load()?;
            let rt = runtime()?;
            let result = rt.block_on(host::run_host(&config));
            // stdin is read on a blocking thread that cannot be cancelled
            rt.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
            if let Err(e) = &result {
                log::error!("[Host] Exiting with error: {e:#}");
            }
            result?;
        }
        Commands::Call {
            method,
            args,
            app_id,
            chain_id,
            chain_version,
        } => {
            let config = BridgeConfig::load()?;
            let options = CallOptions {
                method,
                args: commands::call::parse_args(args.as_deref())?,
                app_id,
                context: ChainContext {
                    chain_id,
                    version: chain_version,
                },
            };
            let rt = runtime()?;
            let result = rt.block_on(commands::run_call(&config, options));
            rt.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
        Commands::Manifest {
            extension_id,
            browser,
            path,
            install,
        } => {
            let host_path = match path {
                Some(path) => path,
                None => std::env::current_exe().context("Could not determine executable path")?,
            };
            let manifest = commands::build_manifest(browser, &host_path, &extension_id);
            if install {
                let written = commands::install_manifest(&manifest, &browser.manifest_dir()?)?;
                println!("{}", written.display());
            } else {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            }
        }
        Commands::Config { save } => {
            let config = BridgeConfig::load()?;
            if save {
                config.save()?;
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
