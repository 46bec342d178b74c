use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kiln::builtin::register_builtin;
use kiln::config::PlatformConfig;
use kiln::plugins::PluginRegistry;
use kiln::Platform;

/// Kiln - in-process event dispatch and plugin runtime
#[derive(Parser, Debug)]
#[command(author, about, long_about = None, disable_version_flag = true)]
struct Args {
    /// Print version and exit
    #[arg(short = 'v', long)]
    version: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(debug: bool) -> Result<()> {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };

    // Logs go to stderr; RUST_LOG overrides the level when set
    let installed = if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };
    installed.context("Failed to set global default subscriber")
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("kiln {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_logging(args.debug)?;

    let config = if let Some(config_path) = args.config {
        PlatformConfig::load_from_file(&config_path)?
    } else {
        PlatformConfig::load_default()?
    };

    let registry = PluginRegistry::global();
    register_builtin(&registry);

    let platform = Platform::new(config, registry).context("Failed to create platform")?;
    let loaded = platform.start();
    info!(loaded, plugins = ?platform.plugin_names(), "kiln running, press Ctrl-C to stop");

    // Work loops are plain threads; the runtime only waits for the signal
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("Failed to wait for Ctrl-C")?;

    info!("shutting down");
    platform.shutdown();
    Ok(())
}
