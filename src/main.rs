use std::path::PathBuf;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use chainsyncd::config::{self, Config};
use chainsyncd::node::Node;
use chainsyncd::shutdown::ShutdownManager;
use chainsyncd::NetworkType;

#[derive(Parser, Debug)]
#[command(name = "chainsyncd")]
#[command(about = "Chain-following sync daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// mainnet, testnet or regtest (overrides the config file)
    #[arg(long)]
    network: Option<String>,

    /// Overrides [storage] data_dir
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let cli_network = match args.network.as_deref().map(str::parse::<NetworkType>) {
        Some(Ok(network)) => Some(network),
        Some(Err(e)) => {
            eprintln!("❌ {}", e);
            std::process::exit(2);
        }
        None => None,
    };

    // Network from the CLI, else the existing config file, else mainnet
    let network_type = cli_network.unwrap_or_else(|| {
        Config::load_from_file(&args.config)
            .ok()
            .and_then(|cfg| cfg.node.network_type().ok())
            .unwrap_or(NetworkType::Mainnet)
    });

    if args.generate_config {
        let config = Config::default_for(network_type);
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config, &network_type) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(network) = cli_network {
        config.node.network = network.as_str().to_string();
        if args.data_dir.is_none() {
            config.storage.data_dir = config::get_network_data_dir(&network)
                .to_string_lossy()
                .to_string();
        }
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.to_string_lossy().to_string();
    }

    let _log_guard = setup_logging(&config.logging, args.verbose);

    let mut shutdown_manager = ShutdownManager::new();
    let shutdown_token = shutdown_manager.token();

    let mut node = match Node::build(&config, shutdown_token.clone()).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("❌ Failed to initialize node: {}", e);
            std::process::exit(1);
        }
    };

    match node.start().await {
        Ok(handles) => shutdown_manager.register_all(handles),
        Err(e) => {
            tracing::error!("❌ Failed to start networking: {}", e);
            std::process::exit(1);
        }
    }

    tracing::info!(
        "🚀 chainsyncd {} ({}) running on {}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        node.network()
    );

    let sync_handle = tokio::spawn(node.run());
    shutdown_manager.wait_for_shutdown().await;

    match sync_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("❌ Node stopped: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("❌ Sync task failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// The returned guard must live until exit so file logs are flushed.
fn setup_logging(config: &config::LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    // Get hostname - shorten to first part before dot
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    if config.output == "file" {
        let path = PathBuf::from(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "chainsyncd.log".to_string());
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        if config.format == "json" {
            fmt().json().with_env_filter(filter).with_writer(writer).init();
        } else {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .with_writer(writer)
                .compact()
                .init();
        }
        return Some(guard);
    }

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd {
                // journald already adds timestamp and hostname
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }
    None
}

// Custom timer that shows UTC time and hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();

        // "YYYY-MM-DD HH:MM:SS.mmm [hostname]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
