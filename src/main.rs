//! Home Assistant MCP Core - Entry Point
//!
//! Modes:
//! - Default: connect and keep the link alive, logging JSON to stderr
//! - --pretty / -p: human-readable logs to stdout
//! - --check / -c: connect once, print stats as JSON and exit

use hass_mcp::{Config, HassClient};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let pretty_mode = args.iter().any(|a| a == "--pretty" || a == "-p");
    let check_mode = args.iter().any(|a| a == "--check" || a == "-c");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("Home Assistant MCP Core v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: hass-mcp [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --pretty, -p   Human-readable logs on stdout");
        println!("  --check, -c    Connect, print stats as JSON and exit");
        println!("  --help, -h     Show this help");
        println!();
        println!("Environment variables:");
        println!("  HASS_URL                       Home Assistant URL (default: http://homeassistant.local:8123)");
        println!("  HASS_TOKEN                     Long-lived access token (required)");
        println!("  HASS_RECONNECT_MAX_ATTEMPTS    Reconnect attempts before giving up (default: 10)");
        println!("  HASS_HEARTBEAT_INTERVAL_SECS   Ping period, 0 disables (default: 30)");
        println!("  HASS_REQUEST_TIMEOUT_SECS      Per-request deadline (default: 60)");
        println!("  HASS_ALLOWED_DOMAINS           Comma list of cached domains (default: all)");
        println!("  HASS_RATE_LIMIT                Requests per caller per window (default: 100)");
        println!("  RUST_LOG                       Log level (default: info)");
        return Ok(());
    }

    // Setup logging based on mode
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if pretty_mode {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // stdout stays free for the orchestrator
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Home Assistant MCP Core v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let stats_interval = config.stats_interval;
    let client = HassClient::new(config)?;
    let mut lifecycle = client.lifecycle();

    client.connect().await?;

    if check_mode {
        println!("{}", serde_json::to_string_pretty(&client.stats())?);
        client.shutdown().await;
        return Ok(());
    }

    let mut stats = tokio::time::interval(stats_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = lifecycle.recv() => match event {
                Some(event @ hass_mcp::LifecycleEvent::PermanentlyDisconnected { .. }) => {
                    error!("{}", event);
                    break;
                }
                Some(event) => info!("Lifecycle: {}", event),
                None => {
                    warn!("Lifecycle stream closed");
                    break;
                }
            },
            _ = stats.tick() => {
                let stats = client.stats();
                info!(
                    state = %stats.connection_state,
                    entities = stats.cache_size,
                    queue = stats.queue_depth,
                    pending = stats.pending_requests,
                    "Link stats"
                );
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
