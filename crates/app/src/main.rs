//! Switchboard - WebSocket event server
//!
//! Loads the TOML config, sets up logging, registers the demo handlers and
//! runs the server until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use switchboard_core::{Config, FrameErrorAction, ServerConfig};
use switchboard_net::{Client, FrameErrorPolicy, Server, ServerOptions};
use thiserror::Error;
use tracing::{debug, error, info, warn};

mod handlers;
mod logging;

/// How long `probe` waits for each reply
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
enum AppError {
    #[error("{0}")]
    Config(#[from] switchboard_core::Error),

    #[error("{0}")]
    Net(#[from] switchboard_net::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Probe failed: {0}")]
    Probe(String),
}

type Result<T> = std::result::Result<T, AppError>;

#[derive(Parser, Debug)]
#[command(version, about = "Switchboard WebSocket server", long_about = None)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `server.host`
    #[arg(long, global = true)]
    host: Option<String>,

    /// Override `server.port`
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Commands {
    /// Run the server until Ctrl-C
    Start,
    /// Print the effective configuration
    CheckConfig,
    /// Connect to a running server and exchange one message
    Probe {
        #[arg(long, default_value = "ws://127.0.0.1:8080/")]
        url: String,

        #[arg(long, default_value = "message")]
        event: String,

        #[arg(long, default_value = "hello")]
        message: String,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let cmd = args.cmd.clone().unwrap_or(Commands::Start);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Only the server writes a log file
    let file_dir = match (&cmd, config.log.enabled) {
        (Commands::Start, true) => match config.log.dir() {
            Ok(dir) => Some(dir),
            Err(e) => {
                eprintln!("Failed to resolve log directory: {}", e);
                return ExitCode::FAILURE;
            }
        },
        _ => None,
    };
    let _log_guard = match logging::init(&config.log, file_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cmd {
            Commands::Start => start(config).await,
            Commands::CheckConfig => check_config(&config),
            Commands::Probe { url, event, message } => probe(&url, &event, &message).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Resolve the config file and apply command-line overrides
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path()?)?,
    };

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;
    Ok(config)
}

fn server_options(config: &ServerConfig) -> ServerOptions {
    ServerOptions {
        max_clients: config.max_clients,
        idle_timeout: config.idle_timeout(),
        poll_interval: config.poll_interval(),
        read_buffer_size: config.read_buffer_size,
        outbound_capacity: config.outbound_capacity,
        handshake_timeout: config.handshake_timeout(),
        frame_error_policy: match config.frame_error_policy {
            FrameErrorAction::Close => FrameErrorPolicy::Close,
            FrameErrorAction::Drop => FrameErrorPolicy::Drop,
        },
        ..ServerOptions::default()
    }
}

async fn start(config: Config) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Switchboard");

    for feature in config.inert_features() {
        warn!(feature, "Configured feature is not supported and will be ignored");
    }
    debug!(
        interval_secs = config.heartbeat.interval_secs,
        timeout_secs = config.heartbeat.timeout_secs,
        "Heartbeat settings are not applied; idle timeout governs dead peers"
    );

    let mut server = Server::bind(config.server.bind_addr(), server_options(&config.server)).await?;
    handlers::register(&mut server, &config.rooms);

    let running = server.start();
    if let Some(addr) = running.addr() {
        info!(addr = %addr, "Switchboard running, press Ctrl-C to stop");
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    running.stop().await;
    info!("Switchboard stopped");
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    print!("{}", config.to_toml_string()?);
    for feature in config.inert_features() {
        eprintln!("note: [{}] is enabled but has no effect", feature);
    }
    Ok(())
}

async fn probe(url: &str, event: &str, message: &str) -> Result<()> {
    let mut client = Client::connect(url).await?;

    let welcome = tokio::time::timeout(PROBE_TIMEOUT, client.next_json())
        .await
        .map_err(|_| AppError::Probe("no welcome message".into()))??
        .ok_or_else(|| AppError::Probe("server closed the connection".into()))?;
    println!("{}", welcome);

    client.send_event(event, json!({ "message": message })).await?;
    match tokio::time::timeout(PROBE_TIMEOUT, client.next_json()).await {
        Ok(reply) => match reply? {
            Some(reply) => println!("{}", reply),
            None => println!("server closed the connection"),
        },
        Err(_) => println!("no reply to '{}'", event),
    }

    client.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_cli_parsing() {
        let parsed = args(&["switchboard"]);
        assert_eq!(parsed.cmd, None);

        let parsed = args(&["switchboard", "--port", "9000", "check-config"]);
        assert_eq!(parsed.port, Some(9000));
        assert_eq!(parsed.cmd, Some(Commands::CheckConfig));

        let parsed = args(&["switchboard", "probe", "--event", "broadcast"]);
        assert_eq!(
            parsed.cmd,
            Some(Commands::Probe {
                url: "ws://127.0.0.1:8080/".into(),
                event: "broadcast".into(),
                message: "hello".into(),
            })
        );
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("switchboard.toml");
        fs::write(&path, "[server]\nport = 7000\nframe_error_policy = \"drop\"\n").unwrap();
        let path_str = path.to_str().unwrap();

        let config = load_config(&args(&["switchboard", "--config", path_str])).unwrap();
        assert_eq!(config.server.port, 7000);

        let config = load_config(&args(&[
            "switchboard",
            "--config",
            path_str,
            "--host",
            "127.0.0.1",
            "--port",
            "7100",
        ]))
        .unwrap();
        assert_eq!(config.server.bind_addr(), "127.0.0.1:7100");

        let options = server_options(&config.server);
        assert_eq!(options.frame_error_policy, FrameErrorPolicy::Drop);
        assert_eq!(options.max_clients, 100);
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.toml");
        let result = load_config(&args(&["switchboard", "--config", missing.to_str().unwrap()]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_override_is_validated() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("switchboard.toml");
        fs::write(&path, "").unwrap();
        let result = load_config(&args(&[
            "switchboard",
            "--config",
            path.to_str().unwrap(),
            "--host",
            " ",
        ]));
        assert!(matches!(
            result,
            Err(AppError::Config(switchboard_core::Error::InvalidConfig(_)))
        ));
    }
}
