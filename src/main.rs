use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

use localcomm::{
    config::Config,
    constants::*,
    network::{LocalClient, LocalClientListener, LocalClientsManager},
    objs::RemoteObject,
    LocalCommError,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "LocalComm service host: discovers local objects and keeps them connected")]
struct Args {
    /// Optional path to config file (TOML)
    #[arg(short, long)]
    config: Option<String>,
}

/// Prints connectivity changes for the operator.
struct ConsoleReport;

impl LocalClientListener for ConsoleReport {
    fn on_local_connected(&self, obj: &RemoteObject, client: &LocalClient) {
        println!(
            "{}Object {} connected via {} ({:?})",
            ICON_PLACEHOLDER,
            obj.id(),
            client.remote_addr(),
            client.security_level()
        );
    }

    fn on_local_connection_error(&self, client: &LocalClient, cause: &LocalCommError) {
        eprintln!("⚠️ Connection to {} failed: {}", client.remote_addr(), cause);
    }

    fn on_local_disconnected(&self, obj: &RemoteObject, client: &LocalClient) {
        println!(
            "{}Object {} disconnected ({})",
            ICON_PLACEHOLDER,
            obj.id(),
            client.disconnection_reason()
        );
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| "config.toml".to_string());
    let config = if Path::new(&config_path).exists() {
        match Config::load(&config_path) {
            Ok(cfg) => {
                println!("{}Loaded config from: {}", ICON_PLACEHOLDER, config_path);
                cfg
            }
            Err(err) => {
                eprintln!("❌ Failed to load config file '{}': {}", config_path, err);
                std::process::exit(1);
            }
        }
    } else {
        println!(
            "⚠️ No config file found at '{}', falling back to default config.",
            config_path
        );
        Config::default()
    };

    // Events first so manager construction is logged with the configured sinks
    localcomm::events::init_events_from_config(config.logging.as_ref()).await;

    let app_name = config
        .service
        .name
        .clone()
        .unwrap_or_else(|| DEFAULT_APP_NAME.to_string());
    println!(
        "{}{} {} as {}",
        ICON_PLACEHOLDER,
        app_name,
        full_version(),
        config.service.full_id
    );

    let manager = match LocalClientsManager::from_config(&config) {
        Ok(m) => m,
        Err(err) => {
            eprintln!("❌ Failed to set up local clients: {}", err);
            std::process::exit(1);
        }
    };
    manager.add_client_listener(Arc::new(ConsoleReport));

    if let Err(err) = manager.start().await {
        eprintln!("❌ Failed to start local clients: {}", err);
        std::process::exit(1);
    }

    if let Err(err) = signal::ctrl_c().await {
        eprintln!("⚠️ Failed to wait for Ctrl+C: {}", err);
    }
    println!("{}Shutting down...", ICON_PLACEHOLDER);
    if let Err(err) = manager.stop().await {
        eprintln!("⚠️ Shutdown incomplete: {}", err);
    }
    if let Some(d) = localcomm::events::EventDispatcher::global() {
        d.flush().await;
    }
}
