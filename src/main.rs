use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chatrelay::broker::{self, BrokerServer};
use chatrelay::chat::{BridgeSettings, ChatRelay, SqlChatStore};
use chatrelay::profile::ProfileClient;
use chatrelay::web::{AppState, WebServer};
use chatrelay::{Config, Database, TokenVerifier};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = chatrelay::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        chatrelay::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = run(config).await {
        error!("Fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> chatrelay::Result<()> {
    config.validate()?;

    info!("chatrelay starting");
    info!(
        "Server configured on {}:{}",
        config.server.host, config.server.port
    );

    let db = Database::open(&config.database.path).await?;
    info!("Database opened at {}", config.database.path);

    let shutdown = CancellationToken::new();

    let broker_task = if config.broker.serve {
        let server = BrokerServer::bind(&config.broker.address).await?;
        info!("Embedded broker listening on {}", server.local_addr()?);
        Some(server.spawn(shutdown.clone()))
    } else {
        None
    };

    let broker = broker::from_config(&config.broker);
    let verifier = TokenVerifier::from_config(&config.auth)?;
    let relay = ChatRelay::new(
        broker,
        Arc::new(SqlChatStore::new(db.clone())),
        verifier,
        config.chat.clone(),
        BridgeSettings::from(&config.broker),
    );
    let profiles = ProfileClient::new(&config.profile)?;

    let server = WebServer::new(&config, AppState::new(db, relay.clone(), profiles))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    // Close live sockets before the HTTP server drains, or graceful shutdown
    // would wait on them forever.
    let relay_for_shutdown = relay.clone();
    let web_shutdown = shutdown.clone();
    let result = server
        .run(async move {
            web_shutdown.cancelled().await;
            relay_for_shutdown.shutdown().await;
        })
        .await;

    shutdown.cancel();
    if let Some(task) = broker_task {
        let _ = task.await;
    }

    info!("chatrelay stopped");
    result
}
