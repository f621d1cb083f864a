//! Murmur server -- real-time one-to-one messaging over WebSockets.
//!
//! # Usage
//!
//! ```bash
//! # Development: static tokens, in-memory store
//! cargo run --bin murmur-server -- --static-token t-alice=alice --static-token t-bob=bob
//!
//! # Production-ish: JWT auth, SQLite persistence
//! MURMUR_JWT_SECRET=... cargo run --bin murmur-server -- --database-path murmur.db
//! ```

use std::sync::Arc;

use clap::Parser;
use murmur_server::config::{ServerCliArgs, ServerConfig};
use murmur_server::engine::ChatEngine;
use murmur_server::gateway::{self, GatewayState};
use murmur_server::identity::ConfiguredVerifier;
use murmur_server::presence::PresenceRegistry;
use murmur_server::sqlite::SqliteStore;
use murmur_server::store::{InMemoryStore, MessageStore, seed_missing_users};

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let verifier = match config.verifier() {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "cannot start without an identity verifier");
            std::process::exit(1);
        }
    };

    tracing::info!(
        addr = %config.bind_addr,
        persistent = config.database_path.is_some(),
        jwt = config.jwt_secret.is_some(),
        "starting murmur server"
    );

    match &config.database_path {
        Some(path) => match SqliteStore::open(path) {
            Ok(store) => serve(store, verifier, &config).await,
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "failed to open database");
                std::process::exit(1);
            }
        },
        None => serve(InMemoryStore::new(), verifier, &config).await,
    }
}

async fn serve<S>(store: S, verifier: ConfiguredVerifier, config: &ServerConfig)
where
    S: MessageStore + 'static,
{
    // Static-token users are known before they first connect.
    match seed_missing_users(&store, config.static_tokens.values()).await {
        Ok(seeded) => tracing::debug!(seeded, "seeded static-token users"),
        Err(e) => tracing::warn!(error = %e, "failed to seed static-token users"),
    }

    let engine = ChatEngine::new(
        Arc::new(store),
        Arc::new(PresenceRegistry::new()),
        config.engine_config(),
    );
    let state = Arc::new(GatewayState::new(engine, verifier, config.gateway_config()));

    match gateway::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "murmur server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }
}
