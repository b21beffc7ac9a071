//! Corkboard relay: fans board mutations and presence out to every client
//! viewing the same board.
//!
//! Configuration comes from the environment:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `CORKBOARD_BIND_ADDR` | `127.0.0.1:5000` |
//! | `CORKBOARD_MAX_MEMBERS` | `100` |
//! | `CORKBOARD_BROADCAST_CAPACITY` | `256` |
//! | `CORKBOARD_HEARTBEAT_SECS` | `30` |
//! | `CORKBOARD_CREDENTIALS` | `credentials.json` |
//!
//! The credentials file maps bearer tokens to users:
//! `{"<token>": {"userId": 1, "username": "ana"}}`.

use log::info;

use corkboard_collab::server::{BoxError, RelayServer, ServerConfig, StaticCredentials};

const DEFAULT_CREDENTIALS: &str = "credentials.json";

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    let path = std::env::var("CORKBOARD_CREDENTIALS").unwrap_or_else(|_| DEFAULT_CREDENTIALS.to_string());
    let credentials = StaticCredentials::from_file(&path)?;
    if credentials.is_empty() {
        log::warn!("{path} holds no credentials; every handshake will be refused");
    }
    info!("Loaded {} credentials from {path}", credentials.len());

    RelayServer::new(config, credentials).run().await
}
