use std::env;

const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database connection URL; documents live in memory when unset
    pub database_url: Option<String>,
    /// Per-document relay buffer, in events
    pub broadcast_capacity: usize,
    /// Drop a document from memory once its last session leaves
    pub evict_on_last_disconnect: bool,
    /// Largest WebSocket message accepted from a client, in bytes
    pub max_message_size: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "1234".to_string())
            .parse()?;
        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());
        let broadcast_capacity = env::var("BROADCAST_CAPACITY")
            .unwrap_or_else(|_| "256".to_string())
            .parse()?;
        let evict_on_last_disconnect = env::var("EVICT_ON_LAST_DISCONNECT")
            .unwrap_or_else(|_| "true".to_string())
            .parse()?;
        let max_message_size = env::var("MAX_MESSAGE_SIZE")
            .unwrap_or_else(|_| DEFAULT_MAX_MESSAGE_SIZE.to_string())
            .parse()?;

        Ok(Self {
            host,
            port,
            database_url,
            broadcast_capacity,
            evict_on_last_disconnect,
            max_message_size,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1234,
            database_url: None,
            broadcast_capacity: 256,
            evict_on_last_disconnect: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}
