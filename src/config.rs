use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::storage::{Schema, StoreLocation, DEFAULT_STATEMENT_TIMEOUT};

pub const DEFAULT_DATABASE_URL: &str = "./chat.db";
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8080";

/// Process settings, read from the environment (and `.env` via `dotenv`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database: StoreLocation,
    pub schema: Schema,
    pub server_addr: String,
    pub statement_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Config::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database = StoreLocation::parse(&lookup("DATABASE_URL").unwrap_or(DEFAULT_DATABASE_URL.to_string()));
        let schema = match lookup("SCHEMA_PATH") {
            Some(path) => Schema::File(PathBuf::from(path)),
            None => Schema::Embedded,
        };
        let server_addr = lookup("SERVER_ADDR").unwrap_or(DEFAULT_SERVER_ADDR.to_string());
        let statement_timeout = match lookup("STATEMENT_TIMEOUT_MS") {
            Some(raw) => {
                let millis: u64 = raw
                    .parse()
                    .with_context(|| format!("STATEMENT_TIMEOUT_MS must be milliseconds, got '{}'", raw))?;
                if millis == 0 {
                    bail!("STATEMENT_TIMEOUT_MS must be positive");
                }
                Duration::from_millis(millis)
            }
            None => DEFAULT_STATEMENT_TIMEOUT,
        };

        Ok(Config {
            database,
            schema,
            server_addr,
            statement_timeout,
        })
    }
}
