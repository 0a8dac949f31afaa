//! Command-line and environment configuration for the ledger shell.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::storage::{JsonFileStorage, SledStorage, Storage, StorageError};

/// Where the ledger snapshot is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Backend {
    /// One JSON file, replaced atomically on every write.
    #[default]
    Json,
    /// A sled database directory.
    Sled,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "ledgerchain", version, about = "Append-only, hash-linked account ledger")]
pub struct Cli {
    /// Ledger file (json backend) or database directory (sled backend).
    #[arg(long, env = "LEDGERCHAIN_DATA", default_value = "ledger.json")]
    pub data: PathBuf,

    #[arg(long, value_enum, env = "LEDGERCHAIN_BACKEND", default_value_t = Backend::Json)]
    pub backend: Backend,

    /// Identity allowed to add funds. Repeat, or comma-separate in the env var.
    #[arg(long = "admin", env = "LEDGERCHAIN_ADMINS", value_delimiter = ',')]
    pub admins: Vec<String>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn is_admin(&self, id: &str) -> bool {
        self.admins.iter().any(|admin| admin == id)
    }

    pub fn open_storage(&self) -> Result<Arc<dyn Storage>, StorageError> {
        let storage: Arc<dyn Storage> = match self.backend {
            Backend::Json => Arc::new(JsonFileStorage::new(&self.data)),
            Backend::Sled => Arc::new(SledStorage::new(&self.data)?),
        };
        Ok(storage)
    }
}

/// Install the global subscriber. Logs go to stderr so the shell's stdout
/// carries only command output.
pub fn init_tracing(default_filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}
