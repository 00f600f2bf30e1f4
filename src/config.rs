// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration model.
//!
//! Handles the loading and deserialization of the JSON configuration files
//! both daemons are launched with. Filesystem paths go through full shell
//! expansion so `~` and environment variables behave as an operator would
//! expect from a daemon config.

use crate::{Error, Result};

use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration for the storage daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory housing one git repository per application.
    pub appstorage: PathBuf,

    /// Directory housing staged input trees, one per experiment.
    pub inputstorage: PathBuf,

    /// Directory housing retrieved output trees, one per experiment.
    pub outputstorage: PathBuf,

    /// Public host (or host:port) clients use to reach this storage.
    pub public_url: String,

    /// Account name used in scp-style URLs handed to clients.
    pub username: String,

    /// Document-store connection string.
    pub mongo: String,

    /// Document-store database name.
    pub db: String,

    /// RPC bind address.
    #[serde(default = "default_storage_listen")]
    pub listen: String,

    /// Substitute labels through the whole checkout instead of only its
    /// top-level regular files.
    #[serde(default)]
    pub recursive_substitution: bool,

    /// Seconds between RPC heartbeat frames on idle connections.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl StorageConfig {
    /// Load storage configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Config`] if the file is unreadable or malformed.
    /// - Return [`Error::InvalidInput`] if a storage path fails expansion.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg: StorageConfig = Config::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Json))
            .build()?
            .try_deserialize()?;

        cfg.appstorage = expand_path(&cfg.appstorage)?;
        cfg.inputstorage = expand_path(&cfg.inputstorage)?;
        cfg.outputstorage = expand_path(&cfg.outputstorage)?;

        Ok(cfg)
    }

    /// Create the storage directories if they are missing.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if a directory cannot be created.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.appstorage, &self.inputstorage, &self.outputstorage] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(())
    }
}

/// Configuration for the cluster minion daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct MinionConfig {
    /// SSH endpoint of the cluster front-end. A scheme prefix is tolerated.
    pub url: String,

    /// Account name on the cluster front-end.
    pub username: String,

    /// Optional password. Key-agent authentication is the default.
    #[serde(default)]
    pub password: Option<String>,

    /// Document-store connection string.
    pub mongo: String,

    /// Document-store database name.
    pub db: String,

    /// RPC bind address.
    #[serde(default = "default_minion_listen")]
    pub listen: String,

    /// Optional per-operation deadline in seconds. When it elapses the SSH
    /// channel is closed and the caller sees a timeout error.
    #[serde(default)]
    pub op_timeout_secs: Option<u64>,

    /// Seconds between RPC heartbeat frames on idle connections.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl MinionConfig {
    /// Load minion configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Config`] if the file is unreadable or malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let cfg: MinionConfig = Config::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Json))
            .build()?
            .try_deserialize()?;

        Ok(cfg)
    }

    /// SSH endpoint this minion logs into.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] if the configured URL is empty once
    ///   the scheme prefix is stripped.
    pub fn endpoint(&self) -> Result<SshEndpoint> {
        SshEndpoint::parse(&self.url, &self.username, self.password.clone())
    }
}

/// Parsed SSH endpoint of a cluster front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    /// Host name or address of the front-end.
    pub host: String,

    /// Optional non-standard port.
    pub port: Option<u16>,

    /// Login account.
    pub username: String,

    /// Optional password handed to the authentication helper.
    pub password: Option<String>,
}

impl SshEndpoint {
    /// Parse an endpoint out of a configured URL.
    ///
    /// Accepts bare `host`, `host:port`, and scheme-prefixed forms like
    /// `ssh://host:port`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] if no host remains after stripping.
    pub fn parse(url: &str, username: &str, password: Option<String>) -> Result<Self> {
        let trimmed = match url.split_once("://") {
            Some((_, rest)) => rest,
            None => url,
        };
        let trimmed = trimmed.trim_end_matches('/');

        let (host, port) = match trimmed.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidInput(format!("bad port in url {url:?}")))?;
                (host.to_string(), Some(port))
            }
            _ => (trimmed.to_string(), None),
        };

        if host.is_empty() {
            return Err(Error::InvalidInput(format!("no host in url {url:?}")));
        }

        Ok(Self { host, port, username: username.into(), password })
    }

    /// The `user@host` destination handed to the ssh binary.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(raw.as_ref())
        .map_err(|error| Error::InvalidInput(format!("cannot expand {raw:?}: {error}")))?;

    Ok(PathBuf::from(expanded.into_owned()))
}

fn default_storage_listen() -> String {
    "0.0.0.0:8237".into()
}

fn default_minion_listen() -> String {
    "0.0.0.0:8238".into()
}

fn default_heartbeat_secs() -> u64 {
    30
}
