// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Command set implementation.
//!
//! This module is the forward facing API of the internal library. Each
//! daemon binary parses its command line here and runs its serve loop until
//! a clean shutdown signal arrives.

use crate::{
    config::{MinionConfig, StorageConfig},
    minion::{ssh::SshSession, ClusterMinion},
    rpc,
    storage::StorageService,
    store::Store,
    Error, Result,
};

use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::info;

/// Storage daemon CLI.
#[derive(Debug, Clone, Parser)]
#[command(about, override_usage = "expd-storage -c <config.json>", version)]
pub struct StorageDaemon {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long = "cfg", value_name = "config.json")]
    pub config: PathBuf,
}

impl StorageDaemon {
    /// Whether the configured file exists at all.
    pub fn config_exists(&self) -> bool {
        self.config.is_file()
    }

    /// Serve the storage core until shutdown.
    ///
    /// # Errors
    ///
    /// - Will fail if configuration, startup reconciliation, or the bind
    ///   fails; serve-loop failures also surface here.
    pub async fn run(self) -> Result<()> {
        let config = StorageConfig::load(&self.config)?;
        let listen = config.listen.clone();
        let heartbeat = Duration::from_secs(config.heartbeat_secs);

        let store = Store::open_in_memory().await?;
        let service = Arc::new(StorageService::open(config, store).await?);
        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|error| Error::Transport(format!("cannot bind {listen}: {error}")))?;

        tokio::select! {
            result = rpc::serve(listener, service, heartbeat) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Storage daemon shutting down");
                Ok(())
            }
        }
    }
}

/// Cluster minion daemon CLI.
#[derive(Debug, Clone, Parser)]
#[command(about, override_usage = "expd-minion -c <config.json>", version)]
pub struct MinionDaemon {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long = "cfg", value_name = "config.json")]
    pub config: PathBuf,
}

impl MinionDaemon {
    /// Whether the configured file exists at all.
    pub fn config_exists(&self) -> bool {
        self.config.is_file()
    }

    /// Serve the cluster minion until shutdown. The SSH session opens lazily
    /// on the first `login` call.
    ///
    /// # Errors
    ///
    /// - Will fail if configuration or the bind fails; serve-loop failures
    ///   also surface here.
    pub async fn run(self) -> Result<()> {
        let config = MinionConfig::load(&self.config)?;
        let listen = config.listen.clone();
        let heartbeat = Duration::from_secs(config.heartbeat_secs);
        let deadline = config.op_timeout_secs.map(Duration::from_secs);

        let store = Store::open_in_memory().await?;
        let shell = SshSession::new(deadline);
        let minion = Arc::new(ClusterMinion::open(config, store, shell).await?);
        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|error| Error::Transport(format!("cannot bind {listen}: {error}")))?;

        let result = tokio::select! {
            result = rpc::serve(listener, Arc::clone(&minion), heartbeat) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Minion daemon shutting down");
                Ok(())
            }
        };

        minion.logout().await?;

        result
    }
}
