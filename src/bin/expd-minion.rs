// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use expd::cmd::MinionDaemon;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let layer = fmt::layer().compact().with_target(false).with_timer(false).without_time();
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();
    tracing_subscriber::registry().with(filter).with(layer).init();

    let daemon = MinionDaemon::parse();
    if !daemon.config_exists() {
        tracing::error!("Configuration file {:?} does not exist", daemon.config);
        std::process::exit(3);
    }

    if let Err(error) = daemon.run().await {
        tracing::error!("{error:?}");
        std::process::exit(1);
    }

    std::process::exit(0);
}
