// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Executor for schema changes and instance restarts on TenDB clusters.

use std::process;

use dbm_ore::cli;
use dbm_ore::tracing::{StderrLogConfig, TracingConfig};
use tracing::info;

mod online_ddl;
mod restart;

/// Executes online schema changes and restarts on TenDB clusters.
#[derive(clap::Parser, Debug)]
#[clap(name = "dbm-ddl-executor")]
struct Args {
    /// Which log messages to emit, as a comma separated list of filter
    /// directives.
    #[clap(
        long,
        env = "DBM_LOG_FILTER",
        value_name = "FILTER",
        default_value = "info",
        global = true
    )]
    log_filter: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Applies a change batch to a cluster.
    OnlineDdl(online_ddl::OnlineDdlArgs),
    /// Restarts local MySQL instances one at a time.
    Restart(restart::RestartArgs),
}

#[tokio::main]
async fn main() {
    let args: Args = cli::parse_args();
    if let Err(err) = run(args).await {
        eprintln!("dbm-ddl-executor: fatal: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    dbm_ore::tracing::configure(
        "dbm-ddl-executor",
        TracingConfig {
            stderr_log: StderrLogConfig::from_directives(None, &args.log_filter)?,
        },
    )?;
    info!("invocation: {}", dbm_ore::process::invocation("DBM_"));

    match args.command {
        Command::OnlineDdl(args) => online_ddl::run(args).await,
        Command::Restart(args) => restart::run(args).await,
    }
}
