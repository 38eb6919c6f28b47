// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `online-ddl` subcommand.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dbm_mysql_util::{DEFAULT_TCP_KEEPALIVE, TimeoutConfig};
use dbm_ore::cli::KeyValueArg;
use dbm_ore::error::ErrorExt;
use dbm_tendbcluster_ddl::batch::ChangeBatch;
use dbm_tendbcluster_ddl::migrator::{GhostMigrator, MigrationConfig, default_parallelism};
use dbm_tendbcluster_ddl::session::MySqlConnector;
use dbm_tendbcluster_ddl::topology::{self, Credentials, Instance, InstanceRole};
use dbm_tendbcluster_ddl::{Orchestrator, OrchestratorConfig};
use rand::Rng;
use tracing::{error, info, warn};

/// A `HOST:PORT` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Endpoint, String> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| "must have format HOST:PORT".to_string())?;
        if host.is_empty() {
            return Err("must have format HOST:PORT".into());
        }
        let port = port.parse().map_err(|e| format!("parsing port: {e}"))?;
        Ok(Endpoint {
            host: host.into(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(clap::Args, Debug)]
pub struct OnlineDdlArgs {
    /// The cluster's coordinator.
    #[clap(long, env = "DBM_DDL_COORDINATOR", value_name = "HOST:PORT")]
    pub coordinator: Endpoint,
    /// Administrative user on the coordinator and maintenance routers.
    #[clap(long, env = "DBM_DDL_USER", value_name = "USER")]
    pub user: String,
    #[clap(long, env = "DBM_DDL_PASSWORD", value_name = "PASSWORD", hide_env_values = true)]
    pub password: String,
    /// Operator-only routers that the catalogue does not list. May be
    /// repeated.
    #[clap(long, env = "DBM_DDL_MAINTENANCE_ROUTER", value_name = "HOST:PORT", value_delimiter = ',')]
    pub maintenance_router: Vec<Endpoint>,

    /// JSON document describing the change batch.
    #[clap(long, env = "DBM_DDL_BATCH", value_name = "PATH")]
    pub batch: PathBuf,
    /// Directory the batch's SQL files are relative to.
    #[clap(long, env = "DBM_DDL_SQL_DIR", value_name = "PATH", default_value = ".")]
    pub sql_dir: PathBuf,
    /// Where to record the equivalent gh-ost invocations. Defaults to
    /// `ddl-<BILL_ID>.cmd` in the SQL directory.
    #[clap(long, env = "DBM_DDL_COMMAND_LOG", value_name = "PATH")]
    pub command_log: Option<PathBuf>,
    /// Overrides the batch's bill id. A random one is used when neither is
    /// set.
    #[clap(long, env = "DBM_DDL_BILL_ID", value_name = "ID")]
    pub bill_id: Option<u64>,

    /// Shards migrated at once. Defaults to half the available CPUs.
    #[clap(long, env = "DBM_DDL_PARALLELISM", value_name = "N")]
    pub parallelism: Option<usize>,
    /// JSON file with gh-ost options.
    #[clap(long, env = "DBM_DDL_MIGRATION_CONFIG", value_name = "PATH")]
    pub migration_config: Option<PathBuf>,
    /// A single gh-ost option, applied on top of the config file. May be
    /// repeated.
    #[clap(long, value_name = "KEY=VALUE")]
    pub migration_option: Vec<KeyValueArg<String, String>>,
    /// Path to the gh-ost binary.
    #[clap(long, env = "DBM_DDL_GHOST_BINARY", value_name = "PATH")]
    pub ghost_binary: Option<PathBuf>,
    /// Directory for gh-ost control sockets.
    #[clap(long, env = "DBM_DDL_SOCKET_DIR", value_name = "PATH")]
    pub socket_dir: Option<PathBuf>,
    /// Directory searched for per-task override files on SIGHUP.
    #[clap(long, env = "DBM_DDL_RELOAD_DIR", value_name = "PATH")]
    pub reload_dir: Option<PathBuf>,

    /// Connection timeout for every session.
    #[clap(
        long,
        env = "DBM_DDL_CONNECT_TIMEOUT",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        default_value = "10s"
    )]
    pub connect_timeout: Duration,
}

impl OnlineDdlArgs {
    fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }

    fn migration_config(&self) -> Result<MigrationConfig, anyhow::Error> {
        let mut config = match &self.migration_config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => MigrationConfig::default(),
        };
        if let Some(binary) = &self.ghost_binary {
            config.ghost_binary = binary.clone();
        }
        if let Some(dir) = &self.socket_dir {
            config.socket_dir = dir.clone();
        }
        if let Some(dir) = &self.reload_dir {
            config.reload_dir = Some(dir.clone());
        }
        for option in &self.migration_option {
            config.set(&option.key, &option.value)?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn load_batch(path: &Path) -> Result<ChangeBatch, anyhow::Error> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

fn random_bill_id() -> u64 {
    rand::thread_rng().gen_range(1..1_000_000)
}

pub async fn run(args: OnlineDdlArgs) -> Result<(), anyhow::Error> {
    let batch = load_batch(&args.batch)?;
    let migration = args.migration_config()?;
    let bill_id = match args.bill_id.or(batch.bill_id) {
        Some(id) => id,
        None => {
            let id = random_bill_id();
            warn!(bill_id = id, "batch carries no bill id, generated one");
            id
        }
    };
    let command_log = args
        .command_log
        .clone()
        .unwrap_or_else(|| args.sql_dir.join(format!("ddl-{bill_id}.cmd")));

    let connector = MySqlConnector::new(TimeoutConfig::build(
        args.connect_timeout,
        DEFAULT_TCP_KEEPALIVE,
    ));
    let coordinator = Instance::new(
        "coordinator",
        &args.coordinator.host,
        args.coordinator.port,
        args.credentials(),
        InstanceRole::Coordinator,
    );
    let maintenance: Vec<_> = args
        .maintenance_router
        .iter()
        .map(|e| {
            Instance::new(
                format!("maintenance-{e}"),
                &e.host,
                e.port,
                args.credentials(),
                InstanceRole::RouterMaintenance,
            )
        })
        .collect();
    let topology = topology::resolve(&connector, coordinator, &maintenance).await?;

    let orchestrator = Orchestrator::new(
        Arc::new(connector),
        Arc::new(GhostMigrator),
        topology,
        OrchestratorConfig {
            bill_id,
            sql_dir: args.sql_dir.clone(),
            command_log,
            parallelism: args.parallelism.unwrap_or_else(default_parallelism),
            migration: Arc::new(migration),
        },
    );

    let cancel = orchestrator.cancel_token();
    dbm_ore::task::spawn(|| "ctrl_c_handler", async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling batch");
            cancel.cancel();
        }
    });

    match orchestrator.run(&batch.items).await {
        Ok(report) => {
            info!(bill_id, migrations = report.migrations, "batch succeeded");
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!(bill_id, "batch failed: {}", e.display_with_causes());
            Err(e.into())
        }
    }
}
